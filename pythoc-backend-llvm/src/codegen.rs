//! Textual LLVM IR emission.
//!
//! The emitter walks validated module IR and prints LLVM assembly with
//! opaque pointers. Constants become immediates at their use sites; string
//! literals become private globals.

use std::collections::HashMap;
use std::fmt::Write as _;

use miette::Diagnostic;
use pythoc_ir::{
    BinOp, Block, CastKind, CmpOp, ConstVal, Function, Inst, Module, Terminator, Type, ValueId,
};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("LLVM backend error: {message}")]
#[diagnostic(code(pythoc::backend_llvm))]
pub struct LlvmBackendError {
    pub message: String,
}

fn backend_err(message: impl Into<String>) -> LlvmBackendError {
    LlvmBackendError {
        message: message.into(),
    }
}

pub struct LlvmArtifacts {
    pub llvm_ir: String,
}

/// Emit LLVM IR text for a whole module.
pub fn emit_llvm_ir(module: &Module) -> Result<LlvmArtifacts, LlvmBackendError> {
    pythoc_ir::validate(module).map_err(|e| backend_err(format!("IR validation failed: {e}")))?;

    let triple = target_lexicon::HOST.to_string();
    let mut out = String::new();
    out.push_str("; ModuleID = 'pythoc'\n");
    out.push_str("source_filename = \"pythoc\"\n");
    let _ = writeln!(out, "target triple = \"{triple}\"\n");

    for (name, sig) in &module.externs {
        let params = sig
            .params
            .iter()
            .map(type_str)
            .collect::<Vec<_>>()
            .join(", ");
        let variadic = if sig.variadic {
            if params.is_empty() { "..." } else { ", ..." }
        } else {
            ""
        };
        if let Some(lib) = &sig.lib {
            let _ = writeln!(out, "; extern from lib \"{lib}\"");
        }
        let _ = writeln!(
            out,
            "declare {} @{name}({params}{variadic})",
            type_str(&sig.ret)
        );
    }
    if !module.externs.is_empty() {
        out.push('\n');
    }

    let mut globals = Globals::default();
    for f in module.functions.values() {
        emit_function(&mut out, f, &mut globals)?;
        out.push('\n');
    }
    for g in globals.lines {
        out.push_str(&g);
        out.push('\n');
    }

    Ok(LlvmArtifacts { llvm_ir: out })
}

#[derive(Default)]
struct Globals {
    lines: Vec<String>,
    next_str: usize,
}

impl Globals {
    fn intern_str(&mut self, s: &str) -> String {
        let name = format!("@.str.{}", self.next_str);
        self.next_str += 1;
        let mut encoded = String::new();
        for b in s.bytes() {
            match b {
                b'"' | b'\\' => {
                    let _ = write!(encoded, "\\{b:02X}");
                }
                0x20..=0x7e => encoded.push(b as char),
                _ => {
                    let _ = write!(encoded, "\\{b:02X}");
                }
            }
        }
        self.lines.push(format!(
            "{name} = private unnamed_addr constant [{} x i8] c\"{encoded}\\00\"",
            s.len() + 1
        ));
        name
    }
}

pub(crate) fn type_str(ty: &Type) -> String {
    match ty {
        Type::Int { bits, .. } => format!("i{bits}"),
        Type::Float { bits: 16, brain: true } => "bfloat".to_string(),
        Type::Float { bits: 16, .. } => "half".to_string(),
        Type::Float { bits: 32, .. } => "float".to_string(),
        Type::Float { bits: 64, .. } => "double".to_string(),
        Type::Float { .. } => "fp128".to_string(),
        Type::Bool => "i1".to_string(),
        Type::Void => "void".to_string(),
        Type::Ptr => "ptr".to_string(),
        Type::Array { elem, len } => format!("[{len} x {}]", type_str(elem)),
        Type::Struct { fields, .. } => {
            let fs = fields.iter().map(type_str).collect::<Vec<_>>().join(", ");
            format!("{{ {fs} }}")
        }
    }
}

struct FnEmitter<'a> {
    operands: HashMap<ValueId, String>,
    globals: &'a mut Globals,
}

impl<'a> FnEmitter<'a> {
    fn operand(&self, v: ValueId) -> Result<&str, LlvmBackendError> {
        self.operands
            .get(&v)
            .map(String::as_str)
            .ok_or_else(|| backend_err(format!("operand {v:?} has no definition")))
    }

    fn define(&mut self, v: ValueId, text: String) {
        self.operands.insert(v, text);
    }
}

fn emit_function(
    out: &mut String,
    f: &Function,
    globals: &mut Globals,
) -> Result<(), LlvmBackendError> {
    let mut e = FnEmitter {
        operands: HashMap::new(),
        globals,
    };
    let mut params = Vec::new();
    for (i, (_name, ty)) in f.params.iter().enumerate() {
        if ty.is_void() {
            // Zero-width parameters were erased; stray uses of their ids
            // fail loudly in operand lookup.
            continue;
        }
        let reg = format!("%arg{i}");
        params.push(format!("{} {reg}", type_str(ty)));
        e.define(ValueId(i as u32), reg);
    }

    let _ = writeln!(
        out,
        "define {} @{}({}) {{",
        type_str(&f.ret),
        f.name,
        params.join(", ")
    );

    // Entry block must come first in the printed form.
    let mut ordered: Vec<&Block> = f.blocks.iter().collect();
    ordered.sort_by_key(|b| (b.id != f.entry, b.id));

    for block in &ordered {
        let _ = writeln!(out, "bb{}:", block.id.0);
        for inst in &block.insts {
            emit_inst(out, inst, &mut e)?;
        }
        emit_terminator(out, &block.term, &e)?;
    }
    out.push_str("}\n");
    Ok(())
}

fn const_text(value: &ConstVal, ty: &Type, e: &mut FnEmitter) -> String {
    match value {
        ConstVal::Int(v) => v.to_string(),
        ConstVal::Bool(b) => b.to_string(),
        // Hexadecimal bit pattern: exact, and valid for every float width
        // whose value round-trips through double.
        ConstVal::Float(v) => format!("0x{:016X}", v.to_bits()),
        ConstVal::Null => "null".to_string(),
        ConstVal::Zero => match ty {
            Type::Int { .. } => "0".to_string(),
            Type::Bool => "false".to_string(),
            Type::Float { .. } => "0.0".to_string(),
            Type::Ptr => "null".to_string(),
            _ => "zeroinitializer".to_string(),
        },
        ConstVal::Str(s) => e.globals.intern_str(s),
    }
}

fn emit_inst(out: &mut String, inst: &Inst, e: &mut FnEmitter) -> Result<(), LlvmBackendError> {
    match inst {
        Inst::Const { dst, ty, value } => {
            let text = const_text(value, ty, e);
            e.define(*dst, text);
        }
        Inst::Alloca { dst, ty, name } => {
            let reg = format!("%v{}", dst.0);
            let _ = writeln!(out, "  {reg} = alloca {} ; {name}", type_str(ty));
            e.define(*dst, reg);
        }
        Inst::Load { dst, ty, addr } => {
            let reg = format!("%v{}", dst.0);
            let addr = e.operand(*addr)?.to_string();
            let _ = writeln!(out, "  {reg} = load {}, ptr {addr}", type_str(ty));
            e.define(*dst, reg);
        }
        Inst::Store { ty, addr, value } => {
            let addr = e.operand(*addr)?.to_string();
            let value = e.operand(*value)?.to_string();
            let _ = writeln!(out, "  store {} {value}, ptr {addr}", type_str(ty));
        }
        Inst::Bin { dst, op, ty, lhs, rhs } => {
            let reg = format!("%v{}", dst.0);
            let opname = bin_op_name(*op, ty);
            let lhs = e.operand(*lhs)?.to_string();
            let rhs = e.operand(*rhs)?.to_string();
            let _ = writeln!(out, "  {reg} = {opname} {} {lhs}, {rhs}", type_str(ty));
            e.define(*dst, reg);
        }
        Inst::Cmp { dst, op, ty, lhs, rhs } => {
            let reg = format!("%v{}", dst.0);
            let lhs = e.operand(*lhs)?.to_string();
            let rhs = e.operand(*rhs)?.to_string();
            let (inst_name, pred) = cmp_name(*op, ty);
            let _ = writeln!(
                out,
                "  {reg} = {inst_name} {pred} {} {lhs}, {rhs}",
                type_str(ty)
            );
            e.define(*dst, reg);
        }
        Inst::FieldAddr { dst, agg, base, index } => {
            let reg = format!("%v{}", dst.0);
            let base = e.operand(*base)?.to_string();
            let _ = writeln!(
                out,
                "  {reg} = getelementptr inbounds {}, ptr {base}, i32 0, i32 {index}",
                type_str(agg)
            );
            e.define(*dst, reg);
        }
        Inst::IndexAddr { dst, elem, base, index } => {
            let reg = format!("%v{}", dst.0);
            let base = e.operand(*base)?.to_string();
            let index = e.operand(*index)?.to_string();
            let _ = writeln!(
                out,
                "  {reg} = getelementptr inbounds {}, ptr {base}, i64 {index}",
                type_str(elem)
            );
            e.define(*dst, reg);
        }
        Inst::Call { dst, callee, ret, args } => {
            let args_s = args
                .iter()
                .map(|(ty, v)| Ok(format!("{} {}", type_str(ty), e.operand(*v)?)))
                .collect::<Result<Vec<_>, LlvmBackendError>>()?
                .join(", ");
            match dst {
                Some(dst) => {
                    let reg = format!("%v{}", dst.0);
                    let _ = writeln!(
                        out,
                        "  {reg} = call {} @{callee}({args_s})",
                        type_str(ret)
                    );
                    e.define(*dst, reg);
                }
                None => {
                    let _ = writeln!(out, "  call {} @{callee}({args_s})", type_str(ret));
                }
            }
        }
        Inst::Cast { dst, kind, from_ty, to_ty, value } => {
            emit_cast(out, *dst, *kind, from_ty, to_ty, *value, e)?;
        }
    }
    Ok(())
}

fn emit_cast(
    out: &mut String,
    dst: ValueId,
    kind: CastKind,
    from_ty: &Type,
    to_ty: &Type,
    value: ValueId,
    e: &mut FnEmitter,
) -> Result<(), LlvmBackendError> {
    let src = e.operand(value)?.to_string();
    let reg = format!("%v{}", dst.0);
    let from_s = type_str(from_ty);
    let to_s = type_str(to_ty);

    let bits_of = |t: &Type| match t {
        Type::Int { bits, .. } => *bits,
        Type::Bool => 1,
        Type::Float { bits, .. } => *bits,
        _ => 0,
    };

    match kind {
        CastKind::IntResize => {
            let fb = bits_of(from_ty);
            let tb = bits_of(to_ty);
            if matches!(to_ty, Type::Bool) && fb > 1 {
                let _ = writeln!(out, "  {reg} = icmp ne {from_s} {src}, 0");
            } else if fb == tb {
                // Same width, signedness only: a no-op at the IR level.
                e.define(dst, src);
                return Ok(());
            } else if fb > tb {
                let _ = writeln!(out, "  {reg} = trunc {from_s} {src} to {to_s}");
            } else if from_ty.is_signed() {
                let _ = writeln!(out, "  {reg} = sext {from_s} {src} to {to_s}");
            } else {
                let _ = writeln!(out, "  {reg} = zext {from_s} {src} to {to_s}");
            }
        }
        CastKind::IntToFloat => {
            let op = if from_ty.is_signed() { "sitofp" } else { "uitofp" };
            let _ = writeln!(out, "  {reg} = {op} {from_s} {src} to {to_s}");
        }
        CastKind::FloatToInt => {
            let op = if to_ty.is_signed() { "fptosi" } else { "fptoui" };
            let _ = writeln!(out, "  {reg} = {op} {from_s} {src} to {to_s}");
        }
        CastKind::FloatResize => {
            let op = if bits_of(from_ty) > bits_of(to_ty) {
                "fptrunc"
            } else {
                "fpext"
            };
            let _ = writeln!(out, "  {reg} = {op} {from_s} {src} to {to_s}");
        }
        CastKind::PtrToInt => {
            let _ = writeln!(out, "  {reg} = ptrtoint ptr {src} to {to_s}");
        }
        CastKind::IntToPtr => {
            let _ = writeln!(out, "  {reg} = inttoptr {from_s} {src} to ptr");
        }
        CastKind::Bit => {
            // Reinterpret through a stack slot; the way union reads lower.
            let slot = format!("%v{}.slot", dst.0);
            let _ = writeln!(out, "  {slot} = alloca {from_s}");
            let _ = writeln!(out, "  store {from_s} {src}, ptr {slot}");
            let _ = writeln!(out, "  {reg} = load {to_s}, ptr {slot}");
        }
    }
    e.define(dst, reg);
    Ok(())
}

fn bin_op_name(op: BinOp, ty: &Type) -> &'static str {
    let float = ty.is_float();
    let signed = ty.is_signed();
    match op {
        BinOp::Add => {
            if float {
                "fadd"
            } else {
                "add"
            }
        }
        BinOp::Sub => {
            if float {
                "fsub"
            } else {
                "sub"
            }
        }
        BinOp::Mul => {
            if float {
                "fmul"
            } else {
                "mul"
            }
        }
        BinOp::Div => {
            if float {
                "fdiv"
            } else if signed {
                "sdiv"
            } else {
                "udiv"
            }
        }
        BinOp::Rem => {
            if float {
                "frem"
            } else if signed {
                "srem"
            } else {
                "urem"
            }
        }
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::Shl => "shl",
        BinOp::Shr => {
            if signed {
                "ashr"
            } else {
                "lshr"
            }
        }
    }
}

fn cmp_name(op: CmpOp, ty: &Type) -> (&'static str, &'static str) {
    if ty.is_float() {
        let pred = match op {
            CmpOp::Eq => "oeq",
            CmpOp::Ne => "one",
            CmpOp::Lt => "olt",
            CmpOp::Gt => "ogt",
            CmpOp::Le => "ole",
            CmpOp::Ge => "oge",
        };
        ("fcmp", pred)
    } else {
        let signed = ty.is_signed();
        let pred = match op {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => {
                if signed {
                    "slt"
                } else {
                    "ult"
                }
            }
            CmpOp::Gt => {
                if signed {
                    "sgt"
                } else {
                    "ugt"
                }
            }
            CmpOp::Le => {
                if signed {
                    "sle"
                } else {
                    "ule"
                }
            }
            CmpOp::Ge => {
                if signed {
                    "sge"
                } else {
                    "uge"
                }
            }
        };
        ("icmp", pred)
    }
}

fn emit_terminator(
    out: &mut String,
    term: &Terminator,
    e: &FnEmitter,
) -> Result<(), LlvmBackendError> {
    match term {
        Terminator::Return(None) => out.push_str("  ret void\n"),
        Terminator::Return(Some((ty, v))) => {
            let _ = writeln!(out, "  ret {} {}", type_str(ty), e.operand(*v)?);
        }
        Terminator::Br(bb) => {
            let _ = writeln!(out, "  br label %bb{}", bb.0);
        }
        Terminator::CondBr { cond, then_bb, else_bb } => {
            let _ = writeln!(
                out,
                "  br i1 {}, label %bb{}, label %bb{}",
                e.operand(*cond)?,
                then_bb.0,
                else_bb.0
            );
        }
        Terminator::Switch { ty, value, cases, default } => {
            let _ = writeln!(
                out,
                "  switch {} {}, label %bb{} [",
                type_str(ty),
                e.operand(*value)?,
                default.0
            );
            for (v, bb) in cases {
                let _ = writeln!(out, "    {} {v}, label %bb{}", type_str(ty), bb.0);
            }
            out.push_str("  ]\n");
        }
        Terminator::Unreachable => out.push_str("  unreachable\n"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pythoc_ir::{BlockId, ExternSig};

    fn simple_module() -> Module {
        let mut m = Module::new();
        m.functions.insert(
            "add_one".into(),
            Function {
                name: "add_one".into(),
                params: vec![("x".into(), Type::i32())],
                ret: Type::i32(),
                entry: BlockId(0),
                blocks: vec![Block {
                    id: BlockId(0),
                    insts: vec![
                        Inst::Const {
                            dst: ValueId(1),
                            ty: Type::i32(),
                            value: ConstVal::Int(1),
                        },
                        Inst::Bin {
                            dst: ValueId(2),
                            op: BinOp::Add,
                            ty: Type::i32(),
                            lhs: ValueId(0),
                            rhs: ValueId(1),
                        },
                    ],
                    term: Terminator::Return(Some((Type::i32(), ValueId(2)))),
                }],
            },
        );
        m
    }

    #[test]
    fn emits_function_with_add() {
        let ir = emit_llvm_ir(&simple_module()).unwrap().llvm_ir;
        assert!(ir.contains("define i32 @add_one(i32 %arg0)"));
        assert!(ir.contains("%v2 = add i32 %arg0, 1"));
        assert!(ir.contains("ret i32 %v2"));
        assert!(ir.contains("target triple"));
    }

    #[test]
    fn emits_extern_declares_with_lib_note() {
        let mut m = simple_module();
        m.externs.insert(
            "cos".into(),
            ExternSig {
                params: vec![Type::Float { bits: 64, brain: false }],
                ret: Type::Float { bits: 64, brain: false },
                variadic: false,
                lib: Some("m".into()),
            },
        );
        let ir = emit_llvm_ir(&m).unwrap().llvm_ir;
        assert!(ir.contains("declare double @cos(double)"));
        assert!(ir.contains("extern from lib \"m\""));
    }

    #[test]
    fn string_constants_become_globals() {
        let mut m = Module::new();
        m.functions.insert(
            "greet".into(),
            Function {
                name: "greet".into(),
                params: vec![],
                ret: Type::Void,
                entry: BlockId(0),
                blocks: vec![Block {
                    id: BlockId(0),
                    insts: vec![
                        Inst::Const {
                            dst: ValueId(0),
                            ty: Type::Ptr,
                            value: ConstVal::Str("hi".into()),
                        },
                        Inst::Call {
                            dst: None,
                            callee: "puts".into(),
                            ret: Type::Void,
                            args: vec![(Type::Ptr, ValueId(0))],
                        },
                    ],
                    term: Terminator::Return(None),
                }],
            },
        );
        let ir = emit_llvm_ir(&m).unwrap().llvm_ir;
        assert!(ir.contains("call void @puts(ptr @.str.0)"));
        assert!(ir.contains("@.str.0 = private unnamed_addr constant [3 x i8] c\"hi\\00\""));
    }

    #[test]
    fn switch_terminator_prints_cases() {
        let mut m = Module::new();
        m.functions.insert(
            "pick".into(),
            Function {
                name: "pick".into(),
                params: vec![("x".into(), Type::i32())],
                ret: Type::Void,
                entry: BlockId(0),
                blocks: vec![
                    Block {
                        id: BlockId(0),
                        insts: vec![],
                        term: Terminator::Switch {
                            ty: Type::i32(),
                            value: ValueId(0),
                            cases: vec![(0, BlockId(1)), (1, BlockId(2))],
                            default: BlockId(3),
                        },
                    },
                    Block { id: BlockId(1), insts: vec![], term: Terminator::Br(BlockId(3)) },
                    Block { id: BlockId(2), insts: vec![], term: Terminator::Br(BlockId(3)) },
                    Block { id: BlockId(3), insts: vec![], term: Terminator::Return(None) },
                ],
            },
        );
        let ir = emit_llvm_ir(&m).unwrap().llvm_ir;
        assert!(ir.contains("switch i32 %arg0, label %bb3 ["));
        assert!(ir.contains("    i32 0, label %bb1"));
    }

    #[test]
    fn same_width_int_cast_is_a_no_op() {
        let mut m = Module::new();
        m.functions.insert(
            "cvt".into(),
            Function {
                name: "cvt".into(),
                params: vec![("x".into(), Type::Int { signed: true, bits: 32 })],
                ret: Type::Int { signed: false, bits: 32 },
                entry: BlockId(0),
                blocks: vec![Block {
                    id: BlockId(0),
                    insts: vec![Inst::Cast {
                        dst: ValueId(1),
                        kind: CastKind::IntResize,
                        from_ty: Type::Int { signed: true, bits: 32 },
                        to_ty: Type::Int { signed: false, bits: 32 },
                        value: ValueId(0),
                    }],
                    term: Terminator::Return(Some((
                        Type::Int { signed: false, bits: 32 },
                        ValueId(1),
                    ))),
                }],
            },
        );
        let ir = emit_llvm_ir(&m).unwrap().llvm_ir;
        assert!(ir.contains("ret i32 %arg0"));
    }
}
