#![forbid(unsafe_code)]

//! Module IR produced by the middle end.
//!
//! By the time code reaches this form, every expression is typed, every call
//! targets a concrete mangled symbol, matches are lowered to switch or
//! branch chains, defers are expanded into explicit scope-exit sequences,
//! and linear markers are erased.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ValueId(pub u32);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Type {
    Int { signed: bool, bits: u32 },
    Float { bits: u32, brain: bool },
    Bool,
    Void,
    Ptr,
    Array { elem: Box<Type>, len: u64 },
    Struct { name: Option<String>, fields: Vec<Type> },
}

impl Type {
    pub fn i32() -> Self {
        Type::Int { signed: true, bits: 32 }
    }

    pub fn i64() -> Self {
        Type::Int { signed: true, bits: 64 }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Type::Int { signed: true, .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ConstVal {
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
    /// All-zero value of the destination type.
    Zero,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CastKind {
    /// Integer widen/narrow following source signedness.
    IntResize,
    IntToFloat,
    FloatToInt,
    FloatResize,
    /// Reinterpret through memory; used for union field reads.
    Bit,
    PtrToInt,
    IntToPtr,
}

#[derive(Clone, Debug, Serialize)]
pub enum Inst {
    Const {
        dst: ValueId,
        ty: Type,
        value: ConstVal,
    },
    Bin {
        dst: ValueId,
        op: BinOp,
        ty: Type,
        lhs: ValueId,
        rhs: ValueId,
    },
    Cmp {
        dst: ValueId,
        op: CmpOp,
        ty: Type,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Stack slot for a named local.
    Alloca {
        dst: ValueId,
        ty: Type,
        name: String,
    },
    Load {
        dst: ValueId,
        ty: Type,
        addr: ValueId,
    },
    Store {
        ty: Type,
        addr: ValueId,
        value: ValueId,
    },
    /// Address of field `index` of the aggregate at `base`.
    FieldAddr {
        dst: ValueId,
        agg: Type,
        base: ValueId,
        index: u32,
    },
    /// Address of element `index` of the array at `base`.
    IndexAddr {
        dst: ValueId,
        elem: Type,
        base: ValueId,
        index: ValueId,
    },
    Call {
        dst: Option<ValueId>,
        callee: String,
        ret: Type,
        args: Vec<(Type, ValueId)>,
    },
    Cast {
        dst: ValueId,
        kind: CastKind,
        from_ty: Type,
        to_ty: Type,
        value: ValueId,
    },
}

impl Inst {
    pub fn dst(&self) -> Option<ValueId> {
        match self {
            Inst::Const { dst, .. }
            | Inst::Bin { dst, .. }
            | Inst::Cmp { dst, .. }
            | Inst::Alloca { dst, .. }
            | Inst::Load { dst, .. }
            | Inst::FieldAddr { dst, .. }
            | Inst::IndexAddr { dst, .. }
            | Inst::Cast { dst, .. } => Some(*dst),
            Inst::Call { dst, .. } => *dst,
            Inst::Store { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub enum Terminator {
    Return(Option<(Type, ValueId)>),
    Br(BlockId),
    CondBr {
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Switch {
        ty: Type,
        value: ValueId,
        cases: Vec<(i128, BlockId)>,
        default: BlockId,
    },
    Unreachable,
}

#[derive(Clone, Debug, Serialize)]
pub struct Block {
    pub id: BlockId,
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

#[derive(Clone, Debug, Serialize)]
pub struct Function {
    /// Fully mangled symbol name.
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExternSig {
    pub params: Vec<Type>,
    pub ret: Type,
    pub variadic: bool,
    /// Library tag from `extern(lib=...)`.
    pub lib: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Module {
    pub functions: BTreeMap<String, Function>,
    pub externs: BTreeMap<String, ExternSig>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: Module) {
        self.functions.extend(other.functions);
        for (name, sig) in other.externs {
            self.externs.entry(name).or_insert(sig);
        }
    }
}

/// Structural sanity: every branch target exists and every operand was
/// produced by an earlier instruction or parameter.
pub fn validate(module: &Module) -> Result<(), String> {
    for (name, f) in &module.functions {
        let block_ids: Vec<BlockId> = f.blocks.iter().map(|b| b.id).collect();
        let check_target = |bb: BlockId| -> Result<(), String> {
            if block_ids.contains(&bb) {
                Ok(())
            } else {
                Err(format!("{name}: branch to missing block {bb:?}"))
            }
        };
        let mut defined: Vec<ValueId> = (0..f.params.len() as u32).map(ValueId).collect();
        for block in &f.blocks {
            for inst in &block.insts {
                if let Some(dst) = inst.dst() {
                    defined.push(dst);
                }
            }
        }
        for block in &f.blocks {
            for inst in &block.insts {
                let operands: Vec<ValueId> = match inst {
                    Inst::Bin { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => {
                        vec![*lhs, *rhs]
                    }
                    Inst::Load { addr, .. } => vec![*addr],
                    Inst::Store { addr, value, .. } => vec![*addr, *value],
                    Inst::FieldAddr { base, .. } => vec![*base],
                    Inst::IndexAddr { base, index, .. } => vec![*base, *index],
                    Inst::Call { args, .. } => args.iter().map(|(_, v)| *v).collect(),
                    Inst::Cast { value, .. } => vec![*value],
                    Inst::Const { .. } | Inst::Alloca { .. } => Vec::new(),
                };
                for op in operands {
                    if !defined.contains(&op) {
                        return Err(format!("{name}: use of undefined value {op:?}"));
                    }
                }
            }
            match &block.term {
                Terminator::Br(bb) => check_target(*bb)?,
                Terminator::CondBr { then_bb, else_bb, .. } => {
                    check_target(*then_bb)?;
                    check_target(*else_bb)?;
                }
                Terminator::Switch { cases, default, .. } => {
                    for (_, bb) in cases {
                        check_target(*bb)?;
                    }
                    check_target(*default)?;
                }
                Terminator::Return(_) | Terminator::Unreachable => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_block_fn(term: Terminator) -> Function {
        Function {
            name: "f".into(),
            params: vec![],
            ret: Type::Void,
            blocks: vec![Block {
                id: BlockId(0),
                insts: vec![],
                term,
            }],
            entry: BlockId(0),
        }
    }

    #[test]
    fn validate_accepts_return() {
        let mut m = Module::new();
        m.functions
            .insert("f".into(), one_block_fn(Terminator::Return(None)));
        validate(&m).unwrap();
    }

    #[test]
    fn validate_rejects_missing_target() {
        let mut m = Module::new();
        m.functions
            .insert("f".into(), one_block_fn(Terminator::Br(BlockId(9))));
        assert!(validate(&m).is_err());
    }

    #[test]
    fn merge_keeps_first_extern() {
        let sig = ExternSig {
            params: vec![],
            ret: Type::Void,
            variadic: false,
            lib: Some("m".into()),
        };
        let mut a = Module::new();
        a.externs.insert("cos".into(), sig.clone());
        let mut b = Module::new();
        b.externs.insert(
            "cos".into(),
            ExternSig {
                lib: None,
                ..sig.clone()
            },
        );
        a.merge(b);
        assert_eq!(a.externs["cos"].lib.as_deref(), Some("m"));
    }
}
