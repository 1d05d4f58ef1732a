//! Lowering of a checked, transformed function body into module IR.
//!
//! This pass erases linear markers (zero-width), expands defers into
//! explicit scope-exit call sequences, resolves labels and gotos to basic
//! blocks, monomorphizes effect calls to concrete symbols, and lowers
//! matches to a switch table or an if-chain per the selection rule.

use std::collections::{BTreeMap, HashMap};

use pythoc_ast::{BinOp as AstBinOp, CmpOp as AstCmpOp, Expr, ExprKind, Pattern, Stmt, StmtKind};
use pythoc_ir as ir;

use crate::effects::{ConstValue, EffectEnv, EffectImpl};
use crate::error::{CoreError, ErrorKind};
use crate::exhaustive::{self, LoweringStrategy};
use crate::registry::{Entity, Intrinsic, Registry};
use crate::sema::CheckedFunction;
use crate::types::{TypeArena, TypeId, TypeKind};

/// Map a middle-end type onto its IR representation. Linear markers and
/// zero-width fields vanish here.
pub fn ir_type(arena: &TypeArena, id: TypeId) -> ir::Type {
    match arena.kind(id) {
        TypeKind::Int { signed, width } => ir::Type::Int {
            signed: *signed,
            bits: width.bits(),
        },
        TypeKind::Float(k) => {
            use crate::types::FloatKind;
            let (bits, brain) = match k {
                FloatKind::F16 => (16, false),
                FloatKind::BF16 => (16, true),
                FloatKind::F32 => (32, false),
                FloatKind::F64 => (64, false),
                FloatKind::F128 => (128, false),
            };
            ir::Type::Float { bits, brain }
        }
        TypeKind::Bool => ir::Type::Bool,
        TypeKind::Void | TypeKind::Linear | TypeKind::Opaque(_) => ir::Type::Void,
        TypeKind::Ptr(_) | TypeKind::Func { .. } => ir::Type::Ptr,
        TypeKind::Array { elem, dims } => {
            let mut ty = ir_type(arena, *elem);
            for d in dims.iter().rev() {
                ty = ir::Type::Array {
                    elem: Box::new(ty),
                    len: *d,
                };
            }
            ty
        }
        TypeKind::Struct { name, fields } => ir::Type::Struct {
            name: name.clone(),
            fields: fields
                .iter()
                .filter(|f| arena.size_of(f.ty) > 0)
                .map(|f| ir_type(arena, f.ty))
                .collect(),
        },
        TypeKind::Union { name, fields } => {
            let size = fields.iter().map(|f| arena.size_of(f.ty)).max().unwrap_or(0);
            ir::Type::Struct {
                name: name.clone(),
                fields: vec![ir::Type::Array {
                    elem: Box::new(ir::Type::Int { signed: false, bits: 8 }),
                    len: size,
                }],
            }
        }
        TypeKind::Enum { name, tag_type, variants } => {
            let payload = variants
                .iter()
                .filter_map(|v| v.payload.map(|p| arena.size_of(p)))
                .max()
                .unwrap_or(0);
            let mut fields = vec![ir_type(arena, *tag_type)];
            if payload > 0 {
                fields.push(ir::Type::Array {
                    elem: Box::new(ir::Type::Int { signed: false, bits: 8 }),
                    len: payload,
                });
            }
            ir::Type::Struct {
                name: Some(name.clone()),
                fields,
            }
        }
        TypeKind::Refined { base, .. } => ir_type(arena, *base),
    }
}

/// IR field index for a core struct field, skipping erased zero-width
/// fields.
fn ir_field_index(arena: &TypeArena, fields: &[crate::types::Field], core_index: usize) -> u32 {
    fields[..core_index]
        .iter()
        .filter(|f| arena.size_of(f.ty) > 0)
        .count() as u32
}

struct LoweredDefer {
    symbol: String,
    ret: ir::Type,
    /// Captured argument temporaries: `(type, alloca address)`.
    args: Vec<(ir::Type, ir::ValueId)>,
}

struct ScopeFrame {
    defers: Vec<LoweredDefer>,
}

struct LoopFrame {
    continue_bb: ir::BlockId,
    break_bb: ir::BlockId,
    depth: usize,
}

struct LabelBlocks {
    begin: ir::BlockId,
    end: ir::BlockId,
    /// Scope depth at the `with` statement.
    depth: usize,
}

pub struct FnLowerer<'a> {
    arena: &'a TypeArena,
    registry: &'a Registry,
    effects: &'a EffectEnv,
    redirects: &'a HashMap<String, String>,
    checked: &'a CheckedFunction,

    blocks: Vec<(ir::BlockId, Vec<ir::Inst>, Option<ir::Terminator>)>,
    cur: usize,
    next_value: u32,
    vars: HashMap<String, (ir::ValueId, TypeId)>,
    scopes: Vec<ScopeFrame>,
    loops: Vec<LoopFrame>,
    labels: HashMap<String, LabelBlocks>,
    /// Scope depth of each label's `with` statement, pre-scanned so forward
    /// gotos unwind the right number of defer scopes.
    label_depths: HashMap<String, usize>,
    externs: BTreeMap<String, ir::ExternSig>,
}

fn prescan_label_depths(body: &[Stmt], depth: usize, out: &mut HashMap<String, usize>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::With { item, body, .. } => {
                if let Some(("label", args)) = item.as_direct_call() {
                    if let Some(name) = args.first().and_then(|a| a.as_str_lit()) {
                        out.insert(name.to_string(), depth);
                    }
                }
                prescan_label_depths(body, depth + 1, out);
            }
            StmtKind::If { then_body, else_body, .. } => {
                prescan_label_depths(then_body, depth + 1, out);
                prescan_label_depths(else_body, depth + 1, out);
            }
            StmtKind::While { body, else_body, .. }
            | StmtKind::For { body, else_body, .. } => {
                prescan_label_depths(body, depth + 1, out);
                prescan_label_depths(else_body, depth + 1, out);
            }
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    prescan_label_depths(&arm.body, depth + 1, out);
                }
            }
            _ => {}
        }
    }
}

/// Lower one checked function; returns the function and the extern
/// signatures it references.
pub fn lower_function(
    arena: &TypeArena,
    registry: &Registry,
    effects: &EffectEnv,
    checked: &CheckedFunction,
    redirects: &HashMap<String, String>,
) -> Result<(ir::Function, BTreeMap<String, ir::ExternSig>), CoreError> {
    let mut lowerer = FnLowerer {
        arena,
        registry,
        effects,
        redirects,
        checked,
        blocks: Vec::new(),
        cur: 0,
        next_value: 0,
        vars: HashMap::new(),
        scopes: vec![ScopeFrame { defers: Vec::new() }],
        loops: Vec::new(),
        labels: HashMap::new(),
        label_depths: HashMap::new(),
        externs: BTreeMap::new(),
    };
    prescan_label_depths(&checked.def.body, 1, &mut lowerer.label_depths);
    lowerer.run()
}

impl<'a> FnLowerer<'a> {
    fn run(mut self) -> Result<(ir::Function, BTreeMap<String, ir::ExternSig>), CoreError> {
        let entry = self.new_block();
        self.cur = entry.0 as usize;

        // Parameters land in stack slots so assignment works uniformly.
        let mut params = Vec::new();
        for (i, (name, ty)) in self.checked.params.iter().enumerate() {
            let pty = ir_type(self.arena, *ty);
            params.push((name.clone(), pty.clone()));
            if pty.is_void() {
                continue;
            }
            let addr = self.fresh();
            self.push(ir::Inst::Alloca {
                dst: addr,
                ty: pty.clone(),
                name: name.clone(),
            });
            self.push(ir::Inst::Store {
                ty: pty,
                addr,
                value: ir::ValueId(i as u32),
            });
            self.vars.insert(name.clone(), (addr, *ty));
        }
        // Value ids 0..params.len() are the incoming parameters.
        self.next_value = self.next_value.max(params.len() as u32);

        let body = self.checked.def.body.clone();
        self.lower_body(&body)?;

        // Implicit return on fallthrough; falling off the end of a
        // non-void function is unreachable by C semantics.
        if self.blocks[self.cur].2.is_none() {
            if ir_type(self.arena, self.checked.ret).is_void() {
                self.run_defers_down_to(0)?;
                self.terminate(ir::Terminator::Return(None));
            } else {
                self.terminate(ir::Terminator::Unreachable);
            }
        }

        let blocks = self
            .blocks
            .into_iter()
            .map(|(id, insts, term)| ir::Block {
                id,
                insts,
                term: term.unwrap_or(ir::Terminator::Unreachable),
            })
            .collect();
        Ok((
            ir::Function {
                name: self.checked.key.mangled(),
                params,
                ret: ir_type(self.arena, self.checked.ret),
                blocks,
                entry,
            },
            self.externs,
        ))
    }

    fn fresh(&mut self) -> ir::ValueId {
        // Parameter ids occupy the low range.
        let id = ir::ValueId(self.next_value.max(self.checked.params.len() as u32));
        self.next_value = id.0 + 1;
        id
    }

    fn new_block(&mut self) -> ir::BlockId {
        let id = ir::BlockId(self.blocks.len() as u32);
        self.blocks.push((id, Vec::new(), None));
        id
    }

    fn push(&mut self, inst: ir::Inst) {
        if self.blocks[self.cur].2.is_none() {
            self.blocks[self.cur].1.push(inst);
        }
    }

    fn terminate(&mut self, term: ir::Terminator) {
        if self.blocks[self.cur].2.is_none() {
            self.blocks[self.cur].2 = Some(term);
        }
    }

    fn switch_to(&mut self, bb: ir::BlockId) {
        self.cur = bb.0 as usize;
    }

    fn is_terminated(&self) -> bool {
        self.blocks[self.cur].2.is_some()
    }

    fn var_type(&self, name: &str) -> Option<TypeId> {
        self.vars
            .get(name)
            .map(|(_, t)| *t)
            .or_else(|| self.checked.var_types.get(name).copied())
    }

    fn lower_body(&mut self, body: &[Stmt]) -> Result<(), CoreError> {
        for stmt in body {
            if self.is_terminated() {
                break;
            }
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CoreError> {
        match &stmt.kind {
            StmtKind::Pass => Ok(()),
            StmtKind::Expr(e) => self.lower_expr_stmt(e),
            StmtKind::Assign { target, value } => self.lower_assign(target, value),
            StmtKind::AnnAssign { target, annotation: _, value } => match value {
                Some(v) => self.lower_assign(target, v),
                None => {
                    // Declaration: reserve the slot.
                    if let Some(name) = target.as_name() {
                        self.ensure_slot(name)?;
                    }
                    Ok(())
                }
            },
            StmtKind::Return(value) => {
                let ret = match value {
                    Some(v) => {
                        let expected = self.checked.ret;
                        self.emit_expected(v, expected)?
                    }
                    None => None,
                };
                self.run_defers_down_to(0)?;
                self.terminate(ir::Terminator::Return(ret));
                Ok(())
            }
            StmtKind::If { cond, then_body, else_body } => {
                let c = self.emit_value(cond)?;
                let then_bb = self.new_block();
                let join_bb = self.new_block();
                let else_bb = if else_body.is_empty() {
                    join_bb
                } else {
                    self.new_block()
                };
                self.terminate(ir::Terminator::CondBr {
                    cond: c.1,
                    then_bb,
                    else_bb,
                });

                self.switch_to(then_bb);
                self.enter_scope();
                self.lower_body(then_body)?;
                self.exit_scope_normally()?;
                self.terminate(ir::Terminator::Br(join_bb));

                if !else_body.is_empty() {
                    self.switch_to(else_bb);
                    self.enter_scope();
                    self.lower_body(else_body)?;
                    self.exit_scope_normally()?;
                    self.terminate(ir::Terminator::Br(join_bb));
                }
                self.switch_to(join_bb);
                Ok(())
            }
            StmtKind::While { cond, body, else_body } => {
                let header = self.new_block();
                self.terminate(ir::Terminator::Br(header));
                self.switch_to(header);
                let c = self.emit_value(cond)?;
                let body_bb = self.new_block();
                let exit_bb = self.new_block();
                let else_bb = if else_body.is_empty() {
                    exit_bb
                } else {
                    self.new_block()
                };
                self.terminate(ir::Terminator::CondBr {
                    cond: c.1,
                    then_bb: body_bb,
                    else_bb,
                });

                self.loops.push(LoopFrame {
                    continue_bb: header,
                    break_bb: exit_bb,
                    depth: self.scopes.len(),
                });
                self.switch_to(body_bb);
                self.enter_scope();
                self.lower_body(body)?;
                self.exit_scope_normally()?;
                self.terminate(ir::Terminator::Br(header));
                self.loops.pop();

                if !else_body.is_empty() {
                    self.switch_to(else_bb);
                    self.enter_scope();
                    self.lower_body(else_body)?;
                    self.exit_scope_normally()?;
                    self.terminate(ir::Terminator::Br(exit_bb));
                }
                self.switch_to(exit_bb);
                Ok(())
            }
            StmtKind::For { target, iter, body, else_body } => {
                self.lower_for(target, iter, body, else_body)
            }
            StmtKind::Match { subject, arms } => self.lower_match(subject, arms),
            StmtKind::With { item, body, .. } => self.lower_with(item, body),
            StmtKind::Break => {
                let Some(frame) = self.loops.last() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "break outside of a loop",
                    )
                    .with_span(stmt.span));
                };
                let (bb, depth) = (frame.break_bb, frame.depth);
                self.run_defers_down_to(depth)?;
                self.terminate(ir::Terminator::Br(bb));
                Ok(())
            }
            StmtKind::Continue => {
                let Some(frame) = self.loops.last() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "continue outside of a loop",
                    )
                    .with_span(stmt.span));
                };
                let (bb, depth) = (frame.continue_bb, frame.depth);
                self.run_defers_down_to(depth)?;
                self.terminate(ir::Terminator::Br(bb));
                Ok(())
            }
            StmtKind::Yield(_) => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "yield survived to lowering",
            )
            .with_span(stmt.span)),
        }
    }

    fn lower_expr_stmt(&mut self, e: &Expr) -> Result<(), CoreError> {
        if let Some((name, args)) = e.as_direct_call() {
            match name {
                "defer" => return self.lower_defer(args),
                "goto" | "goto_begin" => {
                    let label = args[0].as_str_lit().expect("validated by the CFG pass");
                    let (begin, depth) = {
                        let blocks = self.label_blocks(label);
                        (blocks.begin, blocks.depth)
                    };
                    self.run_defers_down_to(depth)?;
                    self.terminate(ir::Terminator::Br(begin));
                    return Ok(());
                }
                "goto_end" => {
                    let label = args[0].as_str_lit().expect("validated by the CFG pass");
                    let (end, depth) = {
                        let blocks = self.label_blocks(label);
                        (blocks.end, blocks.depth)
                    };
                    self.run_defers_down_to(depth)?;
                    self.terminate(ir::Terminator::Br(end));
                    return Ok(());
                }
                "consume" | "linear" => return Ok(()), // erased
                _ => {}
            }
        }
        self.emit(e)?;
        Ok(())
    }

    /// `defer(f, args...)`: spill the captured arguments to temporaries
    /// now; the call itself replays at every exit edge.
    fn lower_defer(&mut self, args: &[Expr]) -> Result<(), CoreError> {
        let Some((callee, rest)) = args.split_first() else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "defer() requires a callee",
            ));
        };
        let Some(fname) = callee.as_name() else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "defer() callee must be a function name",
            ));
        };
        let (symbol, ret) = self.callee_symbol(fname)?;
        let mut captured = Vec::new();
        for arg in rest {
            if let Some(v) = self.emit(arg)? {
                let slot = self.fresh();
                self.push(ir::Inst::Alloca {
                    dst: slot,
                    ty: v.0.clone(),
                    name: "defer_arg".to_string(),
                });
                self.push(ir::Inst::Store {
                    ty: v.0.clone(),
                    addr: slot,
                    value: v.1,
                });
                captured.push((v.0, slot));
            }
        }
        self.scopes
            .last_mut()
            .expect("function scope always exists")
            .defers
            .push(LoweredDefer {
                symbol,
                ret,
                args: captured,
            });
        Ok(())
    }

    fn enter_scope(&mut self) {
        self.scopes.push(ScopeFrame { defers: Vec::new() });
    }

    /// Run this scope's defers (FIFO) and pop it; used on normal
    /// fallthrough exits.
    fn exit_scope_normally(&mut self) -> Result<(), CoreError> {
        if !self.is_terminated() {
            let depth = self.scopes.len() - 1;
            self.emit_defers_of(depth)?;
        }
        self.scopes.pop();
        Ok(())
    }

    /// Emit defers for every scope deeper than `target_depth`, innermost
    /// first, each scope's list in FIFO order. Scopes stay pushed; the
    /// caller is about to terminate the block.
    fn run_defers_down_to(&mut self, target_depth: usize) -> Result<(), CoreError> {
        for depth in (target_depth..self.scopes.len()).rev() {
            self.emit_defers_of(depth)?;
        }
        Ok(())
    }

    fn emit_defers_of(&mut self, depth: usize) -> Result<(), CoreError> {
        let defers: Vec<(String, ir::Type, Vec<(ir::Type, ir::ValueId)>)> = self.scopes[depth]
            .defers
            .iter()
            .map(|d| (d.symbol.clone(), d.ret.clone(), d.args.clone()))
            .collect();
        for (symbol, ret, args) in defers {
            let mut loaded = Vec::new();
            for (ty, slot) in args {
                let v = self.fresh();
                self.push(ir::Inst::Load {
                    dst: v,
                    ty: ty.clone(),
                    addr: slot,
                });
                loaded.push((ty, v));
            }
            self.push(ir::Inst::Call {
                dst: None,
                callee: symbol,
                ret,
                args: loaded,
            });
        }
        Ok(())
    }

    fn label_blocks(&mut self, name: &str) -> &LabelBlocks {
        if !self.labels.contains_key(name) {
            let begin = self.new_block();
            let end = self.new_block();
            let depth = self
                .label_depths
                .get(name)
                .copied()
                .unwrap_or(self.scopes.len());
            self.labels.insert(
                name.to_string(),
                LabelBlocks { begin, end, depth },
            );
        }
        &self.labels[name]
    }

    fn lower_with(&mut self, item: &Expr, body: &[Stmt]) -> Result<(), CoreError> {
        if let Some(("label", args)) = item.as_direct_call() {
            let name = args[0].as_str_lit().expect("validated by the CFG pass");
            let (begin, end) = {
                let blocks = self.label_blocks(name);
                (blocks.begin, blocks.end)
            };
            self.terminate(ir::Terminator::Br(begin));
            self.switch_to(begin);
            self.enter_scope();
            self.lower_body(body)?;
            self.exit_scope_normally()?;
            self.terminate(ir::Terminator::Br(end));
            self.switch_to(end);
            return Ok(());
        }
        // Effect override scopes influence sema only; at lowering they are
        // plain defer scopes.
        self.enter_scope();
        self.lower_body(body)?;
        self.exit_scope_normally()?;
        Ok(())
    }

    fn lower_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<(), CoreError> {
        // Runtime `range`: a counted loop.
        if let Some(("range", args)) = iter.as_direct_call() {
            let ity = ir::Type::i64();
            let (start, stop, step) = match args {
                [stop] => (None, stop, None),
                [start, stop] => (Some(start), stop, None),
                [start, stop, step] => (Some(start), stop, Some(step)),
                _ => {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "range() takes one to three arguments",
                    ))
                }
            };
            let start_v = match start {
                Some(e) => self.emit_cast_to_int(e, &ity)?,
                None => self.const_int(&ity, 0),
            };
            let stop_v = self.emit_cast_to_int(stop, &ity)?;
            let step_v = match step {
                Some(e) => self.emit_cast_to_int(e, &ity)?,
                None => self.const_int(&ity, 1),
            };

            let name = target.as_name().ok_or_else(|| {
                CoreError::new(ErrorKind::TypeMismatch, "range loop target must be a name")
            })?;
            let slot = self.ensure_slot_typed(name, self.arena.i64_(), ity.clone())?;
            self.push(ir::Inst::Store {
                ty: ity.clone(),
                addr: slot,
                value: start_v,
            });

            let header = self.new_block();
            self.terminate(ir::Terminator::Br(header));
            self.switch_to(header);
            let cur = self.fresh();
            self.push(ir::Inst::Load {
                dst: cur,
                ty: ity.clone(),
                addr: slot,
            });
            let cond = self.fresh();
            self.push(ir::Inst::Cmp {
                dst: cond,
                op: ir::CmpOp::Lt,
                ty: ity.clone(),
                lhs: cur,
                rhs: stop_v,
            });
            let body_bb = self.new_block();
            let exit_bb = self.new_block();
            let else_bb = if else_body.is_empty() {
                exit_bb
            } else {
                self.new_block()
            };
            self.terminate(ir::Terminator::CondBr {
                cond,
                then_bb: body_bb,
                else_bb,
            });

            // Increment lives in its own block so `continue` advances.
            let latch = self.new_block();
            self.loops.push(LoopFrame {
                continue_bb: latch,
                break_bb: exit_bb,
                depth: self.scopes.len(),
            });
            self.switch_to(body_bb);
            self.enter_scope();
            self.lower_body(body)?;
            self.exit_scope_normally()?;
            self.terminate(ir::Terminator::Br(latch));
            self.loops.pop();

            self.switch_to(latch);
            let cur2 = self.fresh();
            self.push(ir::Inst::Load {
                dst: cur2,
                ty: ity.clone(),
                addr: slot,
            });
            let next = self.fresh();
            self.push(ir::Inst::Bin {
                dst: next,
                op: ir::BinOp::Add,
                ty: ity.clone(),
                lhs: cur2,
                rhs: step_v,
            });
            self.push(ir::Inst::Store {
                ty: ity.clone(),
                addr: slot,
                value: next,
            });
            self.terminate(ir::Terminator::Br(header));

            if !else_body.is_empty() {
                self.switch_to(else_bb);
                self.enter_scope();
                self.lower_body(else_body)?;
                self.exit_scope_normally()?;
                self.terminate(ir::Terminator::Br(exit_bb));
            }
            self.switch_to(exit_bb);
            return Ok(());
        }

        // Array iteration: an index loop over the leading dimension.
        let iter_ty = self.expr_type(iter)?;
        let repr = self.arena.runtime_repr(iter_ty);
        let TypeKind::Array { elem, dims } = self.arena.kind(repr).clone() else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("cannot iterate over {}", self.arena.display(iter_ty)),
            )
            .with_span(iter.span));
        };
        let elem_core = if dims.len() > 1 {
            // Checked in sema; reconstructing the inner array type here
            // would need arena mutation, so iterate flat instead.
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "iterate multi-dimensional arrays one dimension at a time",
            )
            .with_span(iter.span));
        } else {
            elem
        };
        let len = dims[0];
        let elem_ir = ir_type(self.arena, elem_core);
        let arr_addr = self.emit_addr(iter)?;

        let ity = ir::Type::i64();
        let idx_slot = self.fresh();
        self.push(ir::Inst::Alloca {
            dst: idx_slot,
            ty: ity.clone(),
            name: "for_idx".to_string(),
        });
        let zero = self.const_int(&ity, 0);
        self.push(ir::Inst::Store {
            ty: ity.clone(),
            addr: idx_slot,
            value: zero,
        });
        let len_v = self.const_int(&ity, len as i128);

        let name = target.as_name().ok_or_else(|| {
            CoreError::new(ErrorKind::TypeMismatch, "array loop target must be a name")
        })?;
        let target_slot = self.ensure_slot_typed(name, elem_core, elem_ir.clone())?;

        let header = self.new_block();
        self.terminate(ir::Terminator::Br(header));
        self.switch_to(header);
        let cur = self.fresh();
        self.push(ir::Inst::Load {
            dst: cur,
            ty: ity.clone(),
            addr: idx_slot,
        });
        let cond = self.fresh();
        self.push(ir::Inst::Cmp {
            dst: cond,
            op: ir::CmpOp::Lt,
            ty: ity.clone(),
            lhs: cur,
            rhs: len_v,
        });
        let body_bb = self.new_block();
        let exit_bb = self.new_block();
        let else_bb = if else_body.is_empty() {
            exit_bb
        } else {
            self.new_block()
        };
        self.terminate(ir::Terminator::CondBr {
            cond,
            then_bb: body_bb,
            else_bb,
        });

        let latch = self.new_block();
        self.loops.push(LoopFrame {
            continue_bb: latch,
            break_bb: exit_bb,
            depth: self.scopes.len(),
        });
        self.switch_to(body_bb);
        let idx = self.fresh();
        self.push(ir::Inst::Load {
            dst: idx,
            ty: ity.clone(),
            addr: idx_slot,
        });
        let elem_addr = self.fresh();
        self.push(ir::Inst::IndexAddr {
            dst: elem_addr,
            elem: elem_ir.clone(),
            base: arr_addr,
            index: idx,
        });
        let elem_v = self.fresh();
        self.push(ir::Inst::Load {
            dst: elem_v,
            ty: elem_ir.clone(),
            addr: elem_addr,
        });
        self.push(ir::Inst::Store {
            ty: elem_ir.clone(),
            addr: target_slot,
            value: elem_v,
        });
        self.enter_scope();
        self.lower_body(body)?;
        self.exit_scope_normally()?;
        self.terminate(ir::Terminator::Br(latch));
        self.loops.pop();

        self.switch_to(latch);
        let cur2 = self.fresh();
        self.push(ir::Inst::Load {
            dst: cur2,
            ty: ity.clone(),
            addr: idx_slot,
        });
        let one = self.const_int(&ity, 1);
        let next = self.fresh();
        self.push(ir::Inst::Bin {
            dst: next,
            op: ir::BinOp::Add,
            ty: ity.clone(),
            lhs: cur2,
            rhs: one,
        });
        self.push(ir::Inst::Store {
            ty: ity,
            addr: idx_slot,
            value: next,
        });
        self.terminate(ir::Terminator::Br(header));

        if !else_body.is_empty() {
            self.switch_to(else_bb);
            self.enter_scope();
            self.lower_body(else_body)?;
            self.exit_scope_normally()?;
            self.terminate(ir::Terminator::Br(exit_bb));
        }
        self.switch_to(exit_bb);
        Ok(())
    }

    fn lower_match(&mut self, subject: &Expr, arms: &[pythoc_ast::MatchArm]) -> Result<(), CoreError> {
        let subject_ty = self.expr_type(subject)?;
        let strategy = exhaustive::select_lowering(self.arena, subject_ty, arms);
        let join_bb = self.new_block();

        match strategy {
            LoweringStrategy::SwitchTable => {
                let subj = self.emit_value(subject)?;
                let mut cases = Vec::new();
                let mut default = None;
                let mut arm_bbs = Vec::new();
                for arm in arms {
                    let bb = self.new_block();
                    arm_bbs.push(bb);
                    match &arm.pattern {
                        Pattern::Wildcard { .. } | Pattern::Binding { .. } => {
                            default = Some(bb);
                        }
                        p => {
                            for v in int_literals_of(p) {
                                cases.push((v, bb));
                            }
                        }
                    }
                }
                self.terminate(ir::Terminator::Switch {
                    ty: subj.0.clone(),
                    value: subj.1,
                    cases,
                    default: default.unwrap_or(join_bb),
                });
                for (arm, bb) in arms.iter().zip(arm_bbs) {
                    self.switch_to(bb);
                    self.enter_scope();
                    self.lower_body(&arm.body)?;
                    self.exit_scope_normally()?;
                    self.terminate(ir::Terminator::Br(join_bb));
                }
            }
            LoweringStrategy::IfChain => {
                let subj_addr = self.spill_to_addr(subject)?;
                for arm in arms {
                    let body_bb = self.new_block();
                    let next_bb = self.new_block();
                    let cond =
                        self.lower_pattern_test(subj_addr, subject_ty, &arm.pattern)?;
                    let cond = match (&arm.guard, cond) {
                        (Some(g), Some(c)) => {
                            // Bindings are in place; evaluate the guard
                            // under the pattern condition.
                            let guard_bb = self.new_block();
                            self.terminate(ir::Terminator::CondBr {
                                cond: c,
                                then_bb: guard_bb,
                                else_bb: next_bb,
                            });
                            self.switch_to(guard_bb);
                            Some(self.emit_value(g)?.1)
                        }
                        (Some(g), None) => Some(self.emit_value(g)?.1),
                        (None, c) => c,
                    };
                    match cond {
                        Some(c) => self.terminate(ir::Terminator::CondBr {
                            cond: c,
                            then_bb: body_bb,
                            else_bb: next_bb,
                        }),
                        None => self.terminate(ir::Terminator::Br(body_bb)),
                    }
                    self.switch_to(body_bb);
                    self.enter_scope();
                    self.lower_body(&arm.body)?;
                    self.exit_scope_normally()?;
                    self.terminate(ir::Terminator::Br(join_bb));
                    self.switch_to(next_bb);
                }
                self.terminate(ir::Terminator::Br(join_bb));
            }
        }
        self.switch_to(join_bb);
        Ok(())
    }

    /// Emit the test for one pattern against the subject at `subj_addr`,
    /// storing any bindings. `None` means the pattern always matches.
    fn lower_pattern_test(
        &mut self,
        subj_addr: ir::ValueId,
        subject_ty: TypeId,
        pattern: &Pattern,
    ) -> Result<Option<ir::ValueId>, CoreError> {
        let repr = self.arena.runtime_repr(subject_ty);
        let subj_ir = ir_type(self.arena, repr);
        match pattern {
            Pattern::Wildcard { .. } => Ok(None),
            Pattern::Binding { name, .. } => {
                let v = self.fresh();
                self.push(ir::Inst::Load {
                    dst: v,
                    ty: subj_ir.clone(),
                    addr: subj_addr,
                });
                let slot = self.ensure_slot_typed(&name.node, subject_ty, subj_ir.clone())?;
                self.push(ir::Inst::Store {
                    ty: subj_ir,
                    addr: slot,
                    value: v,
                });
                Ok(None)
            }
            Pattern::Value { expr, .. } => {
                // Enum variant reference: compare tags.
                if let TypeKind::Enum { variants, tag_type, .. } = self.arena.kind(repr).clone() {
                    if let ExprKind::Attribute { attr, .. } = &expr.kind {
                        if let Some(v) = variants.iter().find(|v| v.name == attr.node) {
                            return Ok(Some(self.emit_tag_test(
                                subj_addr, &tag_type, v.tag,
                            )?));
                        }
                    }
                    if let Some(tag) = expr.as_int_lit() {
                        return Ok(Some(self.emit_tag_test(
                            subj_addr,
                            &tag_type,
                            tag as i64,
                        )?));
                    }
                }
                let lit = self.emit_value(expr)?;
                let subject = self.fresh();
                self.push(ir::Inst::Load {
                    dst: subject,
                    ty: subj_ir.clone(),
                    addr: subj_addr,
                });
                let cond = self.fresh();
                self.push(ir::Inst::Cmp {
                    dst: cond,
                    op: ir::CmpOp::Eq,
                    ty: subj_ir,
                    lhs: subject,
                    rhs: lit.1,
                });
                Ok(Some(cond))
            }
            Pattern::Or { alts, .. } => {
                let mut acc: Option<ir::ValueId> = None;
                for alt in alts {
                    let c = self.lower_pattern_test(subj_addr, subject_ty, alt)?;
                    let Some(c) = c else {
                        return Ok(None); // a wildcard alternative matches all
                    };
                    acc = Some(match acc {
                        None => c,
                        Some(prev) => {
                            let v = self.fresh();
                            self.push(ir::Inst::Bin {
                                dst: v,
                                op: ir::BinOp::Or,
                                ty: ir::Type::Bool,
                                lhs: prev,
                                rhs: c,
                            });
                            v
                        }
                    });
                }
                Ok(acc)
            }
            Pattern::Sequence { elems, .. } => {
                match self.arena.kind(repr).clone() {
                    TypeKind::Enum { variants, tag_type, .. } => {
                        let Some(Pattern::Value { expr, .. }) = elems.first() else {
                            return Err(CoreError::new(
                                ErrorKind::MatchPatternTypeMismatch,
                                "enum pattern must start with a variant",
                            ));
                        };
                        let ExprKind::Attribute { attr, .. } = &expr.kind else {
                            return Err(CoreError::new(
                                ErrorKind::MatchPatternTypeMismatch,
                                "enum pattern must start with a variant",
                            ));
                        };
                        let Some(variant) =
                            variants.iter().find(|v| v.name == attr.node).cloned()
                        else {
                            return Err(CoreError::new(
                                ErrorKind::MatchPatternTypeMismatch,
                                format!("no variant '{}'", attr.node),
                            ));
                        };
                        let tag_cond =
                            self.emit_tag_test(subj_addr, &tag_type, variant.tag)?;
                        if let (Some(payload_ty), Some(payload_pat)) =
                            (variant.payload, elems.get(1))
                        {
                            // Payload lives in the blob field behind the tag.
                            let payload_addr = self.fresh();
                            self.push(ir::Inst::FieldAddr {
                                dst: payload_addr,
                                agg: ir_type(self.arena, repr),
                                base: subj_addr,
                                index: 1,
                            });
                            let sub =
                                self.lower_pattern_test(payload_addr, payload_ty, payload_pat)?;
                            return Ok(Some(match sub {
                                None => tag_cond,
                                Some(sub) => {
                                    let v = self.fresh();
                                    self.push(ir::Inst::Bin {
                                        dst: v,
                                        op: ir::BinOp::And,
                                        ty: ir::Type::Bool,
                                        lhs: tag_cond,
                                        rhs: sub,
                                    });
                                    v
                                }
                            }));
                        }
                        Ok(Some(tag_cond))
                    }
                    TypeKind::Struct { fields, .. } => {
                        let mut acc: Option<ir::ValueId> = None;
                        for (i, (pat, field)) in elems.iter().zip(fields.iter()).enumerate() {
                            if self.arena.size_of(field.ty) == 0 {
                                continue;
                            }
                            let faddr = self.fresh();
                            self.push(ir::Inst::FieldAddr {
                                dst: faddr,
                                agg: ir_type(self.arena, repr),
                                base: subj_addr,
                                index: ir_field_index(self.arena, &fields, i),
                            });
                            if let Some(c) =
                                self.lower_pattern_test(faddr, field.ty, pat)?
                            {
                                acc = Some(match acc {
                                    None => c,
                                    Some(prev) => {
                                        let v = self.fresh();
                                        self.push(ir::Inst::Bin {
                                            dst: v,
                                            op: ir::BinOp::And,
                                            ty: ir::Type::Bool,
                                            lhs: prev,
                                            rhs: c,
                                        });
                                        v
                                    }
                                });
                            }
                        }
                        Ok(acc)
                    }
                    TypeKind::Array { elem, .. } => {
                        let elem_ir = ir_type(self.arena, elem);
                        let mut acc: Option<ir::ValueId> = None;
                        for (i, pat) in elems.iter().enumerate() {
                            let idx = self.const_int(&ir::Type::i64(), i as i128);
                            let eaddr = self.fresh();
                            self.push(ir::Inst::IndexAddr {
                                dst: eaddr,
                                elem: elem_ir.clone(),
                                base: subj_addr,
                                index: idx,
                            });
                            if let Some(c) = self.lower_pattern_test(eaddr, elem, pat)? {
                                acc = Some(match acc {
                                    None => c,
                                    Some(prev) => {
                                        let v = self.fresh();
                                        self.push(ir::Inst::Bin {
                                            dst: v,
                                            op: ir::BinOp::And,
                                            ty: ir::Type::Bool,
                                            lhs: prev,
                                            rhs: c,
                                        });
                                        v
                                    }
                                });
                            }
                        }
                        Ok(acc)
                    }
                    _ => Err(CoreError::new(
                        ErrorKind::MatchPatternTypeMismatch,
                        "sequence pattern against non-composite subject",
                    )),
                }
            }
            Pattern::Struct { fields: pat_fields, .. } => {
                let TypeKind::Struct { fields, .. } = self.arena.kind(repr).clone() else {
                    return Err(CoreError::new(
                        ErrorKind::MatchPatternTypeMismatch,
                        "struct pattern against non-struct subject",
                    ));
                };
                let mut acc: Option<ir::ValueId> = None;
                for (i, (fname, pat)) in pat_fields.iter().enumerate() {
                    let index = match fname {
                        Some(n) => fields
                            .iter()
                            .position(|f| f.name.as_deref() == Some(n.node.as_str()))
                            .ok_or_else(|| {
                                CoreError::new(
                                    ErrorKind::MatchPatternTypeMismatch,
                                    format!("no field '{}'", n.node),
                                )
                            })?,
                        None => i,
                    };
                    let field = &fields[index];
                    if self.arena.size_of(field.ty) == 0 {
                        continue;
                    }
                    let faddr = self.fresh();
                    self.push(ir::Inst::FieldAddr {
                        dst: faddr,
                        agg: ir_type(self.arena, repr),
                        base: subj_addr,
                        index: ir_field_index(self.arena, &fields, index),
                    });
                    if let Some(c) = self.lower_pattern_test(faddr, field.ty, pat)? {
                        acc = Some(match acc {
                            None => c,
                            Some(prev) => {
                                let v = self.fresh();
                                self.push(ir::Inst::Bin {
                                    dst: v,
                                    op: ir::BinOp::And,
                                    ty: ir::Type::Bool,
                                    lhs: prev,
                                    rhs: c,
                                });
                                v
                            }
                        });
                    }
                }
                Ok(acc)
            }
        }
    }

    fn emit_tag_test(
        &mut self,
        subj_addr: ir::ValueId,
        tag_type: &TypeId,
        tag: i64,
    ) -> Result<ir::ValueId, CoreError> {
        let tag_ir = ir_type(self.arena, *tag_type);
        let tag_addr = subj_addr; // tag is field 0, same address
        let loaded = self.fresh();
        self.push(ir::Inst::Load {
            dst: loaded,
            ty: tag_ir.clone(),
            addr: tag_addr,
        });
        let expected = self.const_int(&tag_ir, i128::from(tag));
        let cond = self.fresh();
        self.push(ir::Inst::Cmp {
            dst: cond,
            op: ir::CmpOp::Eq,
            ty: tag_ir,
            lhs: loaded,
            rhs: expected,
        });
        Ok(cond)
    }

    fn lower_assign(&mut self, target: &Expr, value: &Expr) -> Result<(), CoreError> {
        // Linear bookkeeping calls vanish at this stage.
        if let Some((name, args)) = value.as_direct_call() {
            match name {
                "linear" => return Ok(()),
                "move" => {
                    // Ownership transfer: copy the runtime payload if any.
                    let src = &args[0];
                    let src_ty = self.expr_type(src)?;
                    if self.arena.size_of(src_ty) == 0 {
                        return Ok(());
                    }
                    return self.lower_plain_assign(target, value);
                }
                _ => {}
            }
        }
        self.lower_plain_assign(target, value)
    }

    fn lower_plain_assign(&mut self, target: &Expr, value: &Expr) -> Result<(), CoreError> {
        let target_ty = match target.as_name() {
            Some(n) => match self.var_type(n) {
                Some(t) => t,
                None => self.expr_type(value)?,
            },
            None => self.expr_type(target)?,
        };
        if self.arena.size_of(target_ty) == 0 {
            // Still evaluate for side effects.
            self.emit(value)?;
            return Ok(());
        }
        let v = self
            .emit_expected(value, target_ty)?
            .ok_or_else(|| {
                CoreError::new(
                    ErrorKind::TypeMismatch,
                    "void value in assignment",
                )
                .with_span(value.span)
            })?;
        let addr = match target.as_name() {
            Some(n) => {
                if !self.vars.contains_key(n) {
                    let ir_ty = v.0.clone();
                    self.ensure_slot_typed(n, target_ty, ir_ty)?
                } else {
                    self.vars[n].0
                }
            }
            None => self.emit_addr(target)?,
        };
        self.push(ir::Inst::Store {
            ty: v.0,
            addr,
            value: v.1,
        });
        Ok(())
    }

    fn ensure_slot(&mut self, name: &str) -> Result<ir::ValueId, CoreError> {
        let ty = self.var_type(name).ok_or_else(|| {
            CoreError::new(
                ErrorKind::TypeMismatch,
                format!("no type known for '{name}'"),
            )
        })?;
        let ir_ty = ir_type(self.arena, ty);
        self.ensure_slot_typed(name, ty, ir_ty)
    }

    fn ensure_slot_typed(
        &mut self,
        name: &str,
        core_ty: TypeId,
        ir_ty: ir::Type,
    ) -> Result<ir::ValueId, CoreError> {
        if let Some((addr, _)) = self.vars.get(name) {
            return Ok(*addr);
        }
        let addr = self.fresh();
        self.push(ir::Inst::Alloca {
            dst: addr,
            ty: ir_ty,
            name: name.to_string(),
        });
        self.vars.insert(name.to_string(), (addr, core_ty));
        Ok(addr)
    }

    /// Best-effort static type of an expression during lowering; sema
    /// already proved the program well-typed.
    fn expr_type(&self, e: &Expr) -> Result<TypeId, CoreError> {
        match &e.kind {
            ExprKind::Name(n) => self.var_type(n).ok_or_else(|| {
                CoreError::new(
                    ErrorKind::TypeMismatch,
                    format!("no type known for '{n}'"),
                )
                .with_span(e.span)
            }),
            ExprKind::Int(_) => Ok(self.arena.i32_()),
            ExprKind::Float(_) => Ok(self.arena.f64_()),
            ExprKind::Bool(_) => Ok(self.arena.bool_()),
            ExprKind::Attribute { base, attr } => {
                let base_ty = self.expr_type(base)?;
                let repr = self.arena.runtime_repr(base_ty);
                match self.arena.kind(repr) {
                    TypeKind::Struct { fields, .. } | TypeKind::Union { fields, .. } => fields
                        .iter()
                        .find(|f| f.name.as_deref() == Some(attr.node.as_str()))
                        .map(|f| f.ty)
                        .ok_or_else(|| {
                            CoreError::new(
                                ErrorKind::TypeMismatch,
                                format!("no field '{}'", attr.node),
                            )
                            .with_span(e.span)
                        }),
                    _ => Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "attribute on non-aggregate",
                    )
                    .with_span(e.span)),
                }
            }
            ExprKind::Subscript { base, indices } => {
                let base_ty = self.expr_type(base)?;
                let repr = self.arena.runtime_repr(base_ty);
                match self.arena.kind(repr) {
                    TypeKind::Array { elem, dims } if indices.len() == dims.len() => Ok(*elem),
                    TypeKind::Ptr(p) => Ok(*p),
                    _ => Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "unsupported subscript in lowering",
                    )
                    .with_span(e.span)),
                }
            }
            ExprKind::Call { callee, .. } => {
                if let Some(name) = callee.as_name() {
                    if let Some(ty) = self
                        .arena
                        .primitive(name)
                        .or_else(|| self.registry.lookup_type(name))
                    {
                        return Ok(ty);
                    }
                    if let Some(info) = self.registry.base_function(name) {
                        if let TypeKind::Func { result, .. } = self.arena.kind(info.sig) {
                            return Ok(*result);
                        }
                    }
                }
                Ok(self.arena.void())
            }
            _ => Ok(self.arena.i32_()),
        }
    }

    fn const_int(&mut self, ty: &ir::Type, v: i128) -> ir::ValueId {
        let dst = self.fresh();
        self.push(ir::Inst::Const {
            dst,
            ty: ty.clone(),
            value: ir::ConstVal::Int(v),
        });
        dst
    }

    fn emit_cast_to_int(&mut self, e: &Expr, to: &ir::Type) -> Result<ir::ValueId, CoreError> {
        let v = self.emit_value(e)?;
        if &v.0 == to {
            return Ok(v.1);
        }
        let dst = self.fresh();
        self.push(ir::Inst::Cast {
            dst,
            kind: ir::CastKind::IntResize,
            from_ty: v.0,
            to_ty: to.clone(),
            value: v.1,
        });
        Ok(dst)
    }

    /// Emit an expression that must produce a runtime value.
    fn emit_value(&mut self, e: &Expr) -> Result<(ir::Type, ir::ValueId), CoreError> {
        self.emit(e)?.ok_or_else(|| {
            CoreError::new(ErrorKind::TypeMismatch, "expected a value")
                .with_span(e.span)
        })
    }

    fn emit_expected(
        &mut self,
        e: &Expr,
        expected: TypeId,
    ) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        if self.arena.size_of(expected) == 0 {
            self.emit(e)?;
            return Ok(None);
        }
        // Integer literals materialize directly at the expected width.
        if let Some(v) = e.as_int_lit() {
            if self.arena.is_integral(expected) {
                let ty = ir_type(self.arena, self.arena.runtime_repr(expected));
                let dst = self.fresh();
                self.push(ir::Inst::Const {
                    dst,
                    ty: ty.clone(),
                    value: ir::ConstVal::Int(v),
                });
                return Ok(Some((ty, dst)));
            }
        }
        self.emit(e)
    }

    /// Emit an expression; `None` means the value is void/erased.
    fn emit(&mut self, e: &Expr) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        match &e.kind {
            ExprKind::Int(v) => {
                let ty = ir::Type::i32();
                let dst = self.fresh();
                self.push(ir::Inst::Const {
                    dst,
                    ty: ty.clone(),
                    value: ir::ConstVal::Int(*v),
                });
                Ok(Some((ty, dst)))
            }
            ExprKind::Float(v) => {
                let ty = ir::Type::Float { bits: 64, brain: false };
                let dst = self.fresh();
                self.push(ir::Inst::Const {
                    dst,
                    ty: ty.clone(),
                    value: ir::ConstVal::Float(*v),
                });
                Ok(Some((ty, dst)))
            }
            ExprKind::Bool(b) => {
                let dst = self.fresh();
                self.push(ir::Inst::Const {
                    dst,
                    ty: ir::Type::Bool,
                    value: ir::ConstVal::Bool(*b),
                });
                Ok(Some((ir::Type::Bool, dst)))
            }
            ExprKind::Str(s) => {
                let dst = self.fresh();
                self.push(ir::Inst::Const {
                    dst,
                    ty: ir::Type::Ptr,
                    value: ir::ConstVal::Str(s.clone()),
                });
                Ok(Some((ir::Type::Ptr, dst)))
            }
            ExprKind::NoneLit => Ok(None),
            ExprKind::Name(n) => {
                if let Some((addr, core_ty)) = self.vars.get(n).copied() {
                    if self.arena.size_of(core_ty) == 0 {
                        return Ok(None);
                    }
                    let ty = ir_type(self.arena, self.arena.runtime_repr(core_ty));
                    let dst = self.fresh();
                    self.push(ir::Inst::Load {
                        dst,
                        ty: ty.clone(),
                        addr,
                    });
                    return Ok(Some((ty, dst)));
                }
                Err(CoreError::new(
                    ErrorKind::TypeMismatch,
                    format!("unknown name '{n}' at lowering"),
                )
                .with_span(e.span))
            }
            ExprKind::Tuple(elems) => {
                let mut fields = Vec::new();
                let mut values = Vec::new();
                for el in elems {
                    if let Some(v) = self.emit(el)? {
                        fields.push(v.0.clone());
                        values.push(v);
                    }
                }
                let agg = ir::Type::Struct {
                    name: None,
                    fields,
                };
                let slot = self.fresh();
                self.push(ir::Inst::Alloca {
                    dst: slot,
                    ty: agg.clone(),
                    name: "tuple".to_string(),
                });
                for (i, (ty, v)) in values.into_iter().enumerate() {
                    let faddr = self.fresh();
                    self.push(ir::Inst::FieldAddr {
                        dst: faddr,
                        agg: agg.clone(),
                        base: slot,
                        index: i as u32,
                    });
                    self.push(ir::Inst::Store {
                        ty,
                        addr: faddr,
                        value: v,
                    });
                }
                let dst = self.fresh();
                self.push(ir::Inst::Load {
                    dst,
                    ty: agg.clone(),
                    addr: slot,
                });
                Ok(Some((agg, dst)))
            }
            ExprKind::Attribute { base, attr } => {
                // Bare `Enum.Variant` values construct a tag-only enum.
                if let Some(tn) = base.as_name() {
                    if !self.vars.contains_key(tn) {
                        if let Some(ty) = self.registry.lookup_type(tn) {
                            if let TypeKind::Enum { variants, tag_type, .. } =
                                self.arena.kind(ty).clone()
                            {
                                if let Some(v) =
                                    variants.iter().find(|v| v.name == attr.node).cloned()
                                {
                                    let agg = ir_type(self.arena, ty);
                                    let slot = self.fresh();
                                    self.push(ir::Inst::Alloca {
                                        dst: slot,
                                        ty: agg.clone(),
                                        name: "enum".to_string(),
                                    });
                                    let tag_ir = ir_type(self.arena, tag_type);
                                    let tag_v =
                                        self.const_int(&tag_ir, i128::from(v.tag));
                                    self.push(ir::Inst::Store {
                                        ty: tag_ir,
                                        addr: slot,
                                        value: tag_v,
                                    });
                                    let dst = self.fresh();
                                    self.push(ir::Inst::Load {
                                        dst,
                                        ty: agg.clone(),
                                        addr: slot,
                                    });
                                    return Ok(Some((agg, dst)));
                                }
                            }
                        }
                    }
                }
                self.emit_place_load(e)
            }
            ExprKind::Subscript { .. } => self.emit_place_load(e),
            ExprKind::Unary { op, operand } => {
                let v = self.emit_value(operand)?;
                match op {
                    pythoc_ast::UnaryOp::Neg => {
                        let zero = self.fresh();
                        self.push(ir::Inst::Const {
                            dst: zero,
                            ty: v.0.clone(),
                            value: if v.0.is_float() {
                                ir::ConstVal::Float(0.0)
                            } else {
                                ir::ConstVal::Int(0)
                            },
                        });
                        let dst = self.fresh();
                        self.push(ir::Inst::Bin {
                            dst,
                            op: ir::BinOp::Sub,
                            ty: v.0.clone(),
                            lhs: zero,
                            rhs: v.1,
                        });
                        Ok(Some((v.0, dst)))
                    }
                    pythoc_ast::UnaryOp::Not => {
                        let t = self.fresh();
                        self.push(ir::Inst::Const {
                            dst: t,
                            ty: ir::Type::Bool,
                            value: ir::ConstVal::Bool(true),
                        });
                        let dst = self.fresh();
                        self.push(ir::Inst::Bin {
                            dst,
                            op: ir::BinOp::Xor,
                            ty: ir::Type::Bool,
                            lhs: v.1,
                            rhs: t,
                        });
                        Ok(Some((ir::Type::Bool, dst)))
                    }
                    pythoc_ast::UnaryOp::BitNot => {
                        let m1 = self.fresh();
                        self.push(ir::Inst::Const {
                            dst: m1,
                            ty: v.0.clone(),
                            value: ir::ConstVal::Int(-1),
                        });
                        let dst = self.fresh();
                        self.push(ir::Inst::Bin {
                            dst,
                            op: ir::BinOp::Xor,
                            ty: v.0.clone(),
                            lhs: v.1,
                            rhs: m1,
                        });
                        Ok(Some((v.0, dst)))
                    }
                }
            }
            ExprKind::Binary { left, op, right } => {
                if matches!(op, AstBinOp::And | AstBinOp::Or) {
                    return self.emit_short_circuit(*op, left, right);
                }
                let l = self.emit_value(left)?;
                let r = self.emit_expected(right, self.binop_operand_type(left, right)?)?;
                let r = r.ok_or_else(|| {
                    CoreError::new(ErrorKind::TypeMismatch, "void operand")
                        .with_span(right.span)
                })?;
                let (l, r, ty) = self.unify_int_literal(l, r, left, right);
                let irop = match op {
                    AstBinOp::Add => ir::BinOp::Add,
                    AstBinOp::Sub => ir::BinOp::Sub,
                    AstBinOp::Mul => ir::BinOp::Mul,
                    AstBinOp::Div => ir::BinOp::Div,
                    AstBinOp::Mod => ir::BinOp::Rem,
                    AstBinOp::BitAnd => ir::BinOp::And,
                    AstBinOp::BitOr => ir::BinOp::Or,
                    AstBinOp::BitXor => ir::BinOp::Xor,
                    AstBinOp::Shl => ir::BinOp::Shl,
                    AstBinOp::Shr => ir::BinOp::Shr,
                    AstBinOp::And | AstBinOp::Or => unreachable!(),
                };
                let dst = self.fresh();
                self.push(ir::Inst::Bin {
                    dst,
                    op: irop,
                    ty: ty.clone(),
                    lhs: l,
                    rhs: r,
                });
                Ok(Some((ty, dst)))
            }
            ExprKind::Compare { left, op, right } => {
                let l = self.emit_value(left)?;
                let r = self.emit_expected(right, self.binop_operand_type(left, right)?)?;
                let r = r.ok_or_else(|| {
                    CoreError::new(ErrorKind::TypeMismatch, "void operand")
                        .with_span(right.span)
                })?;
                let (l, r, ty) = self.unify_int_literal(l, r, left, right);
                let irop = match op {
                    AstCmpOp::Eq => ir::CmpOp::Eq,
                    AstCmpOp::Ne => ir::CmpOp::Ne,
                    AstCmpOp::Lt => ir::CmpOp::Lt,
                    AstCmpOp::Gt => ir::CmpOp::Gt,
                    AstCmpOp::Le => ir::CmpOp::Le,
                    AstCmpOp::Ge => ir::CmpOp::Ge,
                };
                let dst = self.fresh();
                self.push(ir::Inst::Cmp {
                    dst,
                    op: irop,
                    ty,
                    lhs: l,
                    rhs: r,
                });
                Ok(Some((ir::Type::Bool, dst)))
            }
            ExprKind::Call { .. } => self.emit_call(e),
            ExprKind::Lambda { .. } => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "lambda survived to lowering",
            )
            .with_span(e.span)),
        }
    }

    fn binop_operand_type(&self, left: &Expr, right: &Expr) -> Result<TypeId, CoreError> {
        if left.as_int_lit().is_none() {
            self.expr_type(left)
        } else if right.as_int_lit().is_none() {
            self.expr_type(right)
        } else {
            Ok(self.arena.i32_())
        }
    }

    fn unify_int_literal(
        &mut self,
        l: (ir::Type, ir::ValueId),
        r: (ir::Type, ir::ValueId),
        _left: &Expr,
        _right: &Expr,
    ) -> (ir::ValueId, ir::ValueId, ir::Type) {
        if l.0 == r.0 {
            return (l.1, r.1, l.0);
        }
        // Sema guaranteed agreement up to literal width; resize the left
        // side to the right's width when they differ.
        let dst = self.fresh();
        self.push(ir::Inst::Cast {
            dst,
            kind: ir::CastKind::IntResize,
            from_ty: l.0,
            to_ty: r.0.clone(),
            value: l.1,
        });
        (dst, r.1, r.0)
    }

    fn emit_short_circuit(
        &mut self,
        op: AstBinOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        let slot = self.fresh();
        self.push(ir::Inst::Alloca {
            dst: slot,
            ty: ir::Type::Bool,
            name: "sc".to_string(),
        });
        let l = self.emit_value(left)?;
        self.push(ir::Inst::Store {
            ty: ir::Type::Bool,
            addr: slot,
            value: l.1,
        });
        let rhs_bb = self.new_block();
        let join_bb = self.new_block();
        match op {
            AstBinOp::And => self.terminate(ir::Terminator::CondBr {
                cond: l.1,
                then_bb: rhs_bb,
                else_bb: join_bb,
            }),
            AstBinOp::Or => self.terminate(ir::Terminator::CondBr {
                cond: l.1,
                then_bb: join_bb,
                else_bb: rhs_bb,
            }),
            _ => unreachable!(),
        }
        self.switch_to(rhs_bb);
        let r = self.emit_value(right)?;
        self.push(ir::Inst::Store {
            ty: ir::Type::Bool,
            addr: slot,
            value: r.1,
        });
        self.terminate(ir::Terminator::Br(join_bb));
        self.switch_to(join_bb);
        let dst = self.fresh();
        self.push(ir::Inst::Load {
            dst,
            ty: ir::Type::Bool,
            addr: slot,
        });
        Ok(Some((ir::Type::Bool, dst)))
    }

    /// Load from an addressable place (variable, field, element).
    fn emit_place_load(&mut self, e: &Expr) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        let ty = self.expr_type(e)?;
        if self.arena.size_of(ty) == 0 {
            return Ok(None);
        }
        let addr = self.emit_addr(e)?;
        let ir_ty = ir_type(self.arena, self.arena.runtime_repr(ty));
        let dst = self.fresh();
        self.push(ir::Inst::Load {
            dst,
            ty: ir_ty.clone(),
            addr,
        });
        Ok(Some((ir_ty, dst)))
    }

    /// Address of an lvalue.
    fn emit_addr(&mut self, e: &Expr) -> Result<ir::ValueId, CoreError> {
        match &e.kind {
            ExprKind::Name(n) => {
                if let Some((addr, _)) = self.vars.get(n) {
                    return Ok(*addr);
                }
                self.ensure_slot(n)
            }
            ExprKind::Attribute { base, attr } => {
                let base_ty = self.expr_type(base)?;
                let repr = self.arena.runtime_repr(base_ty);
                let base_addr = self.emit_addr(base)?;
                match self.arena.kind(repr).clone() {
                    TypeKind::Struct { fields, .. } => {
                        let index = fields
                            .iter()
                            .position(|f| f.name.as_deref() == Some(attr.node.as_str()))
                            .ok_or_else(|| {
                                CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    format!("no field '{}'", attr.node),
                                )
                                .with_span(e.span)
                            })?;
                        let dst = self.fresh();
                        self.push(ir::Inst::FieldAddr {
                            dst,
                            agg: ir_type(self.arena, repr),
                            base: base_addr,
                            index: ir_field_index(self.arena, &fields, index),
                        });
                        Ok(dst)
                    }
                    // Union fields all alias the storage blob.
                    TypeKind::Union { .. } => Ok(base_addr),
                    _ => Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "attribute on non-aggregate",
                    )
                    .with_span(e.span)),
                }
            }
            ExprKind::Subscript { base, indices } => {
                let base_ty = self.expr_type(base)?;
                let repr = self.arena.runtime_repr(base_ty);
                let base_addr = self.emit_addr(base)?;
                match self.arena.kind(repr).clone() {
                    TypeKind::Array { elem, dims } => {
                        // Row-major flattening over the declared dims.
                        let elem_ir = ir_type(self.arena, elem);
                        let ity = ir::Type::i64();
                        let mut flat: Option<ir::ValueId> = None;
                        for (i, index) in indices.iter().enumerate() {
                            let iv = self.emit_cast_to_int(index, &ity)?;
                            let stride: u64 = dims[i + 1..].iter().product();
                            let stride_v = self.const_int(&ity, i128::from(stride));
                            let scaled = self.fresh();
                            self.push(ir::Inst::Bin {
                                dst: scaled,
                                op: ir::BinOp::Mul,
                                ty: ity.clone(),
                                lhs: iv,
                                rhs: stride_v,
                            });
                            flat = Some(match flat {
                                None => scaled,
                                Some(prev) => {
                                    let s = self.fresh();
                                    self.push(ir::Inst::Bin {
                                        dst: s,
                                        op: ir::BinOp::Add,
                                        ty: ity.clone(),
                                        lhs: prev,
                                        rhs: scaled,
                                    });
                                    s
                                }
                            });
                        }
                        let index = flat.expect("subscript has at least one index");
                        let dst = self.fresh();
                        self.push(ir::Inst::IndexAddr {
                            dst,
                            elem: elem_ir,
                            base: base_addr,
                            index,
                        });
                        Ok(dst)
                    }
                    TypeKind::Ptr(p) => {
                        let elem_ir = ir_type(self.arena, p);
                        let ity = ir::Type::i64();
                        let iv = self.emit_cast_to_int(&indices[0], &ity)?;
                        let loaded = self.fresh();
                        self.push(ir::Inst::Load {
                            dst: loaded,
                            ty: ir::Type::Ptr,
                            addr: base_addr,
                        });
                        let dst = self.fresh();
                        self.push(ir::Inst::IndexAddr {
                            dst,
                            elem: elem_ir,
                            base: loaded,
                            index: iv,
                        });
                        Ok(dst)
                    }
                    _ => Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "subscript on non-indexable",
                    )
                    .with_span(e.span)),
                }
            }
            _ => {
                // Spill a temporary for rvalue subjects.
                self.spill_to_addr(e)
            }
        }
    }

    fn spill_to_addr(&mut self, e: &Expr) -> Result<ir::ValueId, CoreError> {
        if let ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } =
            &e.kind
        {
            return self.emit_addr(e);
        }
        let v = self.emit_value(e)?;
        let slot = self.fresh();
        self.push(ir::Inst::Alloca {
            dst: slot,
            ty: v.0.clone(),
            name: "spill".to_string(),
        });
        self.push(ir::Inst::Store {
            ty: v.0,
            addr: slot,
            value: v.1,
        });
        Ok(slot)
    }

    /// Resolve a callee name to its concrete symbol and IR return type,
    /// honoring effect-variant redirection and extern declarations.
    fn callee_symbol(&mut self, name: &str) -> Result<(String, ir::Type), CoreError> {
        if let Some(symbol) = self.redirects.get(name) {
            let ret = self
                .registry
                .base_function(name)
                .map(|info| match self.arena.kind(info.sig) {
                    TypeKind::Func { result, .. } => ir_type(self.arena, *result),
                    _ => ir::Type::Void,
                })
                .unwrap_or(ir::Type::Void);
            return Ok((symbol.clone(), ret));
        }
        let Some(info) = self.registry.base_function(name) else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("unknown function '{name}'"),
            ));
        };
        let TypeKind::Func { params, result, variadic } = self.arena.kind(info.sig).clone()
        else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("'{name}' is not callable"),
            ));
        };
        if let Some(lib) = &info.extern_lib {
            self.externs.insert(
                name.to_string(),
                ir::ExternSig {
                    params: params.iter().map(|p| ir_type(self.arena, *p)).collect(),
                    ret: ir_type(self.arena, result),
                    variadic,
                    lib: if lib.is_empty() { None } else { Some(lib.clone()) },
                },
            );
            // Externs keep their unmangled name.
            return Ok((name.to_string(), ir_type(self.arena, result)));
        }
        Ok((info.key.mangled(), ir_type(self.arena, result)))
    }

    fn emit_call(&mut self, e: &Expr) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        let ExprKind::Call { callee, args, .. } = &e.kind else {
            unreachable!()
        };

        // Subscripted type construction: zero value of that type.
        if let ExprKind::Subscript { .. } = &callee.kind {
            let ty = self.expr_type(e)?;
            return self.emit_zero(ty);
        }

        // Effect calls monomorphize through the environment.
        if let ExprKind::Attribute { base, attr } = &callee.kind {
            if base.as_name() == Some("effect") {
                let imp = self
                    .effects
                    .resolve(&attr.node)
                    .map_err(|err| err.with_span(e.span))?
                    .clone();
                let EffectImpl::Func(fname) = imp else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!("value effect '{}' is not callable", attr.node),
                    )
                    .with_span(e.span));
                };
                return self.emit_direct_call(&fname, args);
            }
            if let ExprKind::Attribute { base: inner, attr: effect_name } = &base.kind {
                if inner.as_name() == Some("effect") {
                    let imp = self
                        .effects
                        .resolve(&effect_name.node)
                        .map_err(|err| err.with_span(e.span))?
                        .clone();
                    let EffectImpl::Func(fname) = imp else {
                        return Err(CoreError::new(
                            ErrorKind::TypeMismatch,
                            format!("value effect '{}' has no methods", effect_name.node),
                        )
                        .with_span(e.span));
                    };
                    let method = format!("{fname}_{}", attr.node);
                    return self.emit_direct_call(&method, args);
                }
            }
            // Enum construction: Status.Ok(payload).
            if let Some(type_name) = base.as_name() {
                if let Some(ty) = self.registry.lookup_type(type_name) {
                    if let TypeKind::Enum { variants, tag_type, .. } =
                        self.arena.kind(ty).clone()
                    {
                        let variant = variants
                            .iter()
                            .find(|v| v.name == attr.node)
                            .cloned()
                            .ok_or_else(|| {
                                CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    format!("no variant '{}'", attr.node),
                                )
                                .with_span(e.span)
                            })?;
                        let agg = ir_type(self.arena, ty);
                        let slot = self.fresh();
                        self.push(ir::Inst::Alloca {
                            dst: slot,
                            ty: agg.clone(),
                            name: "enum".to_string(),
                        });
                        let tag_ir = ir_type(self.arena, tag_type);
                        let tag_v = self.const_int(&tag_ir, i128::from(variant.tag));
                        self.push(ir::Inst::Store {
                            ty: tag_ir,
                            addr: slot,
                            value: tag_v,
                        });
                        if let (Some(payload_ty), Some(arg)) = (variant.payload, args.first())
                        {
                            if let Some(pv) = self.emit_expected(arg, payload_ty)? {
                                let paddr = self.fresh();
                                self.push(ir::Inst::FieldAddr {
                                    dst: paddr,
                                    agg: agg.clone(),
                                    base: slot,
                                    index: 1,
                                });
                                self.push(ir::Inst::Store {
                                    ty: pv.0,
                                    addr: paddr,
                                    value: pv.1,
                                });
                            }
                        }
                        let dst = self.fresh();
                        self.push(ir::Inst::Load {
                            dst,
                            ty: agg.clone(),
                            addr: slot,
                        });
                        return Ok(Some((agg, dst)));
                    }
                }
            }
        }

        let Some(name) = callee.as_name() else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "unsupported callee at lowering",
            )
            .with_span(e.span));
        };
        let name = name.to_string();

        // Intrinsics with runtime lowering.
        if self.registry.lookup(&name).is_none() || matches!(self.registry.lookup(&name), Some(Entity::Builtin(_))) {
            if let Some(intrinsic) = Intrinsic::by_name(&name) {
                return self.emit_intrinsic(intrinsic, e, args);
            }
        }

        // Type calls: casts and constructions.
        if let Some(ty) = self
            .arena
            .primitive(&name)
            .or_else(|| self.registry.lookup_type(&name))
        {
            return self.emit_type_call(ty, args);
        }

        self.emit_direct_call(&name, args)
    }

    fn emit_direct_call(
        &mut self,
        name: &str,
        args: &[Expr],
    ) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        let (symbol, ret) = self.callee_symbol(name)?;
        let param_tys: Vec<TypeId> = self
            .registry
            .base_function(name)
            .and_then(|info| match self.arena.kind(info.sig) {
                TypeKind::Func { params, .. } => Some(params.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let mut lowered = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let v = match param_tys.get(i) {
                Some(expected) => self.emit_expected(arg, *expected)?,
                None => self.emit(arg)?,
            };
            if let Some(v) = v {
                lowered.push(v);
            }
        }
        let dst = if ret.is_void() { None } else { Some(self.fresh()) };
        self.push(ir::Inst::Call {
            dst,
            callee: symbol,
            ret: ret.clone(),
            args: lowered,
        });
        Ok(dst.map(|d| (ret, d)))
    }

    fn emit_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        e: &Expr,
        args: &[Expr],
    ) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        match intrinsic {
            Intrinsic::Sizeof => {
                // Folded from the layout table.
                let size = args
                    .first()
                    .and_then(|a| self.sizeof_static(a))
                    .ok_or_else(|| {
                        CoreError::new(
                            ErrorKind::TypeShapeInvalid,
                            "sizeof() requires a type argument",
                        )
                        .with_span(e.span)
                    })?;
                let ty = ir::Type::i64();
                let dst = self.fresh();
                self.push(ir::Inst::Const {
                    dst,
                    ty: ty.clone(),
                    value: ir::ConstVal::Int(i128::from(size)),
                });
                Ok(Some((ty, dst)))
            }
            Intrinsic::Linear | Intrinsic::Consume => Ok(None),
            Intrinsic::Move => match args.first() {
                Some(arg) => self.emit(arg),
                None => Ok(None),
            },
            Intrinsic::Ptr => {
                let arg = args.first().ok_or_else(|| {
                    CoreError::new(ErrorKind::TypeMismatch, "ptr() requires an argument")
                        .with_span(e.span)
                })?;
                let addr = self.emit_addr(arg)?;
                Ok(Some((ir::Type::Ptr, addr)))
            }
            Intrinsic::NullPtr => {
                let dst = self.fresh();
                self.push(ir::Inst::Const {
                    dst,
                    ty: ir::Type::Ptr,
                    value: ir::ConstVal::Null,
                });
                Ok(Some((ir::Type::Ptr, dst)))
            }
            Intrinsic::Assume => {
                // Unchecked refined construction: the runtime value is just
                // the payload (single) or the packed struct (multi).
                let values: Vec<&Expr> = args
                    .iter()
                    .filter(|a| {
                        a.as_str_lit().is_none()
                            && !matches!(
                                a.as_name().map(|n| self.registry.lookup(n)),
                                Some(Some(Entity::Func(_)))
                            )
                    })
                    .collect();
                match values.as_slice() {
                    [] => Err(CoreError::new(
                        ErrorKind::TypeShapeInvalid,
                        "assume() requires a value",
                    )
                    .with_span(e.span)),
                    [single] => self.emit(single),
                    multiple => {
                        let elems: Vec<Expr> = multiple.iter().map(|e| (*e).clone()).collect();
                        self.emit(&Expr::tuple(elems))
                    }
                }
            }
            Intrinsic::Defer
            | Intrinsic::Label
            | Intrinsic::Goto
            | Intrinsic::GotoBegin
            | Intrinsic::GotoEnd
            | Intrinsic::Refine
            | Intrinsic::Cimport
            | Intrinsic::Range => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "intrinsic is statement-level only",
            )
            .with_span(e.span)),
        }
    }

    fn sizeof_static(&self, arg: &Expr) -> Option<u64> {
        match &arg.kind {
            ExprKind::Name(n) => {
                let ty = self
                    .arena
                    .primitive(n)
                    .or_else(|| self.registry.lookup_type(n))
                    .or_else(|| self.var_type(n))?;
                Some(self.arena.size_of(ty))
            }
            _ => None,
        }
    }

    fn emit_type_call(
        &mut self,
        ty: TypeId,
        args: &[Expr],
    ) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        match args {
            [] => self.emit_zero(ty),
            [value] => {
                let v = self.emit_expected(value, ty)?;
                let Some(v) = v else { return Ok(None) };
                let to_repr = self.arena.runtime_repr(ty);
                let to_ir = ir_type(self.arena, to_repr);
                if v.0 == to_ir {
                    return Ok(Some((to_ir, v.1)));
                }
                let kind = match (&v.0, &to_ir) {
                    (ir::Type::Int { .. }, ir::Type::Int { .. })
                    | (ir::Type::Bool, ir::Type::Int { .. })
                    | (ir::Type::Int { .. }, ir::Type::Bool) => ir::CastKind::IntResize,
                    (ir::Type::Int { .. }, ir::Type::Float { .. }) => ir::CastKind::IntToFloat,
                    (ir::Type::Float { .. }, ir::Type::Int { .. }) => ir::CastKind::FloatToInt,
                    (ir::Type::Float { .. }, ir::Type::Float { .. }) => ir::CastKind::FloatResize,
                    (ir::Type::Ptr, ir::Type::Int { .. }) => ir::CastKind::PtrToInt,
                    (ir::Type::Int { .. }, ir::Type::Ptr) => ir::CastKind::IntToPtr,
                    _ => ir::CastKind::Bit,
                };
                let dst = self.fresh();
                self.push(ir::Inst::Cast {
                    dst,
                    kind,
                    from_ty: v.0,
                    to_ty: to_ir.clone(),
                    value: v.1,
                });
                Ok(Some((to_ir, dst)))
            }
            _ => {
                // Struct construction from ordered field values.
                let repr = self.arena.runtime_repr(ty);
                let TypeKind::Struct { fields, .. } = self.arena.kind(repr).clone() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "multi-value construction needs a struct type",
                    ));
                };
                let agg = ir_type(self.arena, repr);
                let slot = self.fresh();
                self.push(ir::Inst::Alloca {
                    dst: slot,
                    ty: agg.clone(),
                    name: "ctor".to_string(),
                });
                for (i, (arg, field)) in args.iter().zip(fields.iter()).enumerate() {
                    if let Some(v) = self.emit_expected(arg, field.ty)? {
                        let faddr = self.fresh();
                        self.push(ir::Inst::FieldAddr {
                            dst: faddr,
                            agg: agg.clone(),
                            base: slot,
                            index: ir_field_index(self.arena, &fields, i),
                        });
                        self.push(ir::Inst::Store {
                            ty: v.0,
                            addr: faddr,
                            value: v.1,
                        });
                    }
                }
                let dst = self.fresh();
                self.push(ir::Inst::Load {
                    dst,
                    ty: agg.clone(),
                    addr: slot,
                });
                Ok(Some((agg, dst)))
            }
        }
    }

    fn emit_zero(&mut self, ty: TypeId) -> Result<Option<(ir::Type, ir::ValueId)>, CoreError> {
        if self.arena.size_of(ty) == 0 {
            return Ok(None);
        }
        let ir_ty = ir_type(self.arena, self.arena.runtime_repr(ty));
        let dst = self.fresh();
        self.push(ir::Inst::Const {
            dst,
            ty: ir_ty.clone(),
            value: ir::ConstVal::Zero,
        });
        Ok(Some((ir_ty, dst)))
    }
}

fn int_literals_of(pattern: &Pattern) -> Vec<i128> {
    match pattern {
        Pattern::Value { expr, .. } => expr.as_int_lit().into_iter().collect(),
        Pattern::Or { alts, .. } => alts.iter().flat_map(int_literals_of).collect(),
        _ => Vec::new(),
    }
}
