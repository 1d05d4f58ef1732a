//! Path-sensitive linear ownership checking.
//!
//! Forward dataflow over the [`crate::cfg::Cfg`]. Every `(variable,
//! field-path)` pair whose type contains a linear marker is a slot with a
//! state in {Live, Consumed, Undefined}. Merges require slot-by-slot
//! agreement, loop back edges must preserve the header state, and every
//! path reaching the function exit must leave no slot Live. Defer lists are
//! replayed FIFO along each exiting edge before its state is merged.

use std::collections::{BTreeMap, HashMap};

use pythoc_ast::{Expr, ExprKind, Span, Stmt, StmtKind, TypeExpr, TypeExprKind};

use crate::cfg::{Cfg, EdgeKind};
use crate::error::{CoreError, ErrorKind};
use crate::types::{FieldPath, TypeArena, TypeId, TypeKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinState {
    Live,
    Consumed,
    Undefined,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot {
    pub var: String,
    pub path: FieldPath,
}

impl Slot {
    fn display(&self) -> String {
        if self.path.is_empty() {
            self.var.clone()
        } else {
            let path = self
                .path
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(".");
            format!("{}.{path}", self.var)
        }
    }
}

pub type Snapshot = BTreeMap<Slot, LinState>;

/// Join two states at a merge point. `None` means incompatible.
fn join(a: LinState, b: LinState) -> Option<LinState> {
    use LinState::*;
    match (a, b) {
        (Undefined, _) | (_, Undefined) => Some(Undefined),
        (Live, Live) => Some(Live),
        (Consumed, Consumed) => Some(Consumed),
        _ => None,
    }
}

fn join_snapshots(a: &Snapshot, b: &Snapshot) -> Result<Snapshot, Slot> {
    let mut out = Snapshot::new();
    let keys: Vec<&Slot> = a.keys().chain(b.keys()).collect();
    for key in keys {
        if out.contains_key(key) {
            continue;
        }
        let sa = a.get(key).copied().unwrap_or(LinState::Undefined);
        let sb = b.get(key).copied().unwrap_or(LinState::Undefined);
        match join(sa, sb) {
            Some(s) => {
                out.insert(key.clone(), s);
            }
            None => return Err(key.clone()),
        }
    }
    Ok(out)
}

fn compatible(a: &Snapshot, b: &Snapshot) -> Option<Slot> {
    let keys: Vec<&Slot> = a.keys().chain(b.keys()).collect();
    for key in keys {
        let sa = a.get(key).copied().unwrap_or(LinState::Undefined);
        let sb = b.get(key).copied().unwrap_or(LinState::Undefined);
        if join(sa, sb).is_none() {
            return Some(key.clone());
        }
    }
    None
}

pub struct LinearChecker<'a> {
    arena: &'a TypeArena,
    cfg: &'a Cfg,
    /// Declared types of variables, grown as declarations are seen.
    var_types: HashMap<String, TypeId>,
    /// Return types of functions whose results carry linear markers.
    fn_linear_returns: HashMap<String, TypeId>,
}

/// Check one function body. `params` supplies parameter types; slots of
/// linear-containing parameters start Live.
pub fn check_linear(
    arena: &TypeArena,
    cfg: &Cfg,
    params: &[(String, TypeId)],
    fn_linear_returns: &HashMap<String, TypeId>,
) -> Result<(), CoreError> {
    LinearChecker {
        arena,
        cfg,
        var_types: params.iter().cloned().collect(),
        fn_linear_returns: fn_linear_returns.clone(),
    }
    .run(params)
}

impl<'a> LinearChecker<'a> {
    fn run(&mut self, params: &[(String, TypeId)]) -> Result<(), CoreError> {
        let mut initial = Snapshot::new();
        for (name, ty) in params {
            for path in self.arena.linear_paths(*ty) {
                initial.insert(
                    Slot {
                        var: name.clone(),
                        path,
                    },
                    LinState::Live,
                );
            }
        }

        let mut entries: HashMap<u32, Snapshot> = HashMap::new();
        let mut exits: HashMap<u32, Snapshot> = HashMap::new();
        entries.insert(self.cfg.entry.0, initial);

        for block in self.cfg.topo_order() {
            if block.id == self.cfg.exit {
                // Exit paths are checked edge-by-edge below, so a path that
                // failed to consume reports LinearExitNotConsumed rather
                // than a merge error against its siblings.
                continue;
            }
            let entry = match self.compute_entry(block.id.0, &exits) {
                Some(Ok(snapshot)) => {
                    let snapshot = match entries.get(&block.id.0) {
                        Some(existing) => existing.clone(),
                        None => snapshot,
                    };
                    entries.insert(block.id.0, snapshot.clone());
                    snapshot
                }
                Some(Err(err)) => return Err(err),
                None => match entries.get(&block.id.0) {
                    Some(s) => s.clone(),
                    None => continue, // unreachable block
                },
            };

            let mut state = entry;
            for stmt in &block.stmts {
                self.transfer(stmt, &mut state)?;
            }
            exits.insert(block.id.0, state.clone());

            // Loop invariant: a back edge must restore the header state.
            for edge in self.cfg.succs(block.id) {
                if edge.kind != EdgeKind::Backward {
                    continue;
                }
                let replayed = self.apply_edge(&state, edge)?;
                if let Some(header_entry) = entries.get(&edge.to.0) {
                    if let Some(slot) = compatible(&replayed, header_entry) {
                        return Err(CoreError::new(
                            ErrorKind::LinearInconsistentMerge,
                            format!(
                                "loop body changes linear state of '{}'",
                                slot.display()
                            ),
                        )
                        .with_witnesses(vec![slot.display()]));
                    }
                }
            }
        }

        // Every edge into the synthetic exit is a function exit path.
        for edge in self.cfg.preds(self.cfg.exit) {
            let Some(exit_state) = exits.get(&edge.from.0) else {
                continue;
            };
            let final_state = self.apply_edge(exit_state, edge)?;
            let live: Vec<String> = final_state
                .iter()
                .filter(|(_, s)| **s == LinState::Live)
                .map(|(slot, _)| slot.display())
                .collect();
            if !live.is_empty() {
                return Err(CoreError::new(
                    ErrorKind::LinearExitNotConsumed,
                    format!(
                        "linear tokens not consumed at function exit: {}",
                        live.join(", ")
                    ),
                )
                .with_witnesses(live));
            }
        }
        Ok(())
    }

    /// Merge the post-replay exits of all Normal predecessors.
    fn compute_entry(
        &self,
        block: u32,
        exits: &HashMap<u32, Snapshot>,
    ) -> Option<Result<Snapshot, CoreError>> {
        let mut acc: Option<Snapshot> = None;
        for edge in self.cfg.preds(crate::cfg::BlockId(block)) {
            if edge.kind == EdgeKind::Backward {
                continue;
            }
            let Some(pred_exit) = exits.get(&edge.from.0) else {
                continue;
            };
            let replayed = match self.apply_edge(pred_exit, edge) {
                Ok(s) => s,
                Err(e) => return Some(Err(e)),
            };
            acc = Some(match acc {
                None => replayed,
                Some(prev) => match join_snapshots(&prev, &replayed) {
                    Ok(s) => s,
                    Err(slot) => {
                        return Some(Err(CoreError::new(
                            ErrorKind::LinearInconsistentMerge,
                            format!(
                                "'{}' is consumed on one path but live on another",
                                slot.display()
                            ),
                        )
                        .with_witnesses(vec![slot.display()])))
                    }
                },
            });
        }
        acc.map(Ok)
    }

    /// Replay the defers of every scope this edge exits, FIFO per scope,
    /// innermost scope first.
    fn apply_edge(&self, state: &Snapshot, edge: &crate::cfg::Edge) -> Result<Snapshot, CoreError> {
        let mut out = state.clone();
        for (scope, count) in &edge.exits {
            let info = self.cfg.scope(*scope);
            for record in info.defers.iter().take(*count) {
                for arg in &record.args {
                    self.consume_if_linear(arg, &mut out, record.span, "deferred call")?;
                }
            }
        }
        Ok(out)
    }

    fn transfer(&mut self, stmt: &Stmt, state: &mut Snapshot) -> Result<(), CoreError> {
        match &stmt.kind {
            StmtKind::AnnAssign { target, annotation, value } => {
                if let Some(ty) = self.resolve_annotation(annotation) {
                    if let Some(name) = target.as_name() {
                        self.var_types.insert(name.to_string(), ty);
                        if value.is_none() {
                            for path in self.arena.linear_paths(ty) {
                                state.insert(
                                    Slot { var: name.to_string(), path },
                                    LinState::Undefined,
                                );
                            }
                            return Ok(());
                        }
                    }
                }
                if let Some(v) = value {
                    self.assign(target, v, state, stmt.span)?;
                }
                Ok(())
            }
            StmtKind::Assign { target, value } => self.assign(target, value, state, stmt.span),
            StmtKind::Expr(e) => self.eval(e, state, stmt.span),
            StmtKind::Return(value) => {
                if let Some(v) = value {
                    self.consume_returned(v, state, stmt.span)?;
                }
                Ok(())
            }
            // Structured statements were split into blocks by the builder.
            _ => Ok(()),
        }
    }

    fn assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        state: &mut Snapshot,
        span: Span,
    ) -> Result<(), CoreError> {
        // `t = linear()` creates a live token.
        if let Some(("linear", _)) = value.as_direct_call() {
            let slot = self.slot_of(target).ok_or_else(|| {
                CoreError::new(
                    ErrorKind::TypeMismatch,
                    "linear() must initialize a variable or field",
                )
                .with_span(span)
            })?;
            if state.get(&slot) == Some(&LinState::Live) {
                return Err(CoreError::new(
                    ErrorKind::LinearOverwrite,
                    format!("'{}' is overwritten while still live", slot.display()),
                )
                .with_span(span)
                .with_witnesses(vec![slot.display()]));
            }
            if let Some(name) = target.as_name() {
                let lin = self.arena.linear();
                self.var_types.entry(name.to_string()).or_insert(lin);
            }
            state.insert(slot, LinState::Live);
            return Ok(());
        }

        // `t2 = move(t)` transfers ownership atomically.
        if let Some(("move", [src])) = value.as_direct_call() {
            let src_base = self.slot_of(src).ok_or_else(|| {
                CoreError::new(ErrorKind::TypeMismatch, "move() argument must be addressable")
                    .with_span(span)
            })?;
            let src_slots = self.slots_under(src, state);
            if src_slots.is_empty() {
                return Err(CoreError::new(
                    ErrorKind::TypeMismatch,
                    "move() argument is not a linear value",
                )
                .with_span(span));
            }
            for slot in &src_slots {
                self.do_consume(slot, state, span, "move")?;
            }
            let dst = self.slot_of(target).ok_or_else(|| {
                CoreError::new(ErrorKind::TypeMismatch, "move() target must be addressable")
                    .with_span(span)
            })?;
            if let (Some(dst_name), Some(src_name)) = (target.as_name(), src.as_name()) {
                if let Some(ty) = self.var_types.get(src_name).copied() {
                    self.var_types.insert(dst_name.to_string(), ty);
                }
            }
            for slot in src_slots {
                let new = Slot {
                    var: dst.var.clone(),
                    path: dst
                        .path
                        .iter()
                        .copied()
                        .chain(slot.path[src_base.path.len()..].iter().copied())
                        .collect(),
                };
                if state.get(&new) == Some(&LinState::Live) {
                    return Err(CoreError::new(
                        ErrorKind::LinearOverwrite,
                        format!("'{}' is overwritten while still live", new.display()),
                    )
                    .with_span(span)
                    .with_witnesses(vec![new.display()]));
                }
                state.insert(new, LinState::Live);
            }
            return Ok(());
        }

        // Copying a linear-containing value by plain assignment is an error.
        if matches!(value.kind, ExprKind::Name(_) | ExprKind::Attribute { .. }) {
            if !self.slots_under(value, state).is_empty() {
                return Err(CoreError::new(
                    ErrorKind::LinearCopy,
                    format!(
                        "linear value '{}' cannot be copied; use move()",
                        describe_expr(value)
                    ),
                )
                .with_span(span));
            }
        }

        // Calls consume their linear arguments; a linear-returning call
        // makes the target live.
        self.eval(value, state, span)?;
        if let Some((callee, _)) = value.as_direct_call() {
            if let Some(ret) = self.fn_linear_returns.get(callee).copied() {
                if let Some(name) = target.as_name() {
                    self.var_types.insert(name.to_string(), ret);
                    for path in self.arena.linear_paths(ret) {
                        let slot = Slot { var: name.to_string(), path };
                        if state.get(&slot) == Some(&LinState::Live) {
                            return Err(CoreError::new(
                                ErrorKind::LinearOverwrite,
                                format!("'{}' is overwritten while still live", slot.display()),
                            )
                            .with_span(span));
                        }
                        state.insert(slot, LinState::Live);
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk an expression for consuming operations: `consume(x)` and linear
    /// values passed as call arguments.
    fn eval(&self, e: &Expr, state: &mut Snapshot, span: Span) -> Result<(), CoreError> {
        match &e.kind {
            ExprKind::Call { callee, args, kwargs } => {
                if let Some(name) = callee.as_name() {
                    match name {
                        "consume" => {
                            let Some(arg) = args.first() else {
                                return Err(CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    "consume() requires an argument",
                                )
                                .with_span(span));
                            };
                            let slots = self.slots_under(arg, state);
                            if slots.is_empty() {
                                return Err(CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    "consume() argument is not a linear value",
                                )
                                .with_span(span));
                            }
                            for slot in slots {
                                self.do_consume(&slot, state, span, "consume")?;
                            }
                            return Ok(());
                        }
                        "linear" | "move" => {
                            // Only meaningful in assignment position,
                            // handled by `assign`.
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                for arg in args.iter().chain(kwargs.iter().map(|(_, v)| v)) {
                    self.consume_if_linear(arg, state, span, "call argument")?;
                    self.eval(arg, state, span)?;
                }
                Ok(())
            }
            ExprKind::Tuple(elems) => {
                for el in elems {
                    self.eval(el, state, span)?;
                }
                Ok(())
            }
            ExprKind::Binary { left, right, .. } | ExprKind::Compare { left, right, .. } => {
                self.eval(left, state, span)?;
                self.eval(right, state, span)
            }
            ExprKind::Unary { operand, .. } => self.eval(operand, state, span),
            _ => Ok(()),
        }
    }

    /// Consume the slots under `e` if it addresses a linear value; no-op for
    /// non-linear expressions.
    fn consume_if_linear(
        &self,
        e: &Expr,
        state: &mut Snapshot,
        span: Span,
        what: &str,
    ) -> Result<(), CoreError> {
        for slot in self.slots_under(e, state) {
            self.do_consume(&slot, state, span, what)?;
        }
        Ok(())
    }

    fn consume_returned(
        &self,
        e: &Expr,
        state: &mut Snapshot,
        span: Span,
    ) -> Result<(), CoreError> {
        match &e.kind {
            ExprKind::Name(_) | ExprKind::Attribute { .. } => {
                self.consume_if_linear(e, state, span, "return value")
            }
            ExprKind::Tuple(elems) => {
                for el in elems {
                    self.consume_returned(el, state, span)?;
                }
                Ok(())
            }
            ExprKind::Call { args, .. } => {
                for arg in args {
                    self.consume_if_linear(arg, state, span, "return value")?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn do_consume(
        &self,
        slot: &Slot,
        state: &mut Snapshot,
        span: Span,
        what: &str,
    ) -> Result<(), CoreError> {
        match state.get(slot) {
            Some(LinState::Live) => {
                state.insert(slot.clone(), LinState::Consumed);
                Ok(())
            }
            Some(LinState::Consumed) => Err(CoreError::new(
                ErrorKind::LinearUseAfterConsume,
                format!("'{}' used by {what} after being consumed", slot.display()),
            )
            .with_span(span)
            .with_witnesses(vec![slot.display()])),
            Some(LinState::Undefined) | None => Err(CoreError::new(
                ErrorKind::LinearUndefined,
                format!("'{}' used by {what} before initialization", slot.display()),
            )
            .with_span(span)
            .with_witnesses(vec![slot.display()])),
        }
    }

    /// All tracked slots addressed by `e` (itself or any field under it).
    fn slots_under(&self, e: &Expr, state: &Snapshot) -> Vec<Slot> {
        let Some(base) = self.slot_of(e) else {
            return Vec::new();
        };
        state
            .keys()
            .filter(|s| s.var == base.var && s.path.starts_with(&base.path))
            .cloned()
            .collect()
    }

    /// Address an lvalue-ish expression as a `(variable, field-path)` pair.
    fn slot_of(&self, e: &Expr) -> Option<Slot> {
        match &e.kind {
            ExprKind::Name(n) => Some(Slot {
                var: n.clone(),
                path: Vec::new(),
            }),
            ExprKind::Attribute { base, attr } => {
                let parent = self.slot_of(base)?;
                let ty = self.type_at(&parent)?;
                let index = match self.arena.kind(self.arena.runtime_repr(ty)) {
                    TypeKind::Struct { fields, .. } => fields
                        .iter()
                        .position(|f| f.name.as_deref() == Some(attr.node.as_str()))?,
                    _ => return None,
                };
                let mut path = parent.path;
                path.push(index as u32);
                Some(Slot {
                    var: parent.var,
                    path,
                })
            }
            ExprKind::Subscript { base, indices } => {
                let parent = self.slot_of(base)?;
                let [index] = indices.as_slice() else {
                    return None;
                };
                let idx = index.as_int_lit()?;
                let mut path = parent.path;
                path.push(idx as u32);
                Some(Slot {
                    var: parent.var,
                    path,
                })
            }
            _ => None,
        }
    }

    fn type_at(&self, slot: &Slot) -> Option<TypeId> {
        let mut ty = *self.var_types.get(&slot.var)?;
        for step in &slot.path {
            ty = match self.arena.kind(self.arena.runtime_repr(ty)) {
                TypeKind::Struct { fields, .. } => fields.get(*step as usize)?.ty,
                _ => return None,
            };
        }
        Some(ty)
    }

    fn resolve_annotation(&self, te: &TypeExpr) -> Option<TypeId> {
        match &te.kind {
            TypeExprKind::Linear => Some(self.arena.linear()),
            TypeExprKind::Name(n) => self
                .arena
                .primitive(n)
                .or_else(|| self.arena.lookup_named(n)),
            _ => None,
        }
    }
}

fn describe_expr(e: &Expr) -> String {
    match &e.kind {
        ExprKind::Name(n) => n.clone(),
        ExprKind::Attribute { base, attr } => {
            format!("{}.{}", describe_expr(base), attr.node)
        }
        _ => "<expr>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::types::Field;
    use pythoc_ast::Expr;

    fn check(body: &[Stmt]) -> Result<(), CoreError> {
        let arena = TypeArena::new();
        let cfg = build_cfg(body).unwrap();
        check_linear(&arena, &cfg, &[], &HashMap::new())
    }

    fn consume(name: &str) -> Stmt {
        Stmt::expr(Expr::call_named("consume", vec![Expr::name(name)]))
    }

    fn make_linear(name: &str) -> Stmt {
        Stmt::assign_name(name, Expr::call_named("linear", vec![]))
    }

    #[test]
    fn s1_missing_consume_fails_at_exit() {
        let err = check(&[make_linear("t")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearExitNotConsumed);
        assert_eq!(err.witnesses, vec!["t"]);
    }

    #[test]
    fn create_then_consume_passes() {
        check(&[make_linear("t"), consume("t")]).unwrap();
    }

    #[test]
    fn s2_branch_asymmetry_fails_at_join() {
        let err = check(&[
            make_linear("t"),
            Stmt::if_(Expr::name("cond"), vec![consume("t")], vec![]),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearInconsistentMerge);
    }

    #[test]
    fn symmetric_branches_pass() {
        check(&[
            make_linear("t"),
            Stmt::if_(Expr::name("cond"), vec![consume("t")], vec![consume("t")]),
        ])
        .unwrap();
    }

    #[test]
    fn double_consume_fails() {
        let err = check(&[make_linear("t"), consume("t"), consume("t")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearUseAfterConsume);
    }

    #[test]
    fn consume_before_create_fails() {
        let err = check(&[
            Stmt::decl("t", pythoc_ast::TypeExpr::linear()),
            consume("t"),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearUndefined);
    }

    #[test]
    fn overwrite_live_token_fails() {
        let err = check(&[make_linear("t"), make_linear("t")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearOverwrite);
    }

    #[test]
    fn move_transfers_ownership() {
        check(&[
            make_linear("t"),
            Stmt::assign_name("u", Expr::call_named("move", vec![Expr::name("t")])),
            consume("u"),
        ])
        .unwrap();
    }

    #[test]
    fn use_after_move_fails() {
        let err = check(&[
            make_linear("t"),
            Stmt::assign_name("u", Expr::call_named("move", vec![Expr::name("t")])),
            consume("t"),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearUseAfterConsume);
    }

    #[test]
    fn copy_by_assignment_fails() {
        let err = check(&[make_linear("t"), Stmt::assign_name("u", Expr::name("t"))])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearCopy);
    }

    #[test]
    fn call_argument_consumes() {
        check(&[
            make_linear("t"),
            Stmt::expr(Expr::call_named("sink", vec![Expr::name("t")])),
        ])
        .unwrap();
    }

    #[test]
    fn linear_returning_call_creates_live_slot() {
        let arena = TypeArena::new();
        let body = [
            Stmt::assign_name("t", Expr::call_named("make_token", vec![])),
            consume("t"),
        ];
        let cfg = build_cfg(&body).unwrap();
        let fn_returns = HashMap::from([("make_token".to_string(), arena.linear())]);
        check_linear(&arena, &cfg, &[], &fn_returns).unwrap();
    }

    #[test]
    fn return_moves_token_out() {
        let arena = TypeArena::new();
        let body = [
            make_linear("t"),
            Stmt::ret(Some(Expr::name("t"))),
        ];
        let cfg = build_cfg(&body).unwrap();
        check_linear(&arena, &cfg, &[], &HashMap::new()).unwrap();
    }

    #[test]
    fn consuming_only_on_loop_back_edge_fails() {
        let err = check(&[
            make_linear("t"),
            Stmt::while_(Expr::name("cond"), vec![consume("t")]),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearInconsistentMerge);
    }

    #[test]
    fn balanced_loop_body_passes() {
        // Consume and recreate per iteration: the back edge restores the
        // header state.
        check(&[
            make_linear("t"),
            Stmt::while_(
                Expr::name("cond"),
                vec![consume("t"), make_linear("t")],
            ),
            consume("t"),
        ])
        .unwrap();
    }

    #[test]
    fn s3_defer_replays_on_exit_in_fifo_order() {
        // Two defers consuming the same token: the second replay must
        // report use-after-consume, proving A ran before B.
        let err = check(&[
            make_linear("t"),
            Stmt::expr(Expr::call_named("defer", vec![Expr::name("a"), Expr::name("t")])),
            Stmt::expr(Expr::call_named("defer", vec![Expr::name("b"), Expr::name("t")])),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearUseAfterConsume);
    }

    #[test]
    fn defer_consumes_linear_arg_at_scope_exit() {
        check(&[
            make_linear("t"),
            Stmt::expr(Expr::call_named(
                "defer",
                vec![Expr::name("release"), Expr::name("t")],
            )),
        ])
        .unwrap();
    }

    #[test]
    fn defer_does_not_consume_at_registration() {
        // The token is still usable between registration and scope exit -
        // but consuming it makes the deferred release fail.
        let err = check(&[
            make_linear("t"),
            Stmt::expr(Expr::call_named(
                "defer",
                vec![Expr::name("release"), Expr::name("t")],
            )),
            consume("t"),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearUseAfterConsume);
    }

    #[test]
    fn struct_fields_tracked_independently() {
        let mut arena = TypeArena::new();
        let lin = arena.linear();
        let pair = arena
            .struct_type(
                Some("Pair"),
                vec![Field::named("a", lin), Field::named("b", lin)],
            )
            .unwrap();
        let body = [
            Stmt::expr(Expr::call_named(
                "consume",
                vec![Expr::attr(Expr::name("p"), "a")],
            )),
            Stmt::expr(Expr::call_named(
                "consume",
                vec![Expr::attr(Expr::name("p"), "b")],
            )),
        ];
        let cfg = build_cfg(&body).unwrap();
        check_linear(&arena, &cfg, &[("p".to_string(), pair)], &HashMap::new()).unwrap();

        // Consuming only one field leaves the other live at exit.
        let body = [Stmt::expr(Expr::call_named(
            "consume",
            vec![Expr::attr(Expr::name("p"), "a")],
        ))];
        let cfg = build_cfg(&body).unwrap();
        let err = check_linear(&arena, &cfg, &[("p".to_string(), pair)], &HashMap::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearExitNotConsumed);
        assert_eq!(err.witnesses, vec!["p.1"]);
    }

    #[test]
    fn whole_struct_consumption_consumes_all_paths() {
        let mut arena = TypeArena::new();
        let lin = arena.linear();
        let pair = arena
            .struct_type(
                Some("Pair2"),
                vec![Field::named("a", lin), Field::named("b", lin)],
            )
            .unwrap();
        let body = [Stmt::expr(Expr::call_named("consume", vec![Expr::name("p")]))];
        let cfg = build_cfg(&body).unwrap();
        check_linear(&arena, &cfg, &[("p".to_string(), pair)], &HashMap::new()).unwrap();
    }

    #[test]
    fn goto_with_inconsistent_state_fails() {
        // Jump back to a label with the token consumed, but the label entry
        // saw it live.
        let err = check(&[
            make_linear("t"),
            Stmt::with_(
                Expr::call_named("label", vec![Expr::str_("top")]),
                vec![Stmt::if_(
                    Expr::name("cond"),
                    vec![consume("t"), Stmt::expr(Expr::call_named("goto", vec![Expr::str_("top")]))],
                    vec![],
                )],
            ),
            consume("t"),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearInconsistentMerge);
    }
}
