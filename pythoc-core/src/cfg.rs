//! Control-flow graph construction over the post-inline AST.
//!
//! Scopes form a tree rooted at the function scope; each scope carries its
//! defer list. Labels are scopes with two jump targets: `begin` sits at the
//! `with` level (visible to siblings and uncles), `end` sits inside the body
//! after defer execution (visible only from within). Every edge records the
//! scopes it exits, innermost first, together with how many of each scope's
//! defers were registered at the jump point; the linear checker replays
//! those defer lists in FIFO order along the edge.

use std::collections::BTreeMap;

use pythoc_ast::{Expr, Span, Stmt, StmtKind};

use crate::error::{CoreError, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Normal,
    /// Loop back edges and backward gotos; treated as invariant checks, not
    /// forward propagation.
    Backward,
}

#[derive(Clone, Debug)]
pub struct Edge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
    /// Scopes exited along this edge, innermost first, with the number of
    /// defers registered in each at the time of the jump.
    pub exits: Vec<(ScopeId, usize)>,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pub scope: ScopeId,
    pub stmts: Vec<Stmt>,
}

/// A registered scope-exit call. Arguments were captured at registration;
/// linear arguments transfer only when the call executes.
#[derive(Clone, Debug)]
pub struct DeferRecord {
    pub callee: Expr,
    pub args: Vec<Expr>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct ScopeInfo {
    pub parent: Option<ScopeId>,
    pub defers: Vec<DeferRecord>,
}

#[derive(Clone, Debug)]
pub struct LabelInfo {
    pub name: String,
    pub begin: BlockId,
    pub end: BlockId,
    pub body_scope: ScopeId,
    pub parent_scope: ScopeId,
}

#[derive(Debug)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
    pub scopes: Vec<ScopeInfo>,
    pub labels: BTreeMap<String, LabelInfo>,
    pub entry: BlockId,
    pub exit: BlockId,
}

impl Cfg {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn scope(&self, id: ScopeId) -> &ScopeInfo {
        &self.scopes[id.0 as usize]
    }

    pub fn preds(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn succs(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Blocks in creation order, which is a topological order of the
    /// forward subgraph: every Normal edge goes from a lower to a higher id
    /// except label re-entries, which construction marks Backward.
    pub fn topo_order(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

struct LoopFrame {
    header: BlockId,
    exit: BlockId,
    body_scope: ScopeId,
}

struct PendingJump {
    from: BlockId,
    label: String,
    site_scope: ScopeId,
    /// Live scope chain at the jump, innermost first, with defer counts.
    snapshot: Vec<(ScopeId, usize)>,
    span: Span,
    to_end: bool,
}

pub struct CfgBuilder {
    blocks: Vec<Block>,
    edges: Vec<Edge>,
    scopes: Vec<ScopeInfo>,
    labels: BTreeMap<String, LabelInfo>,
    pending: Vec<PendingJump>,
    loop_stack: Vec<LoopFrame>,
    cur_block: BlockId,
    cur_scope: ScopeId,
    terminated: bool,
}

/// Build the CFG for one function body.
pub fn build_cfg(body: &[Stmt]) -> Result<Cfg, CoreError> {
    let mut b = CfgBuilder::new();
    b.walk_body(body)?;
    b.finish()
}

impl CfgBuilder {
    fn new() -> Self {
        let root = ScopeInfo {
            parent: None,
            defers: Vec::new(),
        };
        let entry = Block {
            id: BlockId(0),
            scope: ScopeId(0),
            stmts: Vec::new(),
        };
        Self {
            blocks: vec![entry],
            edges: Vec::new(),
            scopes: vec![root],
            labels: BTreeMap::new(),
            pending: Vec::new(),
            loop_stack: Vec::new(),
            cur_block: BlockId(0),
            cur_scope: ScopeId(0),
            terminated: false,
        }
    }

    fn new_block(&mut self, scope: ScopeId) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            scope,
            stmts: Vec::new(),
        });
        id
    }

    fn new_scope(&mut self, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(ScopeInfo {
            parent: Some(parent),
            defers: Vec::new(),
        });
        id
    }

    fn edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind, exits: Vec<(ScopeId, usize)>) {
        self.edges.push(Edge {
            from,
            to,
            kind,
            exits,
        });
    }

    fn push_stmt(&mut self, stmt: Stmt) {
        self.blocks[self.cur_block.0 as usize].stmts.push(stmt);
    }

    /// Scope chain from `from` upward, stopping before `until` (exclusive),
    /// with current defer counts.
    fn exits_until(&self, from: ScopeId, until: Option<ScopeId>) -> Vec<(ScopeId, usize)> {
        let mut out = Vec::new();
        let mut cur = Some(from);
        while let Some(s) = cur {
            if Some(s) == until {
                break;
            }
            out.push((s, self.scopes[s.0 as usize].defers.len()));
            cur = self.scopes[s.0 as usize].parent;
        }
        out
    }

    fn live_chain(&self) -> Vec<(ScopeId, usize)> {
        self.exits_until(self.cur_scope, None)
    }

    fn walk_body(&mut self, body: &[Stmt]) -> Result<(), CoreError> {
        for stmt in body {
            if self.terminated {
                return Err(CoreError::new(
                    ErrorKind::UnreachableAfterReturn,
                    "statement is unreachable after a jump",
                )
                .with_span(stmt.span));
            }
            self.walk_stmt(stmt)?;
        }
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: &Stmt) -> Result<(), CoreError> {
        match &stmt.kind {
            StmtKind::Expr(e) => self.walk_expr_stmt(stmt, e),
            StmtKind::Assign { .. } | StmtKind::AnnAssign { .. } | StmtKind::Pass => {
                if !matches!(stmt.kind, StmtKind::Pass) {
                    self.push_stmt(stmt.clone());
                }
                Ok(())
            }
            StmtKind::Return(_) => {
                self.push_stmt(stmt.clone());
                self.terminated = true;
                // Edge to the synthetic exit is added in finish(), once the
                // exit block exists; remember via a pending self-jump.
                self.pending.push(PendingJump {
                    from: self.cur_block,
                    label: RETURN_LABEL.to_string(),
                    site_scope: self.cur_scope,
                    snapshot: self.live_chain(),
                    span: stmt.span,
                    to_end: false,
                });
                Ok(())
            }
            StmtKind::Yield(_) => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "yield survives only inside a generator consumed by a for loop",
            )
            .with_span(stmt.span)),
            StmtKind::Break => {
                let Some(frame) = self.loop_stack.last() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "break outside of a loop",
                    )
                    .with_span(stmt.span));
                };
                let exits = self.exits_until(
                    self.cur_scope,
                    self.scopes[frame.body_scope.0 as usize].parent,
                );
                let (from, to) = (self.cur_block, frame.exit);
                self.edge(from, to, EdgeKind::Normal, exits);
                self.terminated = true;
                Ok(())
            }
            StmtKind::Continue => {
                let Some(frame) = self.loop_stack.last() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "continue outside of a loop",
                    )
                    .with_span(stmt.span));
                };
                let exits = self.exits_until(
                    self.cur_scope,
                    self.scopes[frame.body_scope.0 as usize].parent,
                );
                let (from, to) = (self.cur_block, frame.header);
                self.edge(from, to, EdgeKind::Backward, exits);
                self.terminated = true;
                Ok(())
            }
            StmtKind::If { cond, then_body, else_body } => {
                self.push_stmt(Stmt::expr(cond.clone()));
                let branch = self.cur_block;
                let parent = self.cur_scope;

                let then_scope = self.new_scope(parent);
                let then_entry = self.new_block(then_scope);
                self.edge(branch, then_entry, EdgeKind::Normal, Vec::new());
                self.cur_block = then_entry;
                self.cur_scope = then_scope;
                self.terminated = false;
                self.walk_body(then_body)?;
                let then_tail = (!self.terminated).then_some((self.cur_block, then_scope));

                let else_tail = if else_body.is_empty() {
                    None
                } else {
                    let else_scope = self.new_scope(parent);
                    let else_entry = self.new_block(else_scope);
                    self.edge(branch, else_entry, EdgeKind::Normal, Vec::new());
                    self.cur_block = else_entry;
                    self.cur_scope = else_scope;
                    self.terminated = false;
                    self.walk_body(else_body)?;
                    (!self.terminated).then_some((self.cur_block, else_scope))
                };

                let join = self.new_block(parent);
                if let Some((tail, scope)) = then_tail {
                    let exits = vec![(scope, self.scopes[scope.0 as usize].defers.len())];
                    self.edge(tail, join, EdgeKind::Normal, exits);
                }
                match else_tail {
                    Some((tail, scope)) => {
                        let exits = vec![(scope, self.scopes[scope.0 as usize].defers.len())];
                        self.edge(tail, join, EdgeKind::Normal, exits);
                    }
                    None if else_body.is_empty() => {
                        self.edge(branch, join, EdgeKind::Normal, Vec::new());
                    }
                    None => {}
                }
                self.cur_block = join;
                self.cur_scope = parent;
                self.terminated = false;
                Ok(())
            }
            StmtKind::While { cond, body, else_body } => {
                self.lower_loop(Some(cond), None, body, else_body)
            }
            StmtKind::For { target: _, iter, body, else_body } => {
                // Runtime iteration (arrays); constant and generator loops
                // were expanded earlier. Arrays cannot carry linear
                // markers, so the target assignment is opaque to the
                // ownership analysis.
                self.lower_loop(None, Some(iter), body, else_body)
            }
            StmtKind::Match { subject, arms } => {
                self.push_stmt(Stmt::expr(subject.clone()));
                let branch = self.cur_block;
                let parent = self.cur_scope;
                let mut tails = Vec::new();
                let mut has_catch_all = false;
                for arm in arms {
                    if arm.guard.is_none()
                        && matches!(
                            arm.pattern,
                            pythoc_ast::Pattern::Wildcard { .. }
                                | pythoc_ast::Pattern::Binding { .. }
                        )
                    {
                        has_catch_all = true;
                    }
                    let arm_scope = self.new_scope(parent);
                    let arm_entry = self.new_block(arm_scope);
                    self.edge(branch, arm_entry, EdgeKind::Normal, Vec::new());
                    self.cur_block = arm_entry;
                    self.cur_scope = arm_scope;
                    self.terminated = false;
                    if let Some(guard) = &arm.guard {
                        self.push_stmt(Stmt::expr(guard.clone()));
                    }
                    self.walk_body(&arm.body)?;
                    if !self.terminated {
                        tails.push((self.cur_block, arm_scope));
                    }
                }
                let join = self.new_block(parent);
                for (tail, scope) in tails {
                    let exits = vec![(scope, self.scopes[scope.0 as usize].defers.len())];
                    self.edge(tail, join, EdgeKind::Normal, exits);
                }
                if !has_catch_all {
                    // The subject may fall through every pattern only when
                    // the match is non-exhaustive; exhaustiveness checking
                    // runs separately, the graph just stays conservative.
                    self.edge(branch, join, EdgeKind::Normal, Vec::new());
                }
                self.cur_block = join;
                self.cur_scope = parent;
                self.terminated = false;
                Ok(())
            }
            StmtKind::With { item, body, .. } => {
                if let Some(("label", args)) = item.as_direct_call() {
                    let name = args
                        .first()
                        .and_then(|a| a.as_str_lit())
                        .ok_or_else(|| {
                            CoreError::new(
                                ErrorKind::LabelNotVisible,
                                "label() requires a literal name",
                            )
                            .with_span(stmt.span)
                        })?;
                    return self.lower_label(name, body, stmt.span);
                }
                // Effect overrides and other context items: a plain scope.
                let parent = self.cur_scope;
                let scope = self.new_scope(parent);
                let entry = self.new_block(scope);
                let from = self.cur_block;
                self.edge(from, entry, EdgeKind::Normal, Vec::new());
                self.cur_block = entry;
                self.cur_scope = scope;
                self.walk_body(body)?;
                let after = self.new_block(parent);
                if !self.terminated {
                    let exits = vec![(scope, self.scopes[scope.0 as usize].defers.len())];
                    let tail = self.cur_block;
                    self.edge(tail, after, EdgeKind::Normal, exits);
                }
                self.cur_block = after;
                self.cur_scope = parent;
                self.terminated = false;
                Ok(())
            }
        }
    }

    fn walk_expr_stmt(&mut self, stmt: &Stmt, e: &Expr) -> Result<(), CoreError> {
        if let Some((name, args)) = e.as_direct_call() {
            match name {
                "defer" => {
                    let Some((callee, rest)) = args.split_first() else {
                        return Err(CoreError::new(
                            ErrorKind::TypeMismatch,
                            "defer() requires a callee",
                        )
                        .with_span(stmt.span));
                    };
                    self.scopes[self.cur_scope.0 as usize].defers.push(DeferRecord {
                        callee: callee.clone(),
                        args: rest.to_vec(),
                        span: stmt.span,
                    });
                    // Registration captures the arguments; ownership only
                    // transfers when the record replays on an exit edge.
                    return Ok(());
                }
                "goto" | "goto_begin" | "goto_end" => {
                    let Some(label) = args.first().and_then(|a| a.as_str_lit()) else {
                        return Err(CoreError::new(
                            ErrorKind::LabelNotVisible,
                            format!("{name}() requires a literal label name"),
                        )
                        .with_span(stmt.span));
                    };
                    self.pending.push(PendingJump {
                        from: self.cur_block,
                        label: label.to_string(),
                        site_scope: self.cur_scope,
                        snapshot: self.live_chain(),
                        span: stmt.span,
                        to_end: name == "goto_end",
                    });
                    self.terminated = true;
                    return Ok(());
                }
                _ => {}
            }
        }
        self.push_stmt(stmt.clone());
        Ok(())
    }

    fn lower_loop(
        &mut self,
        cond: Option<&Expr>,
        iter: Option<&Expr>,
        body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<(), CoreError> {
        let parent = self.cur_scope;
        let header = self.new_block(parent);
        let from = self.cur_block;
        self.edge(from, header, EdgeKind::Normal, Vec::new());
        if let Some(cond) = cond {
            self.blocks[header.0 as usize].stmts.push(Stmt::expr(cond.clone()));
        }
        if let Some(iter) = iter {
            self.blocks[header.0 as usize].stmts.push(Stmt::expr(iter.clone()));
        }

        let body_scope = self.new_scope(parent);
        let body_entry = self.new_block(body_scope);
        self.edge(header, body_entry, EdgeKind::Normal, Vec::new());

        let exit = self.new_block(parent);
        self.loop_stack.push(LoopFrame {
            header,
            exit,
            body_scope,
        });

        self.cur_block = body_entry;
        self.cur_scope = body_scope;
        self.terminated = false;
        self.walk_body(body)?;
        if !self.terminated {
            let exits = vec![(body_scope, self.scopes[body_scope.0 as usize].defers.len())];
            let tail = self.cur_block;
            self.edge(tail, header, EdgeKind::Backward, exits);
        }
        self.loop_stack.pop();

        // The else clause runs on normal completion only; break edges point
        // straight at the exit block, past it.
        self.cur_scope = parent;
        self.terminated = false;
        if else_body.is_empty() {
            self.edge(header, exit, EdgeKind::Normal, Vec::new());
        } else {
            let else_scope = self.new_scope(parent);
            let else_entry = self.new_block(else_scope);
            self.edge(header, else_entry, EdgeKind::Normal, Vec::new());
            self.cur_block = else_entry;
            self.cur_scope = else_scope;
            self.walk_body(else_body)?;
            if !self.terminated {
                let exits = vec![(else_scope, self.scopes[else_scope.0 as usize].defers.len())];
                let tail = self.cur_block;
                self.edge(tail, exit, EdgeKind::Normal, exits);
            }
            self.cur_scope = parent;
            self.terminated = false;
        }
        self.cur_block = exit;
        Ok(())
    }

    fn lower_label(&mut self, name: &str, body: &[Stmt], span: Span) -> Result<(), CoreError> {
        if self.labels.contains_key(name) {
            return Err(CoreError::new(
                ErrorKind::LabelNotVisible,
                format!("label '{name}' is defined twice in this function"),
            )
            .with_span(span));
        }
        let parent = self.cur_scope;
        let body_scope = self.new_scope(parent);
        let begin = self.new_block(body_scope);
        let from = self.cur_block;
        self.edge(from, begin, EdgeKind::Normal, Vec::new());

        // `end` lives at the parent level: defers of the body scope have
        // already executed on every edge that reaches it.
        self.cur_block = begin;
        self.cur_scope = body_scope;
        self.terminated = false;
        self.walk_body(body)?;
        let end = self.new_block(parent);
        if !self.terminated {
            let exits = vec![(body_scope, self.scopes[body_scope.0 as usize].defers.len())];
            let tail = self.cur_block;
            self.edge(tail, end, EdgeKind::Normal, exits);
        }
        self.labels.insert(
            name.to_string(),
            LabelInfo {
                name: name.to_string(),
                begin,
                end,
                body_scope,
                parent_scope: parent,
            },
        );
        self.cur_block = end;
        self.cur_scope = parent;
        self.terminated = false;
        Ok(())
    }

    fn ancestor_or_self(&self, scope: ScopeId, candidate: ScopeId) -> bool {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            if s == candidate {
                return true;
            }
            cur = self.scopes[s.0 as usize].parent;
        }
        false
    }

    fn finish(mut self) -> Result<Cfg, CoreError> {
        let exit = self.new_block(ScopeId(0));
        if !self.terminated {
            let exits = self.exits_until(self.cur_scope, None);
            let tail = self.cur_block;
            self.edge(tail, exit, EdgeKind::Normal, exits);
        }

        for jump in std::mem::take(&mut self.pending) {
            if jump.label == RETURN_LABEL {
                self.edges.push(Edge {
                    from: jump.from,
                    to: exit,
                    kind: EdgeKind::Normal,
                    exits: jump.snapshot,
                });
                continue;
            }
            let Some(label) = self.labels.get(&jump.label) else {
                return Err(CoreError::new(
                    ErrorKind::LabelNotVisible,
                    format!("label '{}' is not visible from here", jump.label),
                )
                .with_span(jump.span));
            };
            let label = label.clone();
            if jump.to_end {
                // `end` is inside the label body: only reachable from self
                // or descendants.
                if !self.ancestor_or_self(jump.site_scope, label.body_scope) {
                    return Err(CoreError::new(
                        ErrorKind::GotoEndToUncle,
                        format!(
                            "goto_end(\"{}\") from outside the label body",
                            jump.label
                        ),
                    )
                    .with_span(jump.span));
                }
                let exits: Vec<_> = jump
                    .snapshot
                    .iter()
                    .take_while(|(s, _)| *s != label.parent_scope)
                    .copied()
                    .collect();
                let kind = if label.end.0 <= jump.from.0 {
                    EdgeKind::Backward
                } else {
                    EdgeKind::Normal
                };
                self.edges.push(Edge {
                    from: jump.from,
                    to: label.end,
                    kind,
                    exits,
                });
            } else {
                // `begin` is at the `with` level: self, ancestors, siblings
                // and uncles can all see it.
                if !self.ancestor_or_self(jump.site_scope, label.parent_scope) {
                    return Err(CoreError::new(
                        ErrorKind::LabelNotVisible,
                        format!("label '{}' is not visible from here", jump.label),
                    )
                    .with_span(jump.span));
                }
                let exits: Vec<_> = jump
                    .snapshot
                    .iter()
                    .take_while(|(s, _)| *s != label.parent_scope)
                    .copied()
                    .collect();
                let kind = if label.begin.0 <= jump.from.0 {
                    EdgeKind::Backward
                } else {
                    EdgeKind::Normal
                };
                self.edges.push(Edge {
                    from: jump.from,
                    to: label.begin,
                    kind,
                    exits,
                });
            }
        }

        Ok(Cfg {
            blocks: self.blocks,
            edges: self.edges,
            scopes: self.scopes,
            labels: self.labels,
            entry: BlockId(0),
            exit,
        })
    }
}

const RETURN_LABEL: &str = "\u{0}return";

#[cfg(test)]
mod tests {
    use super::*;
    use pythoc_ast::Expr;

    fn label_stmt(name: &str, body: Vec<Stmt>) -> Stmt {
        Stmt::with_(Expr::call_named("label", vec![Expr::str_(name)]), body)
    }

    fn goto(name: &str) -> Stmt {
        Stmt::expr(Expr::call_named("goto", vec![Expr::str_(name)]))
    }

    fn goto_end(name: &str) -> Stmt {
        Stmt::expr(Expr::call_named("goto_end", vec![Expr::str_(name)]))
    }

    #[test]
    fn straight_line_body_is_one_block_plus_exit() {
        let cfg = build_cfg(&[Stmt::assign_name("x", Expr::int(1))]).unwrap();
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.edges.len(), 1);
        assert_eq!(cfg.edges[0].to, cfg.exit);
    }

    #[test]
    fn if_produces_join() {
        let cfg = build_cfg(&[
            Stmt::if_(
                Expr::bool_(true),
                vec![Stmt::assign_name("x", Expr::int(1))],
                vec![Stmt::assign_name("x", Expr::int(2))],
            ),
        ])
        .unwrap();
        // entry, then, else, join, exit
        assert_eq!(cfg.blocks.len(), 5);
        let join = BlockId(3);
        assert_eq!(cfg.preds(join).count(), 2);
    }

    #[test]
    fn while_back_edge_is_marked() {
        let cfg = build_cfg(&[Stmt::while_(
            Expr::bool_(true),
            vec![Stmt::assign_name("x", Expr::int(1))],
        )])
        .unwrap();
        assert!(cfg.edges.iter().any(|e| e.kind == EdgeKind::Backward));
    }

    #[test]
    fn defer_registers_in_enclosing_scope() {
        let cfg = build_cfg(&[
            Stmt::expr(Expr::call_named(
                "defer",
                vec![Expr::name("cleanup"), Expr::name("r")],
            )),
            Stmt::ret(None),
        ])
        .unwrap();
        assert_eq!(cfg.scopes[0].defers.len(), 1);
        // The return edge exits the root scope with its one defer visible.
        let ret_edge = cfg.preds(cfg.exit).next().unwrap();
        assert_eq!(ret_edge.exits, vec![(ScopeId(0), 1)]);
    }

    #[test]
    fn defer_after_jump_is_not_replayed_on_it() {
        let cfg = build_cfg(&[
            label_stmt("a", vec![Stmt::pass()]),
            Stmt::if_(
                Expr::bool_(true),
                vec![goto("a")],
                vec![],
            ),
            Stmt::expr(Expr::call_named("defer", vec![Expr::name("late")])),
        ])
        .unwrap();
        let label = &cfg.labels["a"];
        let jump = cfg
            .edges
            .iter()
            .find(|e| e.to == label.begin && e.kind == EdgeKind::Backward)
            .expect("backward goto edge");
        // The root scope's late defer was not yet registered at the jump.
        assert!(jump.exits.iter().all(|(_, n)| *n == 0));
    }

    #[test]
    fn forward_goto_resolves() {
        let cfg = build_cfg(&[
            Stmt::if_(Expr::bool_(true), vec![goto("later")], vec![]),
            label_stmt("later", vec![Stmt::assign_name("x", Expr::int(1))]),
        ])
        .unwrap();
        let label = &cfg.labels["later"];
        assert!(cfg
            .edges
            .iter()
            .any(|e| e.to == label.begin && e.kind == EdgeKind::Normal));
    }

    #[test]
    fn goto_to_unknown_label_fails() {
        let err = build_cfg(&[goto("nowhere")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LabelNotVisible);
    }

    #[test]
    fn goto_end_to_sibling_rejected() {
        // S6: label B is a sibling gone out of scope; its end is inside B.
        let err = build_cfg(&[
            label_stmt("a", vec![label_stmt("b", vec![Stmt::pass()])]),
            goto_end("b"),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GotoEndToUncle);
    }

    #[test]
    fn goto_to_uncle_is_visible() {
        let cfg = build_cfg(&[
            label_stmt("outer", vec![Stmt::pass()]),
            label_stmt("other", vec![goto("outer")]),
        ])
        .unwrap();
        let outer = &cfg.labels["outer"];
        assert!(cfg.edges.iter().any(|e| e.to == outer.begin));
    }

    #[test]
    fn goto_end_within_body_allowed() {
        let cfg = build_cfg(&[label_stmt(
            "a",
            vec![Stmt::if_(Expr::bool_(true), vec![goto_end("a")], vec![])],
        )])
        .unwrap();
        let label = &cfg.labels["a"];
        assert!(cfg.edges.iter().any(|e| e.to == label.end));
    }

    #[test]
    fn duplicate_label_rejected() {
        let err = build_cfg(&[
            label_stmt("a", vec![Stmt::pass()]),
            label_stmt("a", vec![Stmt::pass()]),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LabelNotVisible);
    }

    #[test]
    fn unreachable_after_return_rejected() {
        let err = build_cfg(&[
            Stmt::ret(None),
            Stmt::assign_name("x", Expr::int(1)),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnreachableAfterReturn);
    }

    #[test]
    fn break_targets_loop_exit_with_scope_exits() {
        let cfg = build_cfg(&[Stmt::while_(
            Expr::bool_(true),
            vec![
                Stmt::expr(Expr::call_named("defer", vec![Expr::name("tick")])),
                Stmt::break_(),
            ],
        )])
        .unwrap();
        let break_edge = cfg
            .edges
            .iter()
            .find(|e| e.kind == EdgeKind::Normal && e.exits.iter().any(|(_, n)| *n == 1))
            .expect("break edge replaying the loop-body defer");
        assert_eq!(break_edge.exits.len(), 1);
    }
}
