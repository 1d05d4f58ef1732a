//! The inline kernel: closure inlining, generator inlining, and macro-style
//! expansion as one uniform AST substitution.
//!
//! An [`InlineOp`] carries the callee body, the precomputed identifier
//! classification, the call arguments, and a monotonically unique id. Only
//! locals are renamed (`{name}_inline_{id}`); parameters and captures keep
//! their names. Exit statements (`return` / `yield`) are replaced according
//! to the operation's [`ExitRule`].

use std::collections::{BTreeMap, HashSet};
use std::mem;

use pythoc_ast::{Expr, ExprKind, FuncDef, Stmt, StmtKind, TypeExpr};

use crate::error::{CoreError, ErrorKind};
use crate::scope::ScopeClasses;

/// An immutable inlining request.
pub struct InlineOp<'a> {
    pub callee_name: String,
    pub params: Vec<String>,
    pub body: &'a [Stmt],
    pub args: Vec<Expr>,
    pub classes: &'a ScopeClasses,
    pub inline_id: u64,
}

/// How exit statements in the callee body become caller statements.
pub trait ExitRule {
    fn is_exit(&self, stmt: &Stmt) -> bool;
    fn transform_exit(&mut self, stmt: Stmt) -> Result<Vec<Stmt>, CoreError>;
}

/// `return expr` becomes `{result_var} = expr`; a bare `return` is a no-op.
/// When the callee has early returns, `exit_label` carries control to the
/// end of the inlined body.
pub struct ReturnRule {
    pub result_var: Option<String>,
    pub exit_label: Option<String>,
}

impl ExitRule for ReturnRule {
    fn is_exit(&self, stmt: &Stmt) -> bool {
        matches!(stmt.kind, StmtKind::Return(_))
    }

    fn transform_exit(&mut self, stmt: Stmt) -> Result<Vec<Stmt>, CoreError> {
        let StmtKind::Return(value) = stmt.kind else {
            unreachable!("ReturnRule only matches return statements");
        };
        let mut out = Vec::new();
        if let (Some(result), Some(value)) = (&self.result_var, value) {
            out.push(Stmt::assign_name(result, value));
        }
        if let Some(label) = &self.exit_label {
            out.push(goto_end(label));
        }
        Ok(out)
    }
}

/// Target of the caller's `for` loop over a generator.
#[derive(Clone, Debug)]
pub enum LoopTarget {
    Single(String),
    Tuple(Vec<String>),
}

/// `yield e` becomes `{loop_var} = e; <loop_body>`, with the body copy
/// wrapped in a per-yield continue label. A value-less `return` in the
/// generator jumps to `break_label`.
pub struct YieldRule {
    pub target: LoopTarget,
    pub loop_body: Vec<Stmt>,
    pub break_label: String,
    pub continue_label: String,
    emitted: usize,
}

impl YieldRule {
    pub fn new(
        target: LoopTarget,
        loop_body: Vec<Stmt>,
        break_label: String,
        continue_label: String,
    ) -> Self {
        Self {
            target,
            loop_body,
            break_label,
            continue_label,
            emitted: 0,
        }
    }

    fn assign_target(&self, value: Expr) -> Result<Vec<Stmt>, CoreError> {
        match &self.target {
            LoopTarget::Single(name) => Ok(vec![Stmt::assign_name(name, value)]),
            LoopTarget::Tuple(names) => match value.kind {
                ExprKind::Tuple(elems) if elems.len() == names.len() => Ok(names
                    .iter()
                    .zip(elems)
                    .map(|(n, e)| Stmt::assign_name(n, e))
                    .collect()),
                _ => Err(CoreError::new(
                    ErrorKind::TypeMismatch,
                    format!(
                        "yield value does not destructure into {} loop targets",
                        names.len()
                    ),
                )),
            },
        }
    }
}

impl ExitRule for YieldRule {
    fn is_exit(&self, stmt: &Stmt) -> bool {
        matches!(stmt.kind, StmtKind::Yield(_) | StmtKind::Return(_))
    }

    fn transform_exit(&mut self, stmt: Stmt) -> Result<Vec<Stmt>, CoreError> {
        match stmt.kind {
            StmtKind::Return(Some(_)) => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "a generator may not return a value",
            )
            .with_span(stmt.span)),
            // Generator finished early: leave the whole expansion.
            StmtKind::Return(None) => Ok(vec![goto_end(&self.break_label)]),
            StmtKind::Yield(value) => {
                let cont = format!("{}__{}", self.continue_label, self.emitted);
                self.emitted += 1;
                let mut inner = match value {
                    Some(v) => self.assign_target(v)?,
                    None => Vec::new(),
                };
                let mut body_copy = self.loop_body.clone();
                retarget_loop_jumps(&mut body_copy, &self.break_label, &cont);
                inner.extend(body_copy);
                Ok(vec![Stmt::with_(
                    Expr::call_named("label", vec![Expr::str_(&cont)]),
                    inner,
                )])
            }
            _ => unreachable!("YieldRule only matches yield/return statements"),
        }
    }
}

/// Macro expansion: `return expr` becomes the bare expression statement.
pub struct MacroRule;

impl ExitRule for MacroRule {
    fn is_exit(&self, stmt: &Stmt) -> bool {
        matches!(stmt.kind, StmtKind::Return(_))
    }

    fn transform_exit(&mut self, stmt: Stmt) -> Result<Vec<Stmt>, CoreError> {
        let StmtKind::Return(value) = stmt.kind else {
            unreachable!("MacroRule only matches return statements");
        };
        Ok(value.into_iter().map(Stmt::expr).collect())
    }
}

fn goto_end(label: &str) -> Stmt {
    Stmt::expr(Expr::call_named("goto_end", vec![Expr::str_(label)]))
}

/// Rewrite `break`/`continue` that belong to the enclosing generator loop.
/// Recursion stops at nested loops, whose jumps keep their own meaning.
fn retarget_loop_jumps(body: &mut [Stmt], break_label: &str, continue_label: &str) {
    for stmt in body {
        match &mut stmt.kind {
            StmtKind::Break => *stmt = goto_end(break_label),
            StmtKind::Continue => *stmt = goto_end(continue_label),
            StmtKind::If { then_body, else_body, .. } => {
                retarget_loop_jumps(then_body, break_label, continue_label);
                retarget_loop_jumps(else_body, break_label, continue_label);
            }
            StmtKind::With { body, .. } => {
                retarget_loop_jumps(body, break_label, continue_label);
            }
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    retarget_loop_jumps(&mut arm.body, break_label, continue_label);
                }
            }
            // A nested loop owns its break/continue.
            StmtKind::While { .. } | StmtKind::For { .. } => {}
            _ => {}
        }
    }
}

/// The kernel: owns the uniqueness counter and the recursion guard.
pub struct InlineKernel {
    next_id: u64,
    visiting: HashSet<String>,
}

impl Default for InlineKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineKernel {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            visiting: HashSet::new(),
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Guard against recursive inlining. Callers pair this with
    /// [`InlineKernel::leave_callee`].
    pub fn enter_callee(&mut self, name: &str) -> Result<(), CoreError> {
        if !self.visiting.insert(name.to_string()) {
            return Err(CoreError::new(
                ErrorKind::RecursiveInline,
                format!("function '{name}' is inlined recursively"),
            ));
        }
        Ok(())
    }

    pub fn leave_callee(&mut self, name: &str) {
        self.visiting.remove(name);
    }

    /// Core substitution: bindings, rename, exit transformation.
    pub fn expand(&self, op: &InlineOp, rule: &mut dyn ExitRule) -> Result<Vec<Stmt>, CoreError> {
        if op.params.len() != op.args.len() {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!(
                    "'{}' expects {} arguments, got {}",
                    op.callee_name,
                    op.params.len(),
                    op.args.len()
                ),
            ));
        }

        let mut rename = BTreeMap::new();
        for local in &op.classes.locals {
            rename.insert(local.clone(), format!("{local}_inline_{}", op.inline_id));
        }
        let mut label_rename = BTreeMap::new();
        for label in collect_defined_labels(op.body) {
            label_rename.insert(label.clone(), format!("{label}_inline_{}", op.inline_id));
        }

        // Arguments bind left-to-right, in parameter declaration order, so
        // side effects happen exactly once.
        let mut out: Vec<Stmt> = op
            .params
            .iter()
            .zip(op.args.iter())
            .map(|(p, a)| Stmt::assign_name(p, a.clone()))
            .collect();

        let mut body: Vec<Stmt> = op.body.to_vec();
        for stmt in &mut body {
            rename_stmt(stmt, &rename, &label_rename);
        }
        out.extend(transform_exits(body, rule)?);
        Ok(out)
    }

    /// Inline a plain function call: `result = callee(args)`.
    pub fn inline_call(
        &mut self,
        callee: &FuncDef,
        args: Vec<Expr>,
        classes: &ScopeClasses,
        result_var: Option<String>,
    ) -> Result<Vec<Stmt>, CoreError> {
        if body_contains_yield(&callee.body) {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!(
                    "'{}' is a generator and can only be inlined by a for loop",
                    callee.name.node
                ),
            ));
        }
        let inline_id = self.next_id();
        let op = InlineOp {
            callee_name: callee.name.node.clone(),
            params: callee.params.iter().map(|p| p.name.node.clone()).collect(),
            body: &callee.body,
            args,
            classes,
            inline_id,
        };

        if has_early_return(&callee.body) {
            let exit_label = format!("__ret_{}_{inline_id}", callee.name.node);
            let mut rule = ReturnRule {
                result_var,
                exit_label: Some(exit_label.clone()),
            };
            let stmts = self.expand(&op, &mut rule)?;
            Ok(vec![Stmt::with_(
                Expr::call_named("label", vec![Expr::str_(&exit_label)]),
                stmts,
            )])
        } else {
            let mut rule = ReturnRule {
                result_var,
                exit_label: None,
            };
            self.expand(&op, &mut rule)
        }
    }

    /// Inline `for target in gen(args): body else: else_body`.
    ///
    /// Layout: the whole expansion sits in a break-label scope; the `else`
    /// body follows the expanded generator inside it, so normal completion
    /// runs it and a `break` (or generator `return`) skips it.
    pub fn inline_generator_loop(
        &mut self,
        callee: &FuncDef,
        args: Vec<Expr>,
        classes: &ScopeClasses,
        target: &Expr,
        loop_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    ) -> Result<Vec<Stmt>, CoreError> {
        if !body_contains_yield(&callee.body) {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("'{}' has no yield and is not a generator", callee.name.node),
            ));
        }
        let loop_target = loop_target_of(target)?;
        let inline_id = self.next_id();
        let break_label = format!("__gen_break_{inline_id}");
        let continue_label = format!("__gen_continue_{inline_id}");

        let op = InlineOp {
            callee_name: callee.name.node.clone(),
            params: callee.params.iter().map(|p| p.name.node.clone()).collect(),
            body: &callee.body,
            args,
            classes,
            inline_id,
        };
        let mut rule = YieldRule::new(
            loop_target.clone(),
            loop_body,
            break_label.clone(),
            continue_label,
        );
        let mut inner = self.expand(&op, &mut rule)?;
        inner.extend(else_body);

        let mut out = Vec::new();
        // Pre-declare the loop variable; yield points only assign it.
        if let Some(ret) = &callee.ret {
            declare_loop_target(&loop_target, ret, &mut out);
        }
        out.push(Stmt::with_(
            Expr::call_named("label", vec![Expr::str_(&break_label)]),
            inner,
        ));
        Ok(out)
    }

    /// Inline a lambda call: a single-expression callee with an implicit
    /// `return`.
    pub fn inline_lambda(
        &mut self,
        params: &[String],
        body: &Expr,
        args: Vec<Expr>,
        result_var: &str,
    ) -> Result<Vec<Stmt>, CoreError> {
        if params.len() != args.len() {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("lambda expects {} arguments, got {}", params.len(), args.len()),
            ));
        }
        let mut out: Vec<Stmt> = params
            .iter()
            .zip(args)
            .map(|(p, a)| Stmt::assign_name(p, a))
            .collect();
        out.push(Stmt::assign_name(result_var, body.clone()));
        Ok(out)
    }

    /// Unroll `for target in range(...)` / `for target in (c0, c1, ...)`
    /// when every operand is a compile-time constant. Returns `None` when
    /// the iterable is not constant.
    pub fn unroll_constant_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        else_body: &[Stmt],
    ) -> Option<Result<Vec<Stmt>, CoreError>> {
        let values = constant_iterable(iter)?;
        let name = match target.as_name() {
            Some(n) => n.to_string(),
            None => return Some(Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "constant loop unrolling requires a single loop variable",
            ))),
        };
        let inline_id = self.next_id();
        let break_label = format!("__loop_break_{inline_id}");

        let mut inner = Vec::new();
        for (k, value) in values.into_iter().enumerate() {
            let cont = format!("__loop_continue_{inline_id}__{k}");
            let mut iteration = vec![Stmt::assign_name(&name, value)];
            let mut body_copy = body.to_vec();
            retarget_loop_jumps(&mut body_copy, &break_label, &cont);
            iteration.extend(body_copy);
            inner.push(Stmt::with_(
                Expr::call_named("label", vec![Expr::str_(&cont)]),
                iteration,
            ));
        }
        inner.extend(else_body.to_vec());
        Some(Ok(vec![Stmt::with_(
            Expr::call_named("label", vec![Expr::str_(&break_label)]),
            inner,
        )]))
    }
}

fn loop_target_of(target: &Expr) -> Result<LoopTarget, CoreError> {
    match &target.kind {
        ExprKind::Name(n) => Ok(LoopTarget::Single(n.clone())),
        ExprKind::Tuple(elems) => {
            let mut names = Vec::new();
            for e in elems {
                match e.as_name() {
                    Some(n) => names.push(n.to_string()),
                    None => {
                        return Err(CoreError::new(
                            ErrorKind::TypeMismatch,
                            "generator loop targets must be plain names",
                        ))
                    }
                }
            }
            Ok(LoopTarget::Tuple(names))
        }
        _ => Err(CoreError::new(
            ErrorKind::TypeMismatch,
            "generator loop targets must be plain names",
        )),
    }
}

fn declare_loop_target(target: &LoopTarget, ret: &TypeExpr, out: &mut Vec<Stmt>) {
    match target {
        LoopTarget::Single(name) => out.push(Stmt::decl(name, ret.clone())),
        LoopTarget::Tuple(names) => {
            if let pythoc_ast::TypeExprKind::Tuple(elems) = &ret.kind {
                if elems.len() == names.len() {
                    for (n, t) in names.iter().zip(elems) {
                        out.push(Stmt::decl(n, t.clone()));
                    }
                }
            }
        }
    }
}

fn constant_iterable(iter: &Expr) -> Option<Vec<Expr>> {
    if let Some((name, args)) = iter.as_direct_call() {
        if name == "range" && (1..=3).contains(&args.len()) {
            let consts: Option<Vec<i128>> = args.iter().map(|a| a.as_int_lit()).collect();
            let consts = consts?;
            let (start, stop, step) = match consts.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] if *step != 0 => (*start, *stop, *step),
                _ => return None,
            };
            let mut values = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                values.push(Expr::int(i));
                i += step;
            }
            return Some(values);
        }
        return None;
    }
    match &iter.kind {
        ExprKind::Tuple(elems)
            if elems.iter().all(|e| {
                matches!(
                    e.kind,
                    ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::Str(_)
                )
            }) =>
        {
            Some(elems.clone())
        }
        _ => None,
    }
}

pub fn body_contains_yield(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Yield(_) => true,
        StmtKind::If { then_body, else_body, .. } => {
            body_contains_yield(then_body) || body_contains_yield(else_body)
        }
        StmtKind::While { body, else_body, .. } | StmtKind::For { body, else_body, .. } => {
            body_contains_yield(body) || body_contains_yield(else_body)
        }
        StmtKind::Match { arms, .. } => arms.iter().any(|a| body_contains_yield(&a.body)),
        StmtKind::With { body, .. } => body_contains_yield(body),
        _ => false,
    })
}

/// Whether any `return` sits somewhere other than the tail of the top-level
/// body. Those need a label to carry control past the remaining statements.
fn has_early_return(body: &[Stmt]) -> bool {
    fn contains_return(body: &[Stmt]) -> bool {
        body.iter().any(|stmt| match &stmt.kind {
            StmtKind::Return(_) => true,
            StmtKind::If { then_body, else_body, .. } => {
                contains_return(then_body) || contains_return(else_body)
            }
            StmtKind::While { body, else_body, .. }
            | StmtKind::For { body, else_body, .. } => {
                contains_return(body) || contains_return(else_body)
            }
            StmtKind::Match { arms, .. } => arms.iter().any(|a| contains_return(&a.body)),
            StmtKind::With { body, .. } => contains_return(body),
            _ => false,
        })
    }
    match body.split_last() {
        Some((last, rest)) => {
            contains_return(rest)
                || match &last.kind {
                    StmtKind::Return(_) => false,
                    _ => contains_return(std::slice::from_ref(last)),
                }
        }
        None => false,
    }
}

fn collect_defined_labels(body: &[Stmt]) -> Vec<String> {
    let mut out = Vec::new();
    fn walk(body: &[Stmt], out: &mut Vec<String>) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::With { item, body, .. } => {
                    if let Some(("label", [arg])) = item.as_direct_call() {
                        if let Some(name) = arg.as_str_lit() {
                            out.push(name.to_string());
                        }
                    }
                    walk(body, out);
                }
                StmtKind::If { then_body, else_body, .. } => {
                    walk(then_body, out);
                    walk(else_body, out);
                }
                StmtKind::While { body, else_body, .. }
                | StmtKind::For { body, else_body, .. } => {
                    walk(body, out);
                    walk(else_body, out);
                }
                StmtKind::Match { arms, .. } => {
                    for arm in arms {
                        walk(&arm.body, out);
                    }
                }
                _ => {}
            }
        }
    }
    walk(body, &mut out);
    out
}

fn rename_stmt(
    stmt: &mut Stmt,
    rename: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) {
    match &mut stmt.kind {
        StmtKind::Expr(e) => rename_expr(e, rename, labels),
        StmtKind::Assign { target, value } => {
            rename_expr(target, rename, labels);
            rename_expr(value, rename, labels);
        }
        StmtKind::AnnAssign { target, value, .. } => {
            rename_expr(target, rename, labels);
            if let Some(v) = value {
                rename_expr(v, rename, labels);
            }
        }
        StmtKind::Return(v) | StmtKind::Yield(v) => {
            if let Some(v) = v {
                rename_expr(v, rename, labels);
            }
        }
        StmtKind::If { cond, then_body, else_body } => {
            rename_expr(cond, rename, labels);
            for s in then_body.iter_mut().chain(else_body.iter_mut()) {
                rename_stmt(s, rename, labels);
            }
        }
        StmtKind::While { cond, body, else_body } => {
            rename_expr(cond, rename, labels);
            for s in body.iter_mut().chain(else_body.iter_mut()) {
                rename_stmt(s, rename, labels);
            }
        }
        StmtKind::For { target, iter, body, else_body } => {
            rename_expr(target, rename, labels);
            rename_expr(iter, rename, labels);
            for s in body.iter_mut().chain(else_body.iter_mut()) {
                rename_stmt(s, rename, labels);
            }
        }
        StmtKind::Match { subject, arms } => {
            rename_expr(subject, rename, labels);
            for arm in arms {
                rename_pattern(&mut arm.pattern, rename, labels);
                if let Some(g) = &mut arm.guard {
                    rename_expr(g, rename, labels);
                }
                for s in &mut arm.body {
                    rename_stmt(s, rename, labels);
                }
            }
        }
        StmtKind::With { item, binding, body } => {
            rename_expr(item, rename, labels);
            if let Some(b) = binding {
                if let Some(new) = rename.get(&b.node) {
                    b.node = new.clone();
                }
            }
            for s in body {
                rename_stmt(s, rename, labels);
            }
        }
        StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
    }
}

fn rename_pattern(
    pattern: &mut pythoc_ast::Pattern,
    rename: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) {
    use pythoc_ast::Pattern;
    match pattern {
        Pattern::Binding { name, .. } => {
            if let Some(new) = rename.get(&name.node) {
                name.node = new.clone();
            }
        }
        Pattern::Value { expr, .. } => rename_expr(expr, rename, labels),
        Pattern::Or { alts, .. } => {
            for p in alts {
                rename_pattern(p, rename, labels);
            }
        }
        Pattern::Sequence { elems, .. } => {
            for p in elems {
                rename_pattern(p, rename, labels);
            }
        }
        Pattern::Struct { fields, .. } => {
            for (_, p) in fields {
                rename_pattern(p, rename, labels);
            }
        }
        Pattern::Wildcard { .. } => {}
    }
}

fn rename_expr(
    expr: &mut Expr,
    rename: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) {
    // Label intrinsics take string arguments; callee-defined label names get
    // fresh copies so inlining the same callee twice cannot collide.
    if let ExprKind::Call { callee, args, .. } = &mut expr.kind {
        if let Some(name) = callee.as_name() {
            if matches!(name, "label" | "goto" | "goto_begin" | "goto_end") {
                if let Some(arg) = args.first_mut() {
                    if let ExprKind::Str(s) = &mut arg.kind {
                        if let Some(new) = labels.get(s.as_str()) {
                            *s = new.clone();
                        }
                    }
                }
                return;
            }
        }
    }
    match &mut expr.kind {
        ExprKind::Name(n) => {
            if let Some(new) = rename.get(n) {
                *n = new.clone();
            }
        }
        ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Bool(_)
        | ExprKind::Str(_)
        | ExprKind::NoneLit => {}
        ExprKind::Tuple(elems) => {
            for e in elems {
                rename_expr(e, rename, labels);
            }
        }
        ExprKind::Attribute { base, .. } => rename_expr(base, rename, labels),
        ExprKind::Subscript { base, indices } => {
            rename_expr(base, rename, labels);
            for i in indices {
                rename_expr(i, rename, labels);
            }
        }
        ExprKind::Call { callee, args, kwargs } => {
            rename_expr(callee, rename, labels);
            for a in args {
                rename_expr(a, rename, labels);
            }
            for (_, v) in kwargs {
                rename_expr(v, rename, labels);
            }
        }
        ExprKind::Unary { operand, .. } => rename_expr(operand, rename, labels),
        ExprKind::Binary { left, right, .. } | ExprKind::Compare { left, right, .. } => {
            rename_expr(left, rename, labels);
            rename_expr(right, rename, labels);
        }
        ExprKind::Lambda { params, body } => {
            // Lambda parameters shadow outer names inside their body.
            let shadowed: BTreeMap<String, String> = rename
                .iter()
                .filter(|(k, _)| !params.iter().any(|p| &p.node == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            rename_expr(body, &shadowed, labels);
        }
    }
}

fn transform_exits(body: Vec<Stmt>, rule: &mut dyn ExitRule) -> Result<Vec<Stmt>, CoreError> {
    let mut out = Vec::new();
    for mut stmt in body {
        if rule.is_exit(&stmt) {
            out.extend(rule.transform_exit(stmt)?);
            continue;
        }
        match &mut stmt.kind {
            StmtKind::If { then_body, else_body, .. } => {
                *then_body = transform_exits(mem::take(then_body), rule)?;
                *else_body = transform_exits(mem::take(else_body), rule)?;
            }
            StmtKind::While { body, else_body, .. }
            | StmtKind::For { body, else_body, .. } => {
                *body = transform_exits(mem::take(body), rule)?;
                *else_body = transform_exits(mem::take(else_body), rule)?;
            }
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    arm.body = transform_exits(mem::take(&mut arm.body), rule)?;
                }
            }
            StmtKind::With { body, .. } => {
                *body = transform_exits(mem::take(body), rule)?;
            }
            _ => {}
        }
        out.push(stmt);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::classify;
    use pythoc_ast::{ident, BinOp, Decorator, Param, Span};
    use std::collections::BTreeSet;

    fn callee(params: &[&str], body: Vec<Stmt>) -> FuncDef {
        FuncDef {
            span: Span::default(),
            name: ident("callee"),
            decorators: vec![Decorator::Inline],
            params: params
                .iter()
                .map(|p| Param {
                    span: Span::default(),
                    name: ident(p),
                    annotation: Some(TypeExpr::name("i32")),
                })
                .collect(),
            ret: Some(TypeExpr::name("i32")),
            body,
        }
    }

    #[test]
    fn locals_renamed_captures_kept() {
        let f = callee(
            &["a"],
            vec![
                Stmt::assign_name(
                    "tmp",
                    Expr::binary(Expr::name("a"), BinOp::Add, Expr::name("outer")),
                ),
                Stmt::ret(Some(Expr::name("tmp"))),
            ],
        );
        let classes = classify(&f, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        let stmts = kernel
            .inline_call(&f, vec![Expr::int(1)], &classes, Some("r".into()))
            .unwrap();

        // p binding, renamed local assignment, result assignment.
        assert_eq!(stmts.len(), 3);
        let StmtKind::Assign { target, .. } = &stmts[1].kind else {
            panic!("expected local assignment");
        };
        assert_eq!(target.as_name(), Some("tmp_inline_0"));
        let StmtKind::Assign { target, value } = &stmts[2].kind else {
            panic!("expected result assignment");
        };
        assert_eq!(target.as_name(), Some("r"));
        assert_eq!(value.as_name(), Some("tmp_inline_0"));
        // The capture kept its name inside the renamed assignment.
        let StmtKind::Assign { value, .. } = &stmts[1].kind else {
            unreachable!()
        };
        let ExprKind::Binary { right, .. } = &value.kind else {
            panic!("expected binary value");
        };
        assert_eq!(right.as_name(), Some("outer"));
    }

    #[test]
    fn inline_ids_are_unique_per_expansion() {
        let f = callee(&[], vec![
            Stmt::assign_name("tmp", Expr::int(1)),
            Stmt::ret(Some(Expr::name("tmp"))),
        ]);
        let classes = classify(&f, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        let first = kernel
            .inline_call(&f, vec![], &classes, Some("r1".into()))
            .unwrap();
        let second = kernel
            .inline_call(&f, vec![], &classes, Some("r2".into()))
            .unwrap();
        let name_of = |stmts: &[Stmt]| match &stmts[0].kind {
            StmtKind::Assign { target, .. } => target.as_name().unwrap().to_string(),
            _ => panic!("expected assignment"),
        };
        assert_eq!(name_of(&first), "tmp_inline_0");
        assert_eq!(name_of(&second), "tmp_inline_1");
    }

    #[test]
    fn early_return_gets_exit_label() {
        let f = callee(
            &["a"],
            vec![
                Stmt::if_(
                    Expr::compare(Expr::name("a"), pythoc_ast::CmpOp::Lt, Expr::int(0)),
                    vec![Stmt::ret(Some(Expr::int(0)))],
                    vec![],
                ),
                Stmt::ret(Some(Expr::name("a"))),
            ],
        );
        let classes = classify(&f, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        let stmts = kernel
            .inline_call(&f, vec![Expr::int(5)], &classes, Some("r".into()))
            .unwrap();
        // Everything wrapped in a label scope.
        assert_eq!(stmts.len(), 1);
        let StmtKind::With { item, body, .. } = &stmts[0].kind else {
            panic!("expected label wrapper");
        };
        assert_eq!(item.as_direct_call().unwrap().0, "label");
        // Inside: binding, if (with goto_end), result assignment, goto_end.
        assert_eq!(body.len(), 4);
    }

    #[test]
    fn recursion_is_rejected() {
        let mut kernel = InlineKernel::new();
        kernel.enter_callee("f").unwrap();
        let err = kernel.enter_callee("f").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecursiveInline);
        kernel.leave_callee("f");
        assert!(kernel.enter_callee("f").is_ok());
    }

    #[test]
    fn generator_yield_expands_to_assign_plus_body() {
        let gen = callee(
            &["n"],
            vec![
                Stmt::yield_(Expr::int(0)),
                Stmt::yield_(Expr::name("n")),
            ],
        );
        let classes = classify(&gen, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        let stmts = kernel
            .inline_generator_loop(
                &gen,
                vec![Expr::int(7)],
                &classes,
                &Expr::name("x"),
                vec![Stmt::expr(Expr::call_named("use", vec![Expr::name("x")]))],
                vec![],
            )
            .unwrap();

        // Loop-var declaration, then the break-label scope.
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0].kind, StmtKind::AnnAssign { .. }));
        let StmtKind::With { body, .. } = &stmts[1].kind else {
            panic!("expected break label scope");
        };
        // Binding n = 7, then two per-yield continue scopes.
        assert_eq!(body.len(), 3);
        let StmtKind::With { item, body: yield_body, .. } = &body[1].kind else {
            panic!("expected continue label scope");
        };
        assert_eq!(item.as_direct_call().unwrap().0, "label");
        let StmtKind::Assign { target, .. } = &yield_body[0].kind else {
            panic!("expected loop-var assignment");
        };
        assert_eq!(target.as_name(), Some("x"));
    }

    #[test]
    fn generator_with_value_return_rejected() {
        let gen = callee(
            &[],
            vec![
                Stmt::yield_(Expr::int(0)),
                Stmt::ret(Some(Expr::int(1))),
            ],
        );
        let classes = classify(&gen, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        let err = kernel
            .inline_generator_loop(
                &gen,
                vec![],
                &classes,
                &Expr::name("x"),
                vec![Stmt::pass()],
                vec![],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn non_generator_rejected_by_loop_inline() {
        let f = callee(&[], vec![Stmt::ret(Some(Expr::int(1)))]);
        let classes = classify(&f, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        assert!(kernel
            .inline_generator_loop(&f, vec![], &classes, &Expr::name("x"), vec![], vec![])
            .is_err());
    }

    #[test]
    fn break_in_loop_body_targets_break_label() {
        let gen = callee(&[], vec![Stmt::yield_(Expr::int(0))]);
        let classes = classify(&gen, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        let stmts = kernel
            .inline_generator_loop(
                &gen,
                vec![],
                &classes,
                &Expr::name("x"),
                vec![Stmt::break_()],
                vec![],
            )
            .unwrap();
        let StmtKind::With { body, .. } = &stmts[1].kind else {
            panic!("expected break label scope");
        };
        let StmtKind::With { body: yield_body, .. } = &body[0].kind else {
            panic!("expected continue label scope");
        };
        let StmtKind::Expr(e) = &yield_body[1].kind else {
            panic!("expected goto_end");
        };
        let (name, args) = e.as_direct_call().unwrap();
        assert_eq!(name, "goto_end");
        assert_eq!(args[0].as_str_lit(), Some("__gen_break_0"));
    }

    #[test]
    fn callee_labels_are_renamed() {
        let f = callee(
            &[],
            vec![
                Stmt::with_(
                    Expr::call_named("label", vec![Expr::str_("loop")]),
                    vec![Stmt::expr(Expr::call_named(
                        "goto_end",
                        vec![Expr::str_("loop")],
                    ))],
                ),
                Stmt::ret(None),
            ],
        );
        let classes = classify(&f, &BTreeSet::new());
        let mut kernel = InlineKernel::new();
        let stmts = kernel.inline_call(&f, vec![], &classes, None).unwrap();
        let StmtKind::With { item, body, .. } = &stmts[0].kind else {
            panic!("expected label scope");
        };
        let (_, args) = item.as_direct_call().unwrap();
        assert_eq!(args[0].as_str_lit(), Some("loop_inline_0"));
        let StmtKind::Expr(e) = &body[0].kind else {
            panic!("expected goto_end");
        };
        assert_eq!(
            e.as_direct_call().unwrap().1[0].as_str_lit(),
            Some("loop_inline_0")
        );
    }

    #[test]
    fn constant_range_unrolls() {
        let mut kernel = InlineKernel::new();
        let stmts = kernel
            .unroll_constant_for(
                &Expr::name("i"),
                &Expr::call_named("range", vec![Expr::int(3)]),
                &[Stmt::expr(Expr::call_named("use", vec![Expr::name("i")]))],
                &[],
            )
            .unwrap()
            .unwrap();
        assert_eq!(stmts.len(), 1);
        let StmtKind::With { body, .. } = &stmts[0].kind else {
            panic!("expected break label scope");
        };
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn runtime_iterable_is_not_unrolled() {
        let mut kernel = InlineKernel::new();
        assert!(kernel
            .unroll_constant_for(
                &Expr::name("i"),
                &Expr::name("xs"),
                &[Stmt::pass()],
                &[],
            )
            .is_none());
    }

    #[test]
    fn macro_rule_substitutes_expression() {
        let mut rule = MacroRule;
        let out = rule
            .transform_exit(Stmt::ret(Some(Expr::int(42))))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].kind, StmtKind::Expr(e) if e.as_int_lit() == Some(42)));
    }

    #[test]
    fn plain_inline_is_idempotent_up_to_ids() {
        let f = callee(&[], vec![
            Stmt::assign_name("tmp", Expr::int(3)),
            Stmt::ret(Some(Expr::name("tmp"))),
        ]);
        let classes = classify(&f, &BTreeSet::new());
        let mut k1 = InlineKernel::new();
        let mut k2 = InlineKernel::new();
        let a = k1.inline_call(&f, vec![], &classes, Some("r".into())).unwrap();
        let b = k2.inline_call(&f, vec![], &classes, Some("r".into())).unwrap();
        assert_eq!(a, b);
    }
}
