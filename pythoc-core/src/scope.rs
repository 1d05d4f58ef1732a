//! Identifier classification for the inline kernel.
//!
//! Before a callee body is rewritten, every name in it is classified as a
//! parameter, a local, or a capture. The classification is computed once and
//! handed to the rewriter as immutable input; only locals are ever renamed.

use std::collections::BTreeSet;

use pythoc_ast::{Expr, ExprKind, FuncDef, Stmt, StmtKind};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeClasses {
    pub params: BTreeSet<String>,
    pub locals: BTreeSet<String>,
    pub captured: BTreeSet<String>,
}

impl ScopeClasses {
    pub fn is_local(&self, name: &str) -> bool {
        self.locals.contains(name)
    }
}

/// Classify every identifier in `func`'s body. `known_globals` are names the
/// registry can resolve (functions, types, builtins, effect values); reads
/// of anything else that is neither a parameter nor assigned locally are
/// captures from the caller scope.
pub fn classify(func: &FuncDef, known_globals: &BTreeSet<String>) -> ScopeClasses {
    let params: BTreeSet<String> = func
        .params
        .iter()
        .map(|p| p.name.node.clone())
        .collect();

    let mut assigned = BTreeSet::new();
    let mut read = BTreeSet::new();
    collect_body(&func.body, &mut assigned, &mut read);

    let locals: BTreeSet<String> = assigned
        .into_iter()
        .filter(|n| !params.contains(n))
        .collect();

    let captured = read
        .into_iter()
        .filter(|n| {
            !params.contains(n) && !locals.contains(n) && !known_globals.contains(n)
        })
        .collect();

    ScopeClasses {
        params,
        locals,
        captured,
    }
}

fn collect_body(body: &[Stmt], assigned: &mut BTreeSet<String>, read: &mut BTreeSet<String>) {
    for stmt in body {
        collect_stmt(stmt, assigned, read);
    }
}

fn collect_stmt(stmt: &Stmt, assigned: &mut BTreeSet<String>, read: &mut BTreeSet<String>) {
    match &stmt.kind {
        StmtKind::Expr(e) => collect_expr(e, read),
        StmtKind::Assign { target, value } => {
            collect_target(target, assigned, read);
            collect_expr(value, read);
        }
        StmtKind::AnnAssign { target, value, .. } => {
            collect_target(target, assigned, read);
            if let Some(v) = value {
                collect_expr(v, read);
            }
        }
        StmtKind::Return(v) | StmtKind::Yield(v) => {
            if let Some(v) = v {
                collect_expr(v, read);
            }
        }
        StmtKind::If { cond, then_body, else_body } => {
            collect_expr(cond, read);
            collect_body(then_body, assigned, read);
            collect_body(else_body, assigned, read);
        }
        StmtKind::While { cond, body, else_body } => {
            collect_expr(cond, read);
            collect_body(body, assigned, read);
            collect_body(else_body, assigned, read);
        }
        StmtKind::For { target, iter, body, else_body } => {
            collect_target(target, assigned, read);
            collect_expr(iter, read);
            collect_body(body, assigned, read);
            collect_body(else_body, assigned, read);
        }
        StmtKind::Match { subject, arms } => {
            collect_expr(subject, read);
            for arm in arms {
                collect_pattern_bindings(&arm.pattern, assigned);
                if let Some(g) = &arm.guard {
                    collect_expr(g, read);
                }
                collect_body(&arm.body, assigned, read);
            }
        }
        StmtKind::With { item, binding, body } => {
            collect_expr(item, read);
            if let Some(b) = binding {
                assigned.insert(b.node.clone());
            }
            collect_body(body, assigned, read);
        }
        StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
    }
}

fn collect_target(target: &Expr, assigned: &mut BTreeSet<String>, read: &mut BTreeSet<String>) {
    match &target.kind {
        ExprKind::Name(n) => {
            assigned.insert(n.clone());
        }
        ExprKind::Tuple(elems) => {
            for e in elems {
                collect_target(e, assigned, read);
            }
        }
        // `a.b = e` / `a[i] = e` write through `a`, which must already exist.
        ExprKind::Attribute { base, .. } => collect_expr(base, read),
        ExprKind::Subscript { base, indices } => {
            collect_expr(base, read);
            for i in indices {
                collect_expr(i, read);
            }
        }
        _ => collect_expr(target, read),
    }
}

fn collect_pattern_bindings(pattern: &pythoc_ast::Pattern, assigned: &mut BTreeSet<String>) {
    use pythoc_ast::Pattern;
    match pattern {
        Pattern::Binding { name, .. } => {
            assigned.insert(name.node.clone());
        }
        Pattern::Or { alts, .. } => {
            for p in alts {
                collect_pattern_bindings(p, assigned);
            }
        }
        Pattern::Sequence { elems, .. } => {
            for p in elems {
                collect_pattern_bindings(p, assigned);
            }
        }
        Pattern::Struct { fields, .. } => {
            for (_, p) in fields {
                collect_pattern_bindings(p, assigned);
            }
        }
        Pattern::Wildcard { .. } | Pattern::Value { .. } => {}
    }
}

fn collect_expr(expr: &Expr, read: &mut BTreeSet<String>) {
    match &expr.kind {
        ExprKind::Name(n) => {
            read.insert(n.clone());
        }
        ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Bool(_)
        | ExprKind::Str(_)
        | ExprKind::NoneLit => {}
        ExprKind::Tuple(elems) => {
            for e in elems {
                collect_expr(e, read);
            }
        }
        ExprKind::Attribute { base, .. } => collect_expr(base, read),
        ExprKind::Subscript { base, indices } => {
            collect_expr(base, read);
            for i in indices {
                collect_expr(i, read);
            }
        }
        ExprKind::Call { callee, args, kwargs } => {
            collect_expr(callee, read);
            for a in args {
                collect_expr(a, read);
            }
            for (_, v) in kwargs {
                collect_expr(v, read);
            }
        }
        ExprKind::Unary { operand, .. } => collect_expr(operand, read),
        ExprKind::Binary { left, right, .. } | ExprKind::Compare { left, right, .. } => {
            collect_expr(left, read);
            collect_expr(right, read);
        }
        ExprKind::Lambda { params, body } => {
            // Lambda parameters shadow; reads of them are not captures.
            let mut inner = BTreeSet::new();
            collect_expr(body, &mut inner);
            for n in inner {
                if !params.iter().any(|p| p.node == n) {
                    read.insert(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pythoc_ast::{ident, Decorator, Param, Span, TypeExpr};

    fn func(params: &[&str], body: Vec<Stmt>) -> FuncDef {
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
    fn params_locals_and_captures_split() {
        let f = func(
            &["a"],
            vec![
                Stmt::assign_name("tmp", Expr::binary(
                    Expr::name("a"),
                    pythoc_ast::BinOp::Add,
                    Expr::name("outer"),
                )),
                Stmt::ret(Some(Expr::name("tmp"))),
            ],
        );
        let classes = classify(&f, &BTreeSet::new());
        assert!(classes.params.contains("a"));
        assert!(classes.locals.contains("tmp"));
        assert_eq!(
            classes.captured.iter().collect::<Vec<_>>(),
            vec!["outer"]
        );
    }

    #[test]
    fn globals_are_not_captures() {
        let f = func(
            &[],
            vec![Stmt::ret(Some(Expr::call_named("helper", vec![])))],
        );
        let globals = BTreeSet::from(["helper".to_string()]);
        let classes = classify(&f, &globals);
        assert!(classes.captured.is_empty());
    }

    #[test]
    fn for_targets_are_locals() {
        let f = func(
            &[],
            vec![Stmt::for_(
                Expr::name("i"),
                Expr::call_named("range", vec![Expr::int(3)]),
                vec![Stmt::pass()],
            )],
        );
        let globals = BTreeSet::from(["range".to_string()]);
        let classes = classify(&f, &globals);
        assert!(classes.locals.contains("i"));
        assert!(classes.captured.is_empty());
    }
}
