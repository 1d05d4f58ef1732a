//! The AST transform pipeline run before type checking: `@inline` call
//! expansion, generator-loop inlining, lambda substitution, constant-loop
//! unrolling, and the for-else lowering of `refine`.
//!
//! Expansion is innermost-first: a callee body is itself transformed before
//! it is spliced into the caller, with the kernel's visiting set rejecting
//! recursive inlining.

use std::collections::HashMap;
use std::mem;

use pythoc_ast::{Expr, ExprKind, FuncDef, Stmt, StmtKind};

use crate::error::{CoreError, ErrorKind};
use crate::inline::InlineKernel;
use crate::refine;
use crate::registry::{Entity, Registry};
use crate::scope::classify;

pub struct Transformer<'a> {
    registry: &'a Registry,
    kernel: &'a mut InlineKernel,
    /// Compile-time lambda bindings in the current body.
    lambdas: HashMap<String, (Vec<String>, Expr)>,
}

impl<'a> Transformer<'a> {
    pub fn new(registry: &'a Registry, kernel: &'a mut InlineKernel) -> Self {
        Self {
            registry,
            kernel,
            lambdas: HashMap::new(),
        }
    }

    pub fn transform_body(&mut self, body: Vec<Stmt>) -> Result<Vec<Stmt>, CoreError> {
        let mut out = Vec::new();
        for stmt in body {
            self.transform_stmt(stmt, &mut out)?;
        }
        Ok(out)
    }

    fn transform_stmt(&mut self, mut stmt: Stmt, out: &mut Vec<Stmt>) -> Result<(), CoreError> {
        match &mut stmt.kind {
            StmtKind::Assign { target, value } => {
                // Record and erase compile-time lambda bindings.
                if let (Some(name), ExprKind::Lambda { params, body }) =
                    (target.as_name(), &value.kind)
                {
                    self.lambdas.insert(
                        name.to_string(),
                        (
                            params.iter().map(|p| p.node.clone()).collect(),
                            (**body).clone(),
                        ),
                    );
                    return Ok(());
                }
                // Direct statement-position expansion keeps the target as
                // the result variable.
                if let Some((callee, _)) = value.as_direct_call() {
                    let callee = callee.to_string();
                    if let Some(name) = target.as_name() {
                        let name = name.to_string();
                        if let ExprKind::Call { args, .. } = &mut value.kind {
                            let mut args = mem::take(args);
                            for a in &mut args {
                                self.hoist_expr(a, out)?;
                            }
                            if self.is_inline_fn(&callee) {
                                out.extend(self.expand_inline_call(
                                    &callee,
                                    args,
                                    Some(name),
                                )?);
                                return Ok(());
                            }
                            if let Some((params, body)) = self.lambdas.get(&callee).cloned() {
                                out.extend(self.kernel.inline_lambda(
                                    &params, &body, args, &name,
                                )?);
                                return Ok(());
                            }
                            // Not expandable: put the arguments back.
                            if let ExprKind::Call { args: slot, .. } = &mut value.kind {
                                *slot = args;
                            }
                        }
                    }
                }
                self.check_no_stray_generator(value)?;
                self.hoist_expr(value, out)?;
                out.push(stmt);
                Ok(())
            }
            StmtKind::AnnAssign { value, .. } => {
                if let Some(v) = value {
                    self.check_no_stray_generator(v)?;
                    self.hoist_expr(v, out)?;
                }
                out.push(stmt);
                Ok(())
            }
            StmtKind::Expr(e) => {
                if let Some((callee, _)) = e.as_direct_call() {
                    let callee = callee.to_string();
                    if callee == "refine" {
                        return Err(CoreError::new(
                            ErrorKind::RefineOutsideForLoop,
                            "refine() is only valid as the iterable of a for loop",
                        )
                        .with_span(stmt.span));
                    }
                    if self.is_inline_fn(&callee) {
                        let ExprKind::Call { args, .. } = &mut e.kind else {
                            unreachable!()
                        };
                        let mut args = mem::take(args);
                        for a in &mut args {
                            self.hoist_expr(a, out)?;
                        }
                        out.extend(self.expand_inline_call(&callee, args, None)?);
                        return Ok(());
                    }
                }
                self.check_no_stray_generator(e)?;
                self.hoist_expr(e, out)?;
                out.push(stmt);
                Ok(())
            }
            StmtKind::Return(v) | StmtKind::Yield(v) => {
                if let Some(v) = v {
                    self.check_no_stray_generator(v)?;
                    self.hoist_expr(v, out)?;
                }
                out.push(stmt);
                Ok(())
            }
            StmtKind::If { cond, then_body, else_body } => {
                self.hoist_expr(cond, out)?;
                *then_body = self.transform_body(mem::take(then_body))?;
                *else_body = self.transform_body(mem::take(else_body))?;
                out.push(stmt);
                Ok(())
            }
            StmtKind::While { cond, body, else_body } => {
                self.hoist_expr(cond, out)?;
                *body = self.transform_body(mem::take(body))?;
                *else_body = self.transform_body(mem::take(else_body))?;
                out.push(stmt);
                Ok(())
            }
            StmtKind::For { .. } => {
                let StmtKind::For { target, iter, body, else_body } = stmt.kind else {
                    unreachable!()
                };
                self.transform_for(stmt.span, target, iter, body, else_body, out)
            }
            StmtKind::Match { subject, arms } => {
                self.hoist_expr(subject, out)?;
                for arm in arms.iter_mut() {
                    arm.body = self.transform_body(mem::take(&mut arm.body))?;
                }
                out.push(stmt);
                Ok(())
            }
            StmtKind::With { body, .. } => {
                *body = self.transform_body(mem::take(body))?;
                out.push(stmt);
                Ok(())
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {
                out.push(stmt);
                Ok(())
            }
        }
    }

    fn transform_for(
        &mut self,
        span: pythoc_ast::Span,
        target: Expr,
        mut iter: Expr,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        out: &mut Vec<Stmt>,
    ) -> Result<(), CoreError> {
        // `for x in refine(values..., preds...)`
        if let Some(("refine", args)) = iter.as_direct_call() {
            let (values, preds) = self.split_refine_args(args)?;
            let lowered = refine::lower_refine_for(
                &target,
                &values,
                &preds,
                body,
                else_body,
                self.kernel.next_id(),
            )?;
            out.extend(self.transform_body(lowered)?);
            return Ok(());
        }

        // `for x in gen(args)` over a generator function.
        if let Some((callee, _)) = iter.as_direct_call() {
            let callee = callee.to_string();
            if let Some(info) = self.registry.base_function(&callee) {
                if info.is_generator {
                    let Some(def) = info.def.clone() else {
                        return Err(CoreError::new(
                            ErrorKind::TypeMismatch,
                            format!("generator '{callee}' has no retained body"),
                        )
                        .with_span(span));
                    };
                    let ExprKind::Call { args, .. } = &mut iter.kind else {
                        unreachable!()
                    };
                    let mut args = mem::take(args);
                    for a in &mut args {
                        self.hoist_expr(a, out)?;
                    }
                    let expanded = self.with_expanded_callee(&callee, &def, |t, callee_def| {
                        let classes = classify(callee_def, &t.registry.global_names());
                        t.kernel.inline_generator_loop(
                            callee_def,
                            args.clone(),
                            &classes,
                            &target,
                            body.clone(),
                            else_body.clone(),
                        )
                    })?;
                    out.extend(self.transform_body(expanded)?);
                    return Ok(());
                }
            }
        }

        // Constant iterables unroll in place.
        if let Some(result) =
            self.kernel
                .unroll_constant_for(&target, &iter, &body, &else_body)
        {
            let unrolled = result?;
            out.extend(self.transform_body(unrolled)?);
            return Ok(());
        }

        // Runtime iteration stays a loop.
        let body = self.transform_body(body)?;
        let else_body = self.transform_body(else_body)?;
        out.push(Stmt {
            span,
            kind: StmtKind::For {
                target,
                iter,
                body,
                else_body,
            },
        });
        Ok(())
    }

    /// Expand a call to an `@inline` function, transforming the callee body
    /// first so nested expansions happen innermost-first.
    fn expand_inline_call(
        &mut self,
        callee: &str,
        args: Vec<Expr>,
        result_var: Option<String>,
    ) -> Result<Vec<Stmt>, CoreError> {
        let info = self
            .registry
            .base_function(callee)
            .expect("checked by is_inline_fn");
        let def = info.def.clone().ok_or_else(|| {
            CoreError::new(
                ErrorKind::TypeMismatch,
                format!("inline function '{callee}' has no retained body"),
            )
        })?;
        self.with_expanded_callee(callee, &def, |t, callee_def| {
            let classes = classify(callee_def, &t.registry.global_names());
            t.kernel
                .inline_call(callee_def, args.clone(), &classes, result_var.clone())
        })
    }

    /// Transform the callee body under the recursion guard, then run `f`
    /// with the fully expanded definition.
    fn with_expanded_callee<F>(
        &mut self,
        name: &str,
        def: &FuncDef,
        f: F,
    ) -> Result<Vec<Stmt>, CoreError>
    where
        F: FnOnce(&mut Self, &FuncDef) -> Result<Vec<Stmt>, CoreError>,
    {
        self.kernel.enter_callee(name)?;
        let transformed = {
            let mut inner = Transformer::new(self.registry, &mut *self.kernel);
            inner.transform_body(def.body.clone())
        };
        let result = match transformed {
            Ok(body) => {
                let expanded = FuncDef {
                    body,
                    ..def.clone()
                };
                f(self, &expanded)
            }
            Err(e) => Err(e),
        };
        self.kernel.leave_callee(name);
        result
    }

    fn is_inline_fn(&self, name: &str) -> bool {
        self.registry
            .base_function(name)
            .map(|f| f.is_inline && !f.is_generator)
            .unwrap_or(false)
    }

    fn is_generator_fn(&self, name: &str) -> bool {
        self.registry
            .base_function(name)
            .map(|f| f.is_generator)
            .unwrap_or(false)
    }

    fn check_no_stray_generator(&self, e: &Expr) -> Result<(), CoreError> {
        if let Some((callee, _)) = e.as_direct_call() {
            if self.is_generator_fn(callee) {
                return Err(CoreError::new(
                    ErrorKind::TypeMismatch,
                    format!("generator '{callee}' can only be consumed by a for loop"),
                )
                .with_span(e.span));
            }
        }
        Ok(())
    }

    /// Hoist nested `@inline` and lambda calls out of an expression into
    /// temporaries, innermost-first.
    fn hoist_expr(&mut self, e: &mut Expr, out: &mut Vec<Stmt>) -> Result<(), CoreError> {
        match &mut e.kind {
            ExprKind::Call { callee, args, kwargs } => {
                for a in args.iter_mut() {
                    self.hoist_expr(a, out)?;
                }
                for (_, v) in kwargs.iter_mut() {
                    self.hoist_expr(v, out)?;
                }
                let Some(name) = callee.as_name().map(str::to_string) else {
                    return Ok(());
                };
                if name == "refine" {
                    return Err(CoreError::new(
                        ErrorKind::RefineOutsideForLoop,
                        "refine() is only valid as the iterable of a for loop",
                    )
                    .with_span(e.span));
                }
                if self.is_inline_fn(&name) {
                    let tmp = format!("__inline_res_{}", self.kernel.next_id());
                    let args = mem::take(args);
                    out.extend(self.expand_inline_call(&name, args, Some(tmp.clone()))?);
                    *e = Expr::name(&tmp);
                } else if let Some((params, body)) = self.lambdas.get(&name).cloned() {
                    let tmp = format!("__inline_res_{}", self.kernel.next_id());
                    let args = mem::take(args);
                    out.extend(self.kernel.inline_lambda(&params, &body, args, &tmp)?);
                    *e = Expr::name(&tmp);
                }
                Ok(())
            }
            ExprKind::Tuple(elems) => {
                for el in elems {
                    self.hoist_expr(el, out)?;
                }
                Ok(())
            }
            ExprKind::Binary { left, right, .. } | ExprKind::Compare { left, right, .. } => {
                self.hoist_expr(left, out)?;
                self.hoist_expr(right, out)
            }
            ExprKind::Unary { operand, .. } => self.hoist_expr(operand, out),
            ExprKind::Attribute { base, .. } => self.hoist_expr(base, out),
            ExprKind::Subscript { base, indices } => {
                self.hoist_expr(base, out)?;
                for i in indices {
                    self.hoist_expr(i, out)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Split `refine(values..., preds...)`: a bare name bound to a function
    /// is a predicate reference, everything else is a value.
    fn split_refine_args(&self, args: &[Expr]) -> Result<(Vec<Expr>, Vec<String>), CoreError> {
        let mut values = Vec::new();
        let mut preds = Vec::new();
        for arg in args {
            if let Some(name) = arg.as_name() {
                if matches!(self.registry.lookup(name), Some(Entity::Func(_))) {
                    preds.push(name.to_string());
                    continue;
                }
            }
            if !preds.is_empty() {
                return Err(CoreError::new(
                    ErrorKind::TypeShapeInvalid,
                    "refine() values must precede predicates",
                )
                .with_span(arg.span));
            }
            values.push(arg.clone());
        }
        Ok((values, preds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FuncInfo, SymbolKey};
    use crate::types::TypeArena;
    use pythoc_ast::{ident, Decorator, Param, Span, TypeExpr};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn func(name: &str, params: &[&str], body: Vec<Stmt>, inline: bool) -> FuncDef {
        FuncDef {
            span: Span::default(),
            name: ident(name),
            decorators: if inline {
                vec![Decorator::Inline]
            } else {
                vec![Decorator::Compile { suffix: None }]
            },
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

    fn register(registry: &mut Registry, arena: &mut TypeArena, def: FuncDef, inline: bool) {
        let i32_ = arena.i32_();
        let sig = arena.func_type(vec![i32_; def.params.len()], i32_, false);
        let is_generator = crate::inline::body_contains_yield(&def.body);
        registry.insert_function(FuncInfo {
            key: SymbolKey::base(&def.name.node),
            sig,
            def: Some(Arc::new(def)),
            is_inline: inline,
            is_generator,
            extern_lib: None,
            effect_reads: BTreeSet::new(),
            transitive_reads: BTreeSet::new(),
            callees: BTreeSet::new(),
        });
    }

    #[test]
    fn statement_call_to_inline_fn_expands() {
        let mut arena = TypeArena::new();
        let mut registry = Registry::new();
        register(
            &mut registry,
            &mut arena,
            func("double", &["x"], vec![Stmt::ret(Some(Expr::binary(
                Expr::name("x"),
                pythoc_ast::BinOp::Add,
                Expr::name("x"),
            )))], true),
            true,
        );
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let out = t
            .transform_body(vec![Stmt::assign_name(
                "r",
                Expr::call_named("double", vec![Expr::int(21)]),
            )])
            .unwrap();
        // binding x = 21, r = x + x
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0].kind, StmtKind::Assign { target, .. }
            if target.as_name() == Some("x")));
    }

    #[test]
    fn nested_inline_call_is_hoisted() {
        let mut arena = TypeArena::new();
        let mut registry = Registry::new();
        register(
            &mut registry,
            &mut arena,
            func("one", &[], vec![Stmt::ret(Some(Expr::int(1)))], true),
            true,
        );
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let out = t
            .transform_body(vec![Stmt::expr(Expr::call_named(
                "use",
                vec![Expr::call_named("one", vec![])],
            ))])
            .unwrap();
        // Temp assignment from the expansion, then the rewritten call.
        assert!(out.len() >= 2);
        let StmtKind::Expr(last) = &out.last().unwrap().kind else {
            panic!("expected call statement");
        };
        let (_, args) = last.as_direct_call().unwrap();
        assert!(args[0].as_name().unwrap().starts_with("__inline_res_"));
    }

    #[test]
    fn recursive_inline_rejected() {
        let mut arena = TypeArena::new();
        let mut registry = Registry::new();
        register(
            &mut registry,
            &mut arena,
            func(
                "loopy",
                &[],
                vec![Stmt::assign_name("r", Expr::call_named("loopy", vec![]))],
                true,
            ),
            true,
        );
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let err = t
            .transform_body(vec![Stmt::assign_name(
                "r",
                Expr::call_named("loopy", vec![]),
            )])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecursiveInline);
    }

    #[test]
    fn generator_outside_for_rejected() {
        let mut arena = TypeArena::new();
        let mut registry = Registry::new();
        register(
            &mut registry,
            &mut arena,
            func("gen", &[], vec![Stmt::yield_(Expr::int(1))], false),
            false,
        );
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let err = t
            .transform_body(vec![Stmt::assign_name(
                "g",
                Expr::call_named("gen", vec![]),
            )])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn generator_for_loop_expands() {
        let mut arena = TypeArena::new();
        let mut registry = Registry::new();
        register(
            &mut registry,
            &mut arena,
            func(
                "pair",
                &[],
                vec![Stmt::yield_(Expr::int(0)), Stmt::yield_(Expr::int(1))],
                false,
            ),
            false,
        );
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let out = t
            .transform_body(vec![Stmt::for_(
                Expr::name("x"),
                Expr::call_named("pair", vec![]),
                vec![Stmt::expr(Expr::call_named("use", vec![Expr::name("x")]))],
            )])
            .unwrap();
        // Declaration plus break-label scope; no For remains.
        assert!(out.iter().all(|s| !matches!(s.kind, StmtKind::For { .. })));
        assert!(out
            .iter()
            .any(|s| matches!(&s.kind, StmtKind::With { item, .. }
                if item.as_direct_call().map(|c| c.0) == Some("label"))));
    }

    #[test]
    fn nested_generators_expand_innermost_first() {
        let mut arena = TypeArena::new();
        let mut registry = Registry::new();
        register(
            &mut registry,
            &mut arena,
            func("inner", &[], vec![Stmt::yield_(Expr::int(1))], false),
            false,
        );
        register(
            &mut registry,
            &mut arena,
            func(
                "outer",
                &[],
                vec![Stmt::for_(
                    Expr::name("v"),
                    Expr::call_named("inner", vec![]),
                    vec![Stmt::yield_(Expr::name("v"))],
                )],
                false,
            ),
            false,
        );
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let out = t
            .transform_body(vec![Stmt::for_(
                Expr::name("x"),
                Expr::call_named("outer", vec![]),
                vec![Stmt::pass()],
            )])
            .unwrap();
        fn contains_for(body: &[Stmt]) -> bool {
            body.iter().any(|s| match &s.kind {
                StmtKind::For { .. } => true,
                StmtKind::With { body, .. } => contains_for(body),
                StmtKind::If { then_body, else_body, .. } => {
                    contains_for(then_body) || contains_for(else_body)
                }
                _ => false,
            })
        }
        assert!(!contains_for(&out));
    }

    #[test]
    fn lambda_binding_erased_and_substituted() {
        let registry = Registry::new();
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let out = t
            .transform_body(vec![
                Stmt::assign_name(
                    "add1",
                    Expr::lambda(vec!["v"], Expr::binary(
                        Expr::name("v"),
                        pythoc_ast::BinOp::Add,
                        Expr::int(1),
                    )),
                ),
                Stmt::assign_name("r", Expr::call_named("add1", vec![Expr::int(4)])),
            ])
            .unwrap();
        // v = 4, r = v + 1; lambda binding erased.
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0].kind, StmtKind::Assign { target, .. }
            if target.as_name() == Some("v")));
    }

    #[test]
    fn refine_outside_for_rejected() {
        let registry = Registry::new();
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let err = t
            .transform_body(vec![Stmt::expr(Expr::call_named(
                "refine",
                vec![Expr::int(1)],
            ))])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefineOutsideForLoop);
    }

    #[test]
    fn refine_for_lowering_splits_values_and_predicates() {
        let mut arena = TypeArena::new();
        let mut registry = Registry::new();
        register(
            &mut registry,
            &mut arena,
            func("is_positive", &["v"], vec![Stmt::ret(Some(Expr::bool_(true)))], false),
            false,
        );
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let out = t
            .transform_body(vec![Stmt::for_(
                Expr::name("x"),
                Expr::call_named("refine", vec![Expr::int(5), Expr::name("is_positive")]),
                vec![Stmt::ret(Some(Expr::name("x")))],
            )])
            .unwrap();
        let StmtKind::With { body, .. } = &out[0].kind else {
            panic!("expected label scope");
        };
        assert!(matches!(body[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn constant_for_unrolls_through_transform() {
        let registry = Registry::new();
        let mut kernel = InlineKernel::new();
        let mut t = Transformer::new(&registry, &mut kernel);
        let out = t
            .transform_body(vec![Stmt::for_(
                Expr::name("i"),
                Expr::call_named("range", vec![Expr::int(2)]),
                vec![Stmt::expr(Expr::call_named("use", vec![Expr::name("i")]))],
            )])
            .unwrap();
        assert!(out.iter().all(|s| !matches!(s.kind, StmtKind::For { .. })));
    }
}
