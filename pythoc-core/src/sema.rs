//! Semantic checking: declaration registration, expression typing, effect
//! resolution and read recording, cast rules, and the hand-off into the
//! exhaustiveness and linear analyses.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use pythoc_ast::{
    ClassDef, Decorator, Expr, ExprKind, FuncDef, Pattern, Span, Stmt, StmtKind, TypeExpr,
    TypeExprKind, Unit,
};
use tracing::debug;

use crate::cfg;
use crate::effects::{ConstValue, EffectEnv, EffectImpl, OverrideFrame};
use crate::error::{CoreError, ErrorKind};
use crate::exhaustive;
use crate::inline::{body_contains_yield, InlineKernel};
use crate::linear;
use crate::refine::{self, PredicateSig};
use crate::registry::{Entity, FuncInfo, Intrinsic, Registry, SymbolKey, VarInfo};
use crate::transform::Transformer;
use crate::types::{EnumVariant, Field, TypeArena, TypeId, TypeKind};

/// A function that passed every check, ready for lowering.
#[derive(Debug)]
pub struct CheckedFunction {
    pub key: SymbolKey,
    pub def: FuncDef,
    pub params: Vec<(String, TypeId)>,
    pub ret: TypeId,
    pub var_types: HashMap<String, TypeId>,
    pub effect_reads: BTreeSet<String>,
    pub callees: BTreeSet<String>,
}

pub struct Checker<'a> {
    pub arena: &'a mut TypeArena,
    pub registry: &'a mut Registry,
    pub effects: &'a mut EffectEnv,
    pub kernel: &'a mut InlineKernel,
}

impl<'a> Checker<'a> {
    pub fn new(
        arena: &'a mut TypeArena,
        registry: &'a mut Registry,
        effects: &'a mut EffectEnv,
        kernel: &'a mut InlineKernel,
    ) -> Self {
        Self {
            arena,
            registry,
            effects,
            kernel,
        }
    }

    /// Register every declaration of a unit; returns the symbol keys of the
    /// functions that want compilation.
    pub fn register_unit(&mut self, unit: &Unit) -> Result<Vec<SymbolKey>, CoreError> {
        for class in &unit.classes {
            self.register_class(class)?;
        }
        for stmt in &unit.top_stmts {
            self.register_top_stmt(stmt)?;
        }
        let mut wanted = Vec::new();
        for func in &unit.funcs {
            if let Some(key) = self.register_func(func)? {
                wanted.push(key);
            }
        }
        Ok(wanted)
    }

    fn register_class(&mut self, class: &ClassDef) -> Result<(), CoreError> {
        let name = class.name.node.clone();
        let enum_dec = class.decorators.iter().find_map(|d| match d {
            Decorator::Enum { tag_type } => Some(tag_type.clone()),
            _ => None,
        });
        // Reserve the nominal slot first so fields can point back at it.
        self.arena.reserve(&name);
        if let Some(tag_type) = enum_dec {
            let tag = match tag_type {
                Some(te) => self.resolve_type(&te)?,
                None => self.arena.i32_(),
            };
            let mut variants = Vec::new();
            for (i, field) in class.fields.iter().enumerate() {
                let vname = field
                    .name
                    .as_ref()
                    .map(|n| n.node.clone())
                    .ok_or_else(|| {
                        CoreError::new(
                            ErrorKind::TypeShapeInvalid,
                            format!("enum '{name}' variants must be named"),
                        )
                        .with_span(field.span)
                    })?;
                let payload = match &field.annotation {
                    None => None,
                    Some(te) if matches!(&te.kind, TypeExprKind::Name(n) if n == "None") => None,
                    Some(te) => Some(self.resolve_type(te)?),
                };
                variants.push(EnumVariant {
                    name: vname,
                    tag: field.tag_value.unwrap_or(i as i64),
                    payload,
                });
            }
            let id = self.arena.enum_type(&name, tag, variants)?;
            self.registry.declare_global(&name, Entity::Type(id));
        } else {
            let mut fields = Vec::new();
            for field in &class.fields {
                let ty = match &field.annotation {
                    Some(te) => self.resolve_type(te)?,
                    None => {
                        return Err(CoreError::new(
                            ErrorKind::TypeShapeInvalid,
                            format!("struct '{name}' fields need type annotations"),
                        )
                        .with_span(field.span))
                    }
                };
                fields.push(Field {
                    name: field.name.as_ref().map(|n| n.node.clone()),
                    ty,
                });
            }
            let id = self.arena.struct_type(Some(&name), fields)?;
            self.registry.declare_global(&name, Entity::Type(id));
        }
        Ok(())
    }

    fn register_top_stmt(&mut self, stmt: &Stmt) -> Result<(), CoreError> {
        match &stmt.kind {
            // effect.default(name=impl, ...)
            StmtKind::Expr(e) => {
                if let ExprKind::Call { callee, kwargs, .. } = &e.kind {
                    if let ExprKind::Attribute { base, attr } = &callee.kind {
                        if base.as_name() == Some("effect") && attr.node == "default" {
                            for (name, value) in kwargs {
                                let imp = self.effect_impl_of(value)?;
                                self.effects.set_default(&name.node, imp);
                            }
                        }
                    }
                }
                Ok(())
            }
            // effect.name = impl
            StmtKind::Assign { target, value } => {
                if let ExprKind::Attribute { base, attr } = &target.kind {
                    if base.as_name() == Some("effect") {
                        let imp = self.effect_impl_of(value)?;
                        return self
                            .effects
                            .pin(&attr.node, imp)
                            .map_err(|e| e.with_span(stmt.span));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn effect_impl_of(&mut self, value: &Expr) -> Result<EffectImpl, CoreError> {
        if let Some(name) = value.as_name() {
            return Ok(EffectImpl::Func(name.to_string()));
        }
        match self.fold_const(value) {
            Some(c) => Ok(EffectImpl::Value(c)),
            None => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "effect implementations must be function references or literal values",
            )
            .with_span(value.span)),
        }
    }

    fn register_func(&mut self, func: &FuncDef) -> Result<Option<SymbolKey>, CoreError> {
        let name = func.name.node.clone();
        let mut compile_suffix: Option<String> = None;
        let mut wants_compile = false;
        let mut is_inline = false;
        let mut extern_lib: Option<Option<String>> = None;
        for dec in &func.decorators {
            match dec {
                Decorator::Compile { suffix } => {
                    wants_compile = true;
                    compile_suffix = suffix.clone();
                }
                Decorator::Inline => is_inline = true,
                Decorator::Extern { lib } => extern_lib = Some(lib.clone()),
                Decorator::Enum { .. } => {
                    return Err(CoreError::new(
                        ErrorKind::TypeShapeInvalid,
                        format!("'{name}': enum decorator applies to classes"),
                    )
                    .with_span(func.span))
                }
            }
        }

        let mut params = Vec::new();
        for p in &func.params {
            let ty = match &p.annotation {
                Some(te) => self.resolve_type(te)?,
                None => {
                    return Err(CoreError::new(
                        ErrorKind::TypeShapeInvalid,
                        format!("'{name}': parameter '{}' needs a type", p.name.node),
                    )
                    .with_span(p.span))
                }
            };
            params.push(ty);
        }
        let ret = match &func.ret {
            Some(te) => self.resolve_type(te)?,
            None => self.arena.void(),
        };
        let sig = self.arena.func_type(params, ret, false);

        if let Some(lib) = &extern_lib {
            // Redeclaration of an extern must agree with the first one.
            if let Some(existing) = self.registry.base_function(&name) {
                if self.arena.kind(existing.sig) != self.arena.kind(sig) {
                    return Err(CoreError::new(
                        ErrorKind::ExternSignatureMismatch,
                        format!("extern '{name}' redeclared with a different signature"),
                    )
                    .with_span(func.span));
                }
                return Ok(None);
            }
            self.registry.insert_function(FuncInfo {
                key: SymbolKey::base(&name),
                sig,
                def: None,
                is_inline: false,
                is_generator: false,
                extern_lib: Some(lib.clone().unwrap_or_default()),
                effect_reads: BTreeSet::new(),
                transitive_reads: BTreeSet::new(),
                callees: BTreeSet::new(),
            });
            return Ok(None);
        }

        let is_generator = body_contains_yield(&func.body);
        let effect_suffix = self.effects.current_suffix();
        let key = SymbolKey::with_suffixes(
            &name,
            compile_suffix.as_deref().unwrap_or(""),
            &effect_suffix,
        );
        let info = FuncInfo {
            key: key.clone(),
            sig,
            def: Some(Arc::new(func.clone())),
            is_inline,
            is_generator,
            extern_lib: None,
            effect_reads: BTreeSet::new(),
            transitive_reads: BTreeSet::new(),
            callees: BTreeSet::new(),
        };
        // Keep a base entry for name resolution even when only a suffixed
        // variant was requested.
        if !self.registry.has_function(&SymbolKey::base(&name)) {
            let mut base = info.clone();
            base.key = SymbolKey::base(&name);
            self.registry.insert_function(base);
        }
        if !key.compile_suffix.is_empty() || !key.effect_suffix.is_empty() {
            self.registry.insert_function(info);
        }

        // Inline-only and generator functions are expanded at call sites,
        // never emitted as symbols.
        let compiled = wants_compile && !is_inline && !is_generator;
        Ok(compiled.then_some(key))
    }

    /// Run AST transforms and every check on one function.
    pub fn check_function(&mut self, key: &SymbolKey) -> Result<CheckedFunction, CoreError> {
        let info = self.registry.function(key).ok_or_else(|| {
            CoreError::new(
                ErrorKind::TypeMismatch,
                format!("unknown function '{}'", key.name),
            )
        })?;
        let def = info
            .def
            .clone()
            .ok_or_else(|| {
                CoreError::new(
                    ErrorKind::TypeMismatch,
                    format!("extern '{}' has no body to compile", key.name),
                )
            })?;
        let sig = info.sig;
        debug!(function = %key.name, suffix = %key.effect_suffix, "checking");

        let mut body = {
            let mut t = Transformer::new(self.registry, self.kernel);
            t.transform_body(def.body.clone())?
        };

        // The IR contract forbids unresolved effect paths: rewrite every
        // `effect.*` reference to its concrete symbol or literal under the
        // scoped override frames it sits in.
        let mut effect_reads = BTreeSet::new();
        self.resolve_effects(&mut body, &mut effect_reads)?;

        let TypeKind::Func { params: param_tys, result, .. } = self.arena.kind(sig) else {
            unreachable!("function signatures are Func types");
        };
        let (param_tys, ret) = (param_tys.clone(), *result);
        let params: Vec<(String, TypeId)> = def
            .params
            .iter()
            .map(|p| p.name.node.clone())
            .zip(param_tys)
            .collect();

        let mut fx = FnCx {
            ret,
            var_types: params.iter().cloned().collect(),
            effect_reads,
            callees: BTreeSet::new(),
        };
        self.check_body(&body, &mut fx)?;

        // Control-flow and ownership run on the transformed body.
        let cfg = cfg::build_cfg(&body)?;
        let fn_linear_returns = self.linear_return_map();
        linear::check_linear(self.arena, &cfg, &params, &fn_linear_returns)?;

        Ok(CheckedFunction {
            key: key.clone(),
            def: FuncDef {
                body,
                ..(*def).clone()
            },
            params,
            ret,
            var_types: fx.var_types,
            effect_reads: fx.effect_reads,
            callees: fx.callees,
        })
    }

    fn linear_return_map(&self) -> HashMap<String, TypeId> {
        let mut out = HashMap::new();
        for (key, info) in self.registry.functions() {
            if !key.compile_suffix.is_empty() || !key.effect_suffix.is_empty() {
                continue;
            }
            if let TypeKind::Func { result, .. } = self.arena.kind(info.sig) {
                if self.arena.contains_linear(*result) {
                    out.insert(key.name.clone(), *result);
                }
            }
        }
        out
    }

    fn check_body(&mut self, body: &[Stmt], fx: &mut FnCx) -> Result<(), CoreError> {
        for stmt in body {
            self.check_stmt(stmt, fx)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt, fx: &mut FnCx) -> Result<(), CoreError> {
        match &stmt.kind {
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => Ok(()),
            StmtKind::Expr(e) => {
                self.infer(e, fx)?;
                Ok(())
            }
            StmtKind::AnnAssign { target, annotation, value } => {
                let declared = self.resolve_type(annotation)?;
                if let Some(name) = target.as_name() {
                    fx.var_types.insert(name.to_string(), declared);
                }
                if let Some(v) = value {
                    let got = self.infer_expected(v, declared, fx)?;
                    self.expect_convertible(got, declared, v, stmt.span)?;
                }
                Ok(())
            }
            StmtKind::Assign { target, value } => {
                let existing = target
                    .as_name()
                    .and_then(|n| fx.var_types.get(n).copied());
                let got = match existing {
                    Some(expected) => {
                        let got = self.infer_expected(value, expected, fx)?;
                        self.expect_convertible(got, expected, value, stmt.span)?;
                        got
                    }
                    None => self.infer(value, fx)?,
                };
                match &target.kind {
                    ExprKind::Name(n) => {
                        fx.var_types.entry(n.clone()).or_insert(got);
                        Ok(())
                    }
                    ExprKind::Tuple(elems) => {
                        // Elementwise when the value side is also a tuple.
                        if let ExprKind::Tuple(values) = &value.kind {
                            if values.len() != elems.len() {
                                return Err(CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    "tuple assignment arity mismatch",
                                )
                                .with_span(stmt.span));
                            }
                            for (t, v) in elems.iter().zip(values) {
                                if let Some(n) = t.as_name() {
                                    let vt = self.infer(v, fx)?;
                                    fx.var_types.entry(n.to_string()).or_insert(vt);
                                }
                            }
                        }
                        Ok(())
                    }
                    _ => {
                        let target_ty = self.infer(target, fx)?;
                        self.expect_convertible(got, target_ty, value, stmt.span)
                    }
                }
            }
            StmtKind::Return(value) => {
                match value {
                    Some(v) => {
                        let got = self.infer_expected(v, fx.ret, fx)?;
                        self.expect_convertible(got, fx.ret, v, stmt.span)
                    }
                    None => {
                        if self.arena.is_void(fx.ret) {
                            Ok(())
                        } else {
                            Err(CoreError::new(
                                ErrorKind::TypeMismatch,
                                "non-void function returns without a value",
                            )
                            .with_span(stmt.span))
                        }
                    }
                }
            }
            StmtKind::Yield(_) => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "yield outside a generator consumed by a for loop",
            )
            .with_span(stmt.span)),
            StmtKind::If { cond, then_body, else_body } => {
                let t = self.infer(cond, fx)?;
                self.expect_bool(t, cond.span)?;
                self.check_body(then_body, fx)?;
                self.check_body(else_body, fx)
            }
            StmtKind::While { cond, body, else_body } => {
                let t = self.infer(cond, fx)?;
                self.expect_bool(t, cond.span)?;
                self.check_body(body, fx)?;
                self.check_body(else_body, fx)
            }
            StmtKind::For { target, iter, body, else_body } => {
                // Runtime range: the loop variable is the bound's type.
                if let Some(("range", range_args)) = iter.as_direct_call() {
                    let mut bound_ty = self.arena.i64_();
                    for a in range_args {
                        let t = self.infer(a, fx)?;
                        if !self.arena.is_integral(t) {
                            return Err(CoreError::new(
                                ErrorKind::TypeMismatch,
                                "range() bounds must be integers",
                            )
                            .with_span(a.span));
                        }
                        if a.as_int_lit().is_none() {
                            bound_ty = t;
                        }
                    }
                    if let Some(n) = target.as_name() {
                        fx.var_types.insert(n.to_string(), bound_ty);
                    }
                    self.check_body(body, fx)?;
                    return self.check_body(else_body, fx);
                }
                let iter_ty = self.infer(iter, fx)?;
                let elem = match self.arena.kind(self.arena.runtime_repr(iter_ty)) {
                    TypeKind::Array { elem, dims } => {
                        if dims.len() > 1 {
                            let dims = dims[1..].to_vec();
                            let elem = *elem;
                            self.arena.array(elem, dims)?
                        } else {
                            *elem
                        }
                    }
                    _ => {
                        return Err(CoreError::new(
                            ErrorKind::TypeMismatch,
                            format!(
                                "cannot iterate over {}",
                                self.arena.display(iter_ty)
                            ),
                        )
                        .with_span(iter.span))
                    }
                };
                if let Some(n) = target.as_name() {
                    fx.var_types.insert(n.to_string(), elem);
                }
                self.check_body(body, fx)?;
                self.check_body(else_body, fx)
            }
            StmtKind::Match { subject, arms } => {
                let subject_ty = self.infer(subject, fx)?;
                exhaustive::check_match(self.arena, subject_ty, arms, stmt.span)?;
                for arm in arms {
                    self.bind_pattern(&arm.pattern, subject_ty, fx)?;
                    if let Some(g) = &arm.guard {
                        let t = self.infer(g, fx)?;
                        self.expect_bool(t, g.span)?;
                    }
                    self.check_body(&arm.body, fx)?;
                }
                Ok(())
            }
            StmtKind::With { item, body, .. } => {
                if let Some((name, _)) = item.as_direct_call() {
                    if name == "effect" {
                        let frame = self.override_frame_of(item)?;
                        self.effects.push_override(frame);
                        let result = self.check_body(body, fx);
                        self.effects.pop_override()?;
                        return result;
                    }
                }
                self.check_body(body, fx)
            }
        }
    }

    /// Rewrite `effect.N` value reads to literals, `effect.N(...)` and
    /// `effect.N.m(...)` calls to concrete function names, honoring the
    /// scoped override frames entered along the way.
    fn resolve_effects(
        &mut self,
        body: &mut [Stmt],
        reads: &mut BTreeSet<String>,
    ) -> Result<(), CoreError> {
        for stmt in body {
            match &mut stmt.kind {
                StmtKind::Expr(e) => self.resolve_effects_expr(e, reads)?,
                StmtKind::Assign { target, value } => {
                    self.resolve_effects_expr(target, reads)?;
                    self.resolve_effects_expr(value, reads)?;
                }
                StmtKind::AnnAssign { value, .. } => {
                    if let Some(v) = value {
                        self.resolve_effects_expr(v, reads)?;
                    }
                }
                StmtKind::Return(v) | StmtKind::Yield(v) => {
                    if let Some(v) = v {
                        self.resolve_effects_expr(v, reads)?;
                    }
                }
                StmtKind::If { cond, then_body, else_body } => {
                    self.resolve_effects_expr(cond, reads)?;
                    self.resolve_effects(then_body, reads)?;
                    self.resolve_effects(else_body, reads)?;
                }
                StmtKind::While { cond, body, else_body } => {
                    self.resolve_effects_expr(cond, reads)?;
                    self.resolve_effects(body, reads)?;
                    self.resolve_effects(else_body, reads)?;
                }
                StmtKind::For { target, iter, body, else_body } => {
                    self.resolve_effects_expr(target, reads)?;
                    self.resolve_effects_expr(iter, reads)?;
                    self.resolve_effects(body, reads)?;
                    self.resolve_effects(else_body, reads)?;
                }
                StmtKind::Match { subject, arms } => {
                    self.resolve_effects_expr(subject, reads)?;
                    for arm in arms {
                        if let Some(g) = &mut arm.guard {
                            self.resolve_effects_expr(g, reads)?;
                        }
                        self.resolve_effects(&mut arm.body, reads)?;
                    }
                }
                StmtKind::With { item, body, .. } => {
                    let is_effect_scope =
                        matches!(item.as_direct_call(), Some(("effect", _)));
                    self.resolve_effects_expr(item, reads)?;
                    if is_effect_scope {
                        let frame = self.override_frame_of(item)?;
                        self.effects.push_override(frame);
                        let result = self.resolve_effects(body, reads);
                        self.effects.pop_override()?;
                        result?;
                    } else {
                        self.resolve_effects(body, reads)?;
                    }
                }
                StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
            }
        }
        Ok(())
    }

    fn resolve_effects_expr(
        &mut self,
        e: &mut Expr,
        reads: &mut BTreeSet<String>,
    ) -> Result<(), CoreError> {
        // Rewrite this node if it is an effect reference.
        let replacement: Option<Expr> = match &e.kind {
            // effect.N(...) / effect.N.m(...): handled via the callee below.
            ExprKind::Attribute { base, attr } if base.as_name() == Some("effect") => {
                if attr.node == "default" {
                    None
                } else {
                    reads.insert(attr.node.clone());
                    let imp = self
                        .effects
                        .resolve(&attr.node)
                        .map_err(|err| err.with_span(e.span))?
                        .clone();
                    Some(match imp {
                        EffectImpl::Func(f) => Expr::name(&f),
                        EffectImpl::Value(ConstValue::Int(v)) => Expr::int(v),
                        EffectImpl::Value(ConstValue::Float(v)) => Expr::float(v),
                        EffectImpl::Value(ConstValue::Bool(b)) => Expr::bool_(b),
                        EffectImpl::Value(ConstValue::Str(s)) => Expr::str_(&s),
                    })
                }
            }
            ExprKind::Attribute { base, attr } => match &base.kind {
                ExprKind::Attribute { base: inner, attr: effect_name }
                    if inner.as_name() == Some("effect") =>
                {
                    reads.insert(effect_name.node.clone());
                    let imp = self
                        .effects
                        .resolve(&effect_name.node)
                        .map_err(|err| err.with_span(e.span))?
                        .clone();
                    match imp {
                        EffectImpl::Func(f) => Some(Expr::name(&format!("{f}_{}", attr.node))),
                        EffectImpl::Value(_) => {
                            return Err(CoreError::new(
                                ErrorKind::TypeMismatch,
                                format!("value effect '{}' has no methods", effect_name.node),
                            )
                            .with_span(e.span))
                        }
                    }
                }
                _ => None,
            },
            _ => None,
        };
        if let Some(new) = replacement {
            *e = new;
            return Ok(());
        }
        match &mut e.kind {
            ExprKind::Tuple(elems) => {
                for el in elems {
                    self.resolve_effects_expr(el, reads)?;
                }
            }
            ExprKind::Attribute { base, .. } => self.resolve_effects_expr(base, reads)?,
            ExprKind::Subscript { base, indices } => {
                self.resolve_effects_expr(base, reads)?;
                for i in indices {
                    self.resolve_effects_expr(i, reads)?;
                }
            }
            ExprKind::Call { callee, args, kwargs } => {
                // Keep `effect.default(...)` and `effect(...)` intact.
                let keep = matches!(&callee.kind,
                    ExprKind::Attribute { base, attr }
                        if base.as_name() == Some("effect") && attr.node == "default")
                    || callee.as_name() == Some("effect");
                if !keep {
                    self.resolve_effects_expr(callee, reads)?;
                }
                for a in args {
                    self.resolve_effects_expr(a, reads)?;
                }
                for (_, v) in kwargs {
                    self.resolve_effects_expr(v, reads)?;
                }
            }
            ExprKind::Unary { operand, .. } => self.resolve_effects_expr(operand, reads)?,
            ExprKind::Binary { left, right, .. } | ExprKind::Compare { left, right, .. } => {
                self.resolve_effects_expr(left, reads)?;
                self.resolve_effects_expr(right, reads)?;
            }
            ExprKind::Lambda { body, .. } => self.resolve_effects_expr(body, reads)?,
            _ => {}
        }
        Ok(())
    }

    fn override_frame_of(&mut self, item: &Expr) -> Result<OverrideFrame, CoreError> {
        let ExprKind::Call { kwargs, .. } = &item.kind else {
            return Err(CoreError::new(
                ErrorKind::EffectSuffixRequired,
                "effect() requires keyword bindings",
            )
            .with_span(item.span));
        };
        let mut suffix = None;
        let mut bindings = HashMap::new();
        for (name, value) in kwargs {
            if name.node == "suffix" {
                suffix = Some(value.as_str_lit().map(str::to_string).ok_or_else(|| {
                    CoreError::new(
                        ErrorKind::EffectSuffixRequired,
                        "effect suffix must be a string literal",
                    )
                    .with_span(value.span)
                })?);
            } else {
                bindings.insert(name.node.clone(), self.effect_impl_of(value)?);
            }
        }
        OverrideFrame::new(suffix, bindings).map_err(|e| e.with_span(item.span))
    }

    fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        subject_ty: TypeId,
        fx: &mut FnCx,
    ) -> Result<(), CoreError> {
        match pattern {
            Pattern::Binding { name, .. } => {
                fx.var_types.insert(name.node.clone(), subject_ty);
                Ok(())
            }
            Pattern::Or { alts, .. } => {
                for p in alts {
                    self.bind_pattern(p, subject_ty, fx)?;
                }
                Ok(())
            }
            Pattern::Sequence { elems, .. } => {
                let repr = self.arena.runtime_repr(subject_ty);
                match self.arena.kind(repr).clone() {
                    TypeKind::Enum { variants, .. } => {
                        if let (Some(Pattern::Value { expr, .. }), Some(payload_pat)) =
                            (elems.first(), elems.get(1))
                        {
                            // Bind the payload by the named variant's type.
                            if let ExprKind::Attribute { attr, .. } = &expr.kind {
                                if let Some(v) =
                                    variants.iter().find(|v| v.name == attr.node)
                                {
                                    if let Some(pt) = v.payload {
                                        self.bind_pattern(payload_pat, pt, fx)?;
                                    }
                                }
                            }
                        }
                        Ok(())
                    }
                    TypeKind::Struct { fields, .. } => {
                        for (p, f) in elems.iter().zip(fields) {
                            self.bind_pattern(p, f.ty, fx)?;
                        }
                        Ok(())
                    }
                    TypeKind::Array { elem, .. } => {
                        for p in elems {
                            self.bind_pattern(p, elem, fx)?;
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            Pattern::Struct { fields, .. } => {
                let repr = self.arena.runtime_repr(subject_ty);
                if let TypeKind::Struct { fields: def_fields, .. } = self.arena.kind(repr).clone()
                {
                    for (i, (fname, p)) in fields.iter().enumerate() {
                        let ty = match fname {
                            Some(n) => def_fields
                                .iter()
                                .find(|f| f.name.as_deref() == Some(n.node.as_str()))
                                .map(|f| f.ty),
                            None => def_fields.get(i).map(|f| f.ty),
                        };
                        if let Some(ty) = ty {
                            self.bind_pattern(p, ty, fx)?;
                        }
                    }
                }
                Ok(())
            }
            Pattern::Wildcard { .. } | Pattern::Value { .. } => Ok(()),
        }
    }

    /// Infer with a type expected from context, so integer literals adapt.
    fn infer_expected(
        &mut self,
        e: &Expr,
        expected: TypeId,
        fx: &mut FnCx,
    ) -> Result<TypeId, CoreError> {
        if e.as_int_lit().is_some() && self.arena.is_integral(expected) {
            return Ok(expected);
        }
        self.infer(e, fx)
    }

    pub fn infer(&mut self, e: &Expr, fx: &mut FnCx) -> Result<TypeId, CoreError> {
        match &e.kind {
            ExprKind::Int(_) => Ok(self.arena.i32_()),
            ExprKind::Float(_) => Ok(self.arena.f64_()),
            ExprKind::Bool(_) => Ok(self.arena.bool_()),
            ExprKind::Str(_) => {
                let i8_ = self.arena.primitive("i8").expect("i8 is interned");
                Ok(self.arena.ptr(i8_))
            }
            ExprKind::NoneLit => Ok(self.arena.void()),
            ExprKind::Name(n) => {
                if let Some(ty) = fx.var_types.get(n) {
                    return Ok(*ty);
                }
                match self.registry.lookup(n) {
                    Some(Entity::Var(VarInfo { ty, .. })) => Ok(ty),
                    Some(Entity::Func(key)) => {
                        let info = self.registry.function(&key).expect("registered");
                        Ok(info.sig)
                    }
                    Some(Entity::EffectValue(c)) => Ok(self.const_type(&c)),
                    _ => Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!("unknown name '{n}'"),
                    )
                    .with_span(e.span)),
                }
            }
            ExprKind::Tuple(elems) => {
                let mut fields = Vec::new();
                for el in elems {
                    fields.push(Field::anon(self.infer(el, fx)?));
                }
                self.arena.struct_type(None, fields)
            }
            ExprKind::Attribute { base, attr } => self.infer_attribute(e, base, attr, fx),
            ExprKind::Subscript { base, indices } => {
                let base_ty = self.infer(base, fx)?;
                let repr = self.arena.runtime_repr(base_ty);
                match self.arena.kind(repr).clone() {
                    TypeKind::Array { elem, dims } => {
                        if indices.len() > dims.len() {
                            return Err(CoreError::new(
                                ErrorKind::TypeMismatch,
                                "too many indices for array",
                            )
                            .with_span(e.span));
                        }
                        for i in indices {
                            let it = self.infer(i, fx)?;
                            if !self.arena.is_integral(it) {
                                return Err(CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    "array indices must be integers",
                                )
                                .with_span(i.span));
                            }
                        }
                        if indices.len() == dims.len() {
                            Ok(elem)
                        } else {
                            let rest = dims[indices.len()..].to_vec();
                            self.arena.array(elem, rest)
                        }
                    }
                    TypeKind::Ptr(p) => Ok(p),
                    TypeKind::Struct { fields, .. } => {
                        let idx = indices
                            .first()
                            .and_then(|i| i.as_int_lit())
                            .ok_or_else(|| {
                                CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    "struct indexing needs a constant index",
                                )
                                .with_span(e.span)
                            })?;
                        fields
                            .get(idx as usize)
                            .map(|f| f.ty)
                            .ok_or_else(|| {
                                CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    format!("field index {idx} out of range"),
                                )
                                .with_span(e.span)
                            })
                    }
                    _ => Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!("cannot index {}", self.arena.display(base_ty)),
                    )
                    .with_span(e.span)),
                }
            }
            ExprKind::Call { .. } => self.infer_call(e, fx),
            ExprKind::Unary { op, operand } => {
                let t = self.infer(operand, fx)?;
                match op {
                    pythoc_ast::UnaryOp::Not => {
                        self.expect_bool(t, operand.span)?;
                        Ok(self.arena.bool_())
                    }
                    _ => Ok(t),
                }
            }
            ExprKind::Binary { left, op, right } => {
                use pythoc_ast::BinOp;
                if matches!(op, BinOp::And | BinOp::Or) {
                    let lt = self.infer(left, fx)?;
                    let rt = self.infer(right, fx)?;
                    self.expect_bool(lt, left.span)?;
                    self.expect_bool(rt, right.span)?;
                    return Ok(self.arena.bool_());
                }
                let lt = self.infer(left, fx)?;
                let rt = self.infer_expected(right, lt, fx)?;
                let lt = if left.as_int_lit().is_some() && self.arena.is_integral(rt) {
                    rt
                } else {
                    lt
                };
                if self.arena.runtime_repr(lt) != self.arena.runtime_repr(rt) {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "operands of {} and {} do not agree",
                            self.arena.display(lt),
                            self.arena.display(rt)
                        ),
                    )
                    .with_span(e.span));
                }
                Ok(self.arena.runtime_repr(lt))
            }
            ExprKind::Compare { left, right, .. } => {
                let lt = self.infer(left, fx)?;
                let rt = self.infer_expected(right, lt, fx)?;
                let lt = if left.as_int_lit().is_some() && self.arena.is_integral(rt) {
                    rt
                } else {
                    lt
                };
                if self.arena.runtime_repr(lt) != self.arena.runtime_repr(rt) {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "comparison operands do not agree",
                    )
                    .with_span(e.span));
                }
                Ok(self.arena.bool_())
            }
            ExprKind::Lambda { .. } => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "lambda escaped compile-time expansion",
            )
            .with_span(e.span)),
        }
    }

    fn infer_attribute(
        &mut self,
        e: &Expr,
        base: &Expr,
        attr: &pythoc_ast::Ident,
        fx: &mut FnCx,
    ) -> Result<TypeId, CoreError> {
        // effect.N.m: method access on a function-effect implementation
        // resolves to the `{impl}_{m}` symbol.
        if let ExprKind::Attribute { base: inner_base, attr: inner_attr } = &base.kind {
            if inner_base.as_name() == Some("effect") {
                fx.effect_reads.insert(inner_attr.node.clone());
                let imp = self
                    .effects
                    .resolve(&inner_attr.node)
                    .map_err(|err| err.with_span(e.span))?
                    .clone();
                return match imp {
                    EffectImpl::Func(fname) => {
                        let method_symbol = format!("{fname}_{}", attr.node);
                        match self.registry.base_function(&method_symbol) {
                            Some(info) => Ok(info.sig),
                            None => Err(CoreError::new(
                                ErrorKind::EffectUnbound,
                                format!(
                                    "effect '{}' implementation has no method '{}'",
                                    inner_attr.node, attr.node
                                ),
                            )
                            .with_span(e.span)),
                        }
                    }
                    EffectImpl::Value(_) => Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!("value effect '{}' has no methods", inner_attr.node),
                    )
                    .with_span(e.span)),
                };
            }
        }
        // effect.N reads resolve through the environment.
        if base.as_name() == Some("effect") {
            fx.effect_reads.insert(attr.node.clone());
            let imp = self
                .effects
                .resolve(&attr.node)
                .map_err(|err| err.with_span(e.span))?
                .clone();
            return match imp {
                EffectImpl::Value(c) => Ok(self.const_type(&c)),
                EffectImpl::Func(fname) => match self.registry.base_function(&fname) {
                    Some(info) => Ok(info.sig),
                    None => Err(CoreError::new(
                        ErrorKind::EffectUnbound,
                        format!(
                            "effect '{}' is bound to unknown function '{fname}'",
                            attr.node
                        ),
                    )
                    .with_span(e.span)),
                },
            };
        }
        // Enum variant reference: the value of the enum type.
        if let Some(name) = base.as_name() {
            if fx.var_types.get(name).is_none() {
                if let Some(ty) = self.registry.lookup_type(name) {
                    if let TypeKind::Enum { variants, .. } = self.arena.kind(ty) {
                        if variants.iter().any(|v| v.name == attr.node) {
                            return Ok(ty);
                        }
                        return Err(CoreError::new(
                            ErrorKind::TypeMismatch,
                            format!("enum '{name}' has no variant '{}'", attr.node),
                        )
                        .with_span(e.span));
                    }
                }
            }
        }
        let base_ty = self.infer(base, fx)?;
        let repr = self.arena.runtime_repr(base_ty);
        match self.arena.kind(repr) {
            TypeKind::Struct { fields, .. } | TypeKind::Union { fields, .. } => fields
                .iter()
                .find(|f| f.name.as_deref() == Some(attr.node.as_str()))
                .map(|f| f.ty)
                .ok_or_else(|| {
                    CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "{} has no field '{}'",
                            self.arena.display(base_ty),
                            attr.node
                        ),
                    )
                    .with_span(e.span)
                }),
            _ => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!(
                    "{} has no attributes",
                    self.arena.display(base_ty)
                ),
            )
            .with_span(e.span)),
        }
    }

    fn infer_call(&mut self, e: &Expr, fx: &mut FnCx) -> Result<TypeId, CoreError> {
        let ExprKind::Call { callee, args, kwargs } = &e.kind else {
            unreachable!()
        };

        // `array[i32, 5]()` and friends: subscripted type construction.
        if let ExprKind::Subscript { .. } = &callee.kind {
            let te = self.expr_as_type(callee)?;
            let ty = self.resolve_type(&te)?;
            for a in args {
                self.infer(a, fx)?;
            }
            return Ok(ty);
        }

        if let ExprKind::Attribute { base, attr } = &callee.kind {
            // effect.N(...): monomorphized call through the environment.
            if base.as_name() == Some("effect") {
                let sig = self.infer_attribute(callee, base, attr, fx)?;
                return self.check_call_against(sig, args, fx, e.span);
            }
            // Enum construction: Status.Ok(payload) / Status.Err().
            if let Some(name) = base.as_name() {
                if fx.var_types.get(name).is_none() {
                    if let Some(ty) = self.registry.lookup_type(name) {
                        if let TypeKind::Enum { variants, .. } = self.arena.kind(ty).clone() {
                            let Some(v) = variants.iter().find(|v| v.name == attr.node) else {
                                return Err(CoreError::new(
                                    ErrorKind::TypeMismatch,
                                    format!("enum '{name}' has no variant '{}'", attr.node),
                                )
                                .with_span(e.span));
                            };
                            match (v.payload, args.first()) {
                                (Some(pt), Some(arg)) => {
                                    let got = self.infer_expected(arg, pt, fx)?;
                                    self.expect_convertible(got, pt, arg, e.span)?;
                                }
                                (Some(_), None) => {
                                    return Err(CoreError::new(
                                        ErrorKind::TypeMismatch,
                                        format!("variant '{}' needs a payload", attr.node),
                                    )
                                    .with_span(e.span))
                                }
                                (None, Some(_)) => {
                                    return Err(CoreError::new(
                                        ErrorKind::TypeMismatch,
                                        format!("variant '{}' has no payload", attr.node),
                                    )
                                    .with_span(e.span))
                                }
                                (None, None) => {}
                            }
                            return Ok(ty);
                        }
                    }
                }
            }
        }

        let Some(name) = callee.as_name() else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                "callee is not a callable name",
            )
            .with_span(e.span));
        };
        let name = name.to_string();

        // Type calls are casts or constructions.
        if let Some(ty) = self
            .arena
            .primitive(&name)
            .or_else(|| self.registry.lookup_type(&name))
        {
            return self.check_type_call(ty, args, fx, e.span);
        }

        match self.registry.lookup(&name) {
            Some(Entity::Builtin(intrinsic)) => {
                self.infer_intrinsic(intrinsic, e, args, kwargs, fx)
            }
            Some(Entity::Func(key)) => {
                fx.callees.insert(name.clone());
                let sig = self.registry.function(&key).expect("registered").sig;
                self.check_call_against(sig, args, fx, e.span)
            }
            Some(Entity::Var(VarInfo { ty, .. })) => {
                // Function-pointer call through a variable.
                self.check_call_against(ty, args, fx, e.span)
            }
            _ => Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("unknown function '{name}'"),
            )
            .with_span(e.span)),
        }
    }

    fn check_call_against(
        &mut self,
        sig: TypeId,
        args: &[Expr],
        fx: &mut FnCx,
        span: Span,
    ) -> Result<TypeId, CoreError> {
        let TypeKind::Func { params, result, variadic } = self.arena.kind(sig).clone() else {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("{} is not callable", self.arena.display(sig)),
            )
            .with_span(span));
        };
        if args.len() < params.len() || (!variadic && args.len() > params.len()) {
            return Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("call expects {} arguments, got {}", params.len(), args.len()),
            )
            .with_span(span));
        }
        for (arg, expected) in args.iter().zip(params.iter()) {
            let got = self.infer_expected(arg, *expected, fx)?;
            self.expect_convertible(got, *expected, arg, arg.span)?;
        }
        for arg in args.iter().skip(params.len()) {
            self.infer(arg, fx)?;
        }
        Ok(result)
    }

    fn check_type_call(
        &mut self,
        ty: TypeId,
        args: &[Expr],
        fx: &mut FnCx,
        span: Span,
    ) -> Result<TypeId, CoreError> {
        match args {
            [] => Ok(ty), // zero-initialized construction
            [value] => {
                let from = self.infer_expected(value, ty, fx)?;
                if from == ty {
                    return Ok(ty);
                }
                let from_repr = self.arena.runtime_repr(from);
                let to_repr = self.arena.runtime_repr(ty);
                let castable = match (self.arena.kind(from_repr), self.arena.kind(to_repr)) {
                    (TypeKind::Int { .. }, TypeKind::Int { .. })
                    | (TypeKind::Int { .. }, TypeKind::Float(_))
                    | (TypeKind::Float(_), TypeKind::Int { .. })
                    | (TypeKind::Float(_), TypeKind::Float(_))
                    | (TypeKind::Int { .. }, TypeKind::Bool)
                    | (TypeKind::Bool, TypeKind::Int { .. })
                    | (TypeKind::Ptr(_), TypeKind::Ptr(_))
                    | (TypeKind::Ptr(_), TypeKind::Int { .. })
                    | (TypeKind::Int { .. }, TypeKind::Ptr(_)) => true,
                    _ => false,
                };
                // Explicit casts may forget refinements but never invent
                // them.
                if matches!(self.arena.kind(ty), TypeKind::Refined { .. }) {
                    refine::check_conversion(self.arena, from, ty)
                        .map_err(|e| e.with_span(span))?;
                    return Ok(ty);
                }
                if castable {
                    Ok(ty)
                } else {
                    Err(CoreError::new(
                        ErrorKind::InvalidCast,
                        format!(
                            "cannot cast {} to {}",
                            self.arena.display(from),
                            self.arena.display(ty)
                        ),
                    )
                    .with_span(span))
                }
            }
            _ => {
                // Struct construction from field values.
                let TypeKind::Struct { fields, .. } = self.arena.kind(self.arena.runtime_repr(ty)).clone()
                else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!("{} takes at most one value", self.arena.display(ty)),
                    )
                    .with_span(span));
                };
                if fields.len() != args.len() {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "{} has {} fields, got {} values",
                            self.arena.display(ty),
                            fields.len(),
                            args.len()
                        ),
                    )
                    .with_span(span));
                }
                for (arg, field) in args.iter().zip(fields.iter()) {
                    let got = self.infer_expected(arg, field.ty, fx)?;
                    self.expect_convertible(got, field.ty, arg, arg.span)?;
                }
                Ok(ty)
            }
        }
    }

    fn infer_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        e: &Expr,
        args: &[Expr],
        _kwargs: &[(pythoc_ast::Ident, Expr)],
        fx: &mut FnCx,
    ) -> Result<TypeId, CoreError> {
        match intrinsic {
            Intrinsic::Sizeof => Ok(self.arena.i64_()),
            Intrinsic::Linear => Ok(self.arena.linear()),
            Intrinsic::Consume => {
                for a in args {
                    self.infer(a, fx)?;
                }
                Ok(self.arena.void())
            }
            Intrinsic::Move => {
                let Some(arg) = args.first() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "move() requires an argument",
                    )
                    .with_span(e.span));
                };
                self.infer(arg, fx)
            }
            Intrinsic::Ptr => {
                let Some(arg) = args.first() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeMismatch,
                        "ptr() requires an argument",
                    )
                    .with_span(e.span));
                };
                let t = self.infer(arg, fx)?;
                Ok(self.arena.ptr(t))
            }
            Intrinsic::NullPtr => {
                let void = self.arena.void();
                Ok(self.arena.ptr(void))
            }
            Intrinsic::Assume => self.infer_assume(e, args, fx),
            Intrinsic::Refine => Err(CoreError::new(
                ErrorKind::RefineOutsideForLoop,
                "refine() is only valid as the iterable of a for loop",
            )
            .with_span(e.span)),
            Intrinsic::Defer => {
                // Arguments are captured now; the callee runs at scope exit.
                for a in args.iter().skip(1) {
                    self.infer(a, fx)?;
                }
                Ok(self.arena.void())
            }
            Intrinsic::Label | Intrinsic::Goto | Intrinsic::GotoBegin | Intrinsic::GotoEnd => {
                Ok(self.arena.void())
            }
            Intrinsic::Cimport => Ok(self.arena.void()),
            Intrinsic::Range => {
                for a in args {
                    let t = self.infer(a, fx)?;
                    if !self.arena.is_integral(t) {
                        return Err(CoreError::new(
                            ErrorKind::TypeMismatch,
                            "range() bounds must be integers",
                        )
                        .with_span(a.span));
                    }
                }
                Err(CoreError::new(
                    ErrorKind::TypeMismatch,
                    "range() with runtime bounds is only valid in a for loop",
                )
                .with_span(e.span))
            }
        }
    }

    /// `assume(values..., preds..., "tags"...)`: unchecked refined
    /// construction.
    fn infer_assume(
        &mut self,
        e: &Expr,
        args: &[Expr],
        fx: &mut FnCx,
    ) -> Result<TypeId, CoreError> {
        let mut values = Vec::new();
        let mut preds = Vec::new();
        let mut tags = Vec::new();
        for arg in args {
            if let Some(s) = arg.as_str_lit() {
                tags.push(s.to_string());
                continue;
            }
            if let Some(name) = arg.as_name() {
                if fx.var_types.get(name).is_none() {
                    if let Some(Entity::Func(key)) = self.registry.lookup(name) {
                        let info = self.registry.function(&key).expect("registered");
                        let TypeKind::Func { params, .. } = self.arena.kind(info.sig) else {
                            unreachable!()
                        };
                        preds.push(PredicateSig {
                            name: name.to_string(),
                            params: params
                                .iter()
                                .enumerate()
                                .map(|(i, t)| (format!("field_{i}"), *t))
                                .collect(),
                        });
                        continue;
                    }
                }
            }
            values.push(arg.clone());
        }
        if values.is_empty() {
            return Err(CoreError::new(
                ErrorKind::TypeShapeInvalid,
                "assume() requires at least one value",
            )
            .with_span(e.span));
        }
        let base = if values.len() == 1 {
            self.infer(&values[0], fx)?
        } else {
            let mut fields = Vec::new();
            for v in &values {
                fields.push(Field::anon(self.infer(v, fx)?));
            }
            self.arena.struct_type(None, fields)?
        };
        refine::refined_type(self.arena, Some(base), &preds, &tags)
            .map_err(|err| err.with_span(e.span))
    }

    fn const_type(&mut self, c: &ConstValue) -> TypeId {
        match c {
            ConstValue::Int(_) => self.arena.i32_(),
            ConstValue::Float(_) => self.arena.f64_(),
            ConstValue::Bool(_) => self.arena.bool_(),
            ConstValue::Str(_) => {
                let i8_ = self.arena.primitive("i8").expect("i8 is interned");
                self.arena.ptr(i8_)
            }
        }
    }

    /// Compile-time constant folding. Value effects fold here, so overrides
    /// flow into constants.
    pub fn fold_const(&mut self, e: &Expr) -> Option<ConstValue> {
        match &e.kind {
            ExprKind::Int(v) => Some(ConstValue::Int(*v)),
            ExprKind::Float(v) => Some(ConstValue::Float(*v)),
            ExprKind::Bool(b) => Some(ConstValue::Bool(*b)),
            ExprKind::Str(s) => Some(ConstValue::Str(s.clone())),
            ExprKind::Attribute { base, attr } if base.as_name() == Some("effect") => {
                match self.effects.resolve(&attr.node).ok()? {
                    EffectImpl::Value(c) => Some(c.clone()),
                    EffectImpl::Func(_) => None,
                }
            }
            ExprKind::Unary { op: pythoc_ast::UnaryOp::Neg, operand } => {
                match self.fold_const(operand)? {
                    ConstValue::Int(v) => Some(ConstValue::Int(-v)),
                    ConstValue::Float(v) => Some(ConstValue::Float(-v)),
                    _ => None,
                }
            }
            ExprKind::Binary { left, op, right } => {
                use pythoc_ast::BinOp;
                let l = self.fold_const(left)?;
                let r = self.fold_const(right)?;
                match (l, r) {
                    (ConstValue::Int(a), ConstValue::Int(b)) => {
                        let v = match op {
                            BinOp::Add => a.checked_add(b)?,
                            BinOp::Sub => a.checked_sub(b)?,
                            BinOp::Mul => a.checked_mul(b)?,
                            BinOp::Div => a.checked_div(b)?,
                            BinOp::Mod => a.checked_rem(b)?,
                            BinOp::BitAnd => a & b,
                            BinOp::BitOr => a | b,
                            BinOp::BitXor => a ^ b,
                            BinOp::Shl => a.checked_shl(u32::try_from(b).ok()?)?,
                            BinOp::Shr => a.checked_shr(u32::try_from(b).ok()?)?,
                            BinOp::And | BinOp::Or => return None,
                        };
                        Some(ConstValue::Int(v))
                    }
                    _ => None,
                }
            }
            ExprKind::Call { callee, args, .. } => {
                // sizeof folds to the layout size.
                if callee.as_name() == Some("sizeof") {
                    let te = self.expr_as_type(args.first()?).ok()?;
                    let ty = self.resolve_type(&te).ok()?;
                    return Some(ConstValue::Int(i128::from(self.arena.size_of(ty))));
                }
                None
            }
            _ => None,
        }
    }

    /// Interpret an expression in type position (`i32`, `ptr[u8]`,
    /// `array[i32, 5]`).
    pub fn expr_as_type(&mut self, e: &Expr) -> Result<TypeExpr, CoreError> {
        match &e.kind {
            ExprKind::Name(n) => Ok(TypeExpr::name(n)),
            ExprKind::Subscript { base, indices } => {
                let Some(base_name) = base.as_name() else {
                    return Err(CoreError::new(
                        ErrorKind::TypeShapeInvalid,
                        "type subscripts require a plain base name",
                    )
                    .with_span(e.span));
                };
                match base_name {
                    "ptr" => {
                        let inner = self.expr_as_type(indices.first().ok_or_else(|| {
                            CoreError::new(ErrorKind::TypeShapeInvalid, "ptr[] needs a pointee")
                                .with_span(e.span)
                        })?)?;
                        Ok(TypeExpr::ptr(inner))
                    }
                    "array" => {
                        let Some((elem, dims)) = indices.split_first() else {
                            return Err(CoreError::new(
                                ErrorKind::TypeShapeInvalid,
                                "array[] needs an element type and dimensions",
                            )
                            .with_span(e.span));
                        };
                        let elem = self.expr_as_type(elem)?;
                        let dims = dims
                            .iter()
                            .map(|d| {
                                d.as_int_lit().and_then(|v| u64::try_from(v).ok()).ok_or_else(
                                    || {
                                        CoreError::new(
                                            ErrorKind::TypeShapeInvalid,
                                            "array dimensions must be positive integers",
                                        )
                                        .with_span(d.span)
                                    },
                                )
                            })
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok(TypeExpr {
                            span: e.span,
                            kind: TypeExprKind::Array {
                                elem: Box::new(elem),
                                dims,
                            },
                        })
                    }
                    "refined" => {
                        let mut base_ty = None;
                        let mut preds = Vec::new();
                        let mut tags = Vec::new();
                        for (i, index) in indices.iter().enumerate() {
                            if let Some(s) = index.as_str_lit() {
                                tags.push(s.to_string());
                            } else if let Some(n) = index.as_name() {
                                if matches!(self.registry.lookup(n), Some(Entity::Func(_))) {
                                    preds.push(pythoc_ast::ident(n));
                                } else if i == 0 {
                                    base_ty = Some(Box::new(TypeExpr::name(n)));
                                } else {
                                    return Err(CoreError::new(
                                        ErrorKind::TypeShapeInvalid,
                                        format!("'{n}' is neither a type nor a predicate"),
                                    )
                                    .with_span(index.span));
                                }
                            } else if i == 0 {
                                base_ty = Some(Box::new(self.expr_as_type(index)?));
                            }
                        }
                        Ok(TypeExpr {
                            span: e.span,
                            kind: TypeExprKind::Refined {
                                base: base_ty,
                                preds,
                                tags,
                            },
                        })
                    }
                    _ => Err(CoreError::new(
                        ErrorKind::TypeShapeInvalid,
                        format!("'{base_name}' is not subscriptable in type position"),
                    )
                    .with_span(e.span)),
                }
            }
            _ => Err(CoreError::new(
                ErrorKind::TypeShapeInvalid,
                "expression is not a type",
            )
            .with_span(e.span)),
        }
    }

    pub fn resolve_type(&mut self, te: &TypeExpr) -> Result<TypeId, CoreError> {
        match &te.kind {
            TypeExprKind::Name(n) => self
                .arena
                .primitive(n)
                .or_else(|| self.registry.lookup_type(n))
                .or_else(|| self.arena.lookup_named(n))
                .ok_or_else(|| {
                    CoreError::new(
                        ErrorKind::TypeShapeInvalid,
                        format!("unknown type '{n}'"),
                    )
                    .with_span(te.span)
                }),
            TypeExprKind::Linear => Ok(self.arena.linear()),
            TypeExprKind::Ptr(inner) => {
                let p = self.resolve_type(inner)?;
                Ok(self.arena.ptr(p))
            }
            TypeExprKind::Array { elem, dims } => {
                let elem = self.resolve_type(elem)?;
                self.arena
                    .array(elem, dims.clone())
                    .map_err(|e| e.with_span(te.span))
            }
            TypeExprKind::Tuple(elems) => {
                let mut fields = Vec::new();
                for el in elems {
                    fields.push(Field::anon(self.resolve_type(el)?));
                }
                self.arena.struct_type(None, fields)
            }
            TypeExprKind::Func { params, ret, variadic } => {
                let mut ps = Vec::new();
                for p in params {
                    ps.push(self.resolve_type(p)?);
                }
                let r = self.resolve_type(ret)?;
                Ok(self.arena.func_type(ps, r, *variadic))
            }
            TypeExprKind::Refined { base, preds, tags } => {
                let base_ty = base
                    .as_ref()
                    .map(|b| self.resolve_type(b))
                    .transpose()?;
                let mut sigs = Vec::new();
                for p in preds {
                    let Some(info) = self.registry.base_function(&p.node) else {
                        return Err(CoreError::new(
                            ErrorKind::TypeShapeInvalid,
                            format!("unknown predicate '{}'", p.node),
                        )
                        .with_span(te.span));
                    };
                    let TypeKind::Func { params, .. } = self.arena.kind(info.sig) else {
                        unreachable!()
                    };
                    let param_names: Vec<String> = info
                        .def
                        .as_ref()
                        .map(|d| d.params.iter().map(|pp| pp.name.node.clone()).collect())
                        .unwrap_or_else(|| {
                            (0..params.len()).map(|i| format!("field_{i}")).collect()
                        });
                    sigs.push(PredicateSig {
                        name: p.node.clone(),
                        params: param_names.into_iter().zip(params.iter().copied()).collect(),
                    });
                }
                refine::refined_type(self.arena, base_ty, &sigs, tags)
                    .map_err(|e| e.with_span(te.span))
            }
        }
    }

    fn expect_bool(&self, t: TypeId, span: Span) -> Result<(), CoreError> {
        if matches!(self.arena.kind(self.arena.runtime_repr(t)), TypeKind::Bool) {
            Ok(())
        } else {
            Err(CoreError::new(
                ErrorKind::TypeMismatch,
                format!("expected bool, got {}", self.arena.display(t)),
            )
            .with_span(span))
        }
    }

    fn expect_convertible(
        &mut self,
        from: TypeId,
        to: TypeId,
        value: &Expr,
        span: Span,
    ) -> Result<(), CoreError> {
        if from == to {
            return Ok(());
        }
        // Integer literals adapt to any integer type.
        if value.as_int_lit().is_some()
            && self.arena.is_integral(from)
            && self.arena.is_integral(to)
        {
            return Ok(());
        }
        // assume()/refine() results convert by the refinement rules, as do
        // refined-to-base forgets.
        let refined_involved = matches!(self.arena.kind(from), TypeKind::Refined { .. })
            || matches!(self.arena.kind(to), TypeKind::Refined { .. });
        if refined_involved {
            return refine::check_conversion(self.arena, from, to).map_err(|e| e.with_span(span));
        }
        if self.arena.kind(from) == self.arena.kind(to) {
            return Ok(());
        }
        Err(CoreError::new(
            ErrorKind::TypeMismatch,
            format!(
                "expected {}, got {}",
                self.arena.display(to),
                self.arena.display(from)
            ),
        )
        .with_span(span))
    }
}

/// Per-function checking context.
pub struct FnCx {
    pub ret: TypeId,
    pub var_types: HashMap<String, TypeId>,
    pub effect_reads: BTreeSet<String>,
    pub callees: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pythoc_ast::{ident, Param};

    struct Harness {
        arena: TypeArena,
        registry: Registry,
        effects: EffectEnv,
        kernel: InlineKernel,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                arena: TypeArena::new(),
                registry: Registry::new(),
                effects: EffectEnv::new(),
                kernel: InlineKernel::new(),
            }
        }

        fn checker(&mut self) -> Checker<'_> {
            Checker::new(
                &mut self.arena,
                &mut self.registry,
                &mut self.effects,
                &mut self.kernel,
            )
        }
    }

    fn compiled_fn(name: &str, params: &[(&str, &str)], ret: &str, body: Vec<Stmt>) -> FuncDef {
        FuncDef {
            span: Span::default(),
            name: ident(name),
            decorators: vec![Decorator::Compile { suffix: None }],
            params: params
                .iter()
                .map(|(n, t)| Param {
                    span: Span::default(),
                    name: ident(n),
                    annotation: Some(TypeExpr::name(t)),
                })
                .collect(),
            ret: Some(TypeExpr::name(ret)),
            body,
        }
    }

    fn unit_with(funcs: Vec<FuncDef>) -> Unit {
        Unit {
            name: "test".into(),
            funcs,
            classes: Vec::new(),
            top_stmts: Vec::new(),
        }
    }

    #[test]
    fn simple_function_checks() {
        let mut h = Harness::new();
        let unit = unit_with(vec![compiled_fn(
            "add",
            &[("a", "i32"), ("b", "i32")],
            "i32",
            vec![Stmt::ret(Some(Expr::binary(
                Expr::name("a"),
                pythoc_ast::BinOp::Add,
                Expr::name("b"),
            )))],
        )]);
        let mut c = h.checker();
        let keys = c.register_unit(&unit).unwrap();
        assert_eq!(keys.len(), 1);
        let checked = c.check_function(&keys[0]).unwrap();
        assert_eq!(checked.key.name, "add");
        assert!(checked.callees.is_empty());
    }

    #[test]
    fn return_type_mismatch_rejected() {
        let mut h = Harness::new();
        let unit = unit_with(vec![compiled_fn(
            "bad",
            &[],
            "i32",
            vec![Stmt::ret(Some(Expr::bool_(true)))],
        )]);
        let mut c = h.checker();
        let keys = c.register_unit(&unit).unwrap();
        let err = c.check_function(&keys[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn effect_reads_are_recorded_and_folded() {
        let mut h = Harness::new();
        h.effects
            .set_default("threshold", EffectImpl::Value(ConstValue::Int(10)));
        let unit = unit_with(vec![compiled_fn(
            "use_effect",
            &[],
            "i32",
            vec![Stmt::ret(Some(Expr::attr(Expr::name("effect"), "threshold")))],
        )]);
        let mut c = h.checker();
        let keys = c.register_unit(&unit).unwrap();
        let checked = c.check_function(&keys[0]).unwrap();
        assert!(checked.effect_reads.contains("threshold"));
    }

    #[test]
    fn unbound_effect_read_fails() {
        let mut h = Harness::new();
        let unit = unit_with(vec![compiled_fn(
            "oops",
            &[],
            "i32",
            vec![Stmt::ret(Some(Expr::attr(Expr::name("effect"), "missing")))],
        )]);
        let mut c = h.checker();
        let keys = c.register_unit(&unit).unwrap();
        let err = c.check_function(&keys[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EffectUnbound);
    }

    #[test]
    fn pin_from_top_stmt_then_repin_fails() {
        let mut h = Harness::new();
        let mut unit = unit_with(vec![]);
        unit.top_stmts.push(Stmt::assign(
            Expr::attr(Expr::name("effect"), "rng"),
            Expr::name("std_rng"),
        ));
        unit.top_stmts.push(Stmt::assign(
            Expr::attr(Expr::name("effect"), "rng"),
            Expr::name("other_rng"),
        ));
        let mut c = h.checker();
        let err = c.register_unit(&unit).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EffectRepin);
    }

    #[test]
    fn enum_class_registers_with_payloads() {
        let mut h = Harness::new();
        let mut unit = unit_with(vec![]);
        unit.classes.push(ClassDef {
            span: Span::default(),
            name: ident("Status"),
            decorators: vec![Decorator::Enum { tag_type: None }],
            fields: vec![
                pythoc_ast::FieldDef {
                    span: Span::default(),
                    name: Some(ident("Ok")),
                    annotation: Some(TypeExpr::name("i32")),
                    tag_value: None,
                },
                pythoc_ast::FieldDef {
                    span: Span::default(),
                    name: Some(ident("Err")),
                    annotation: None,
                    tag_value: Some(7),
                },
            ],
        });
        let mut c = h.checker();
        c.register_unit(&unit).unwrap();
        let ty = h.registry.lookup_type("Status").unwrap();
        let TypeKind::Enum { variants, .. } = h.arena.kind(ty) else {
            panic!("expected enum");
        };
        assert_eq!(variants[0].payload.is_some(), true);
        assert_eq!(variants[1].tag, 7);
    }

    #[test]
    fn extern_redeclaration_with_other_sig_fails() {
        let mut h = Harness::new();
        let mut ext = compiled_fn("cos", &[("x", "f64")], "f64", vec![Stmt::pass()]);
        ext.decorators = vec![Decorator::Extern { lib: Some("m".into()) }];
        let mut ext2 = compiled_fn("cos", &[("x", "f32")], "f32", vec![Stmt::pass()]);
        ext2.decorators = vec![Decorator::Extern { lib: Some("m".into()) }];
        let unit = unit_with(vec![ext, ext2]);
        let mut c = h.checker();
        let err = c.register_unit(&unit).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternSignatureMismatch);
    }

    #[test]
    fn sizeof_folds_to_layout_constant() {
        let mut h = Harness::new();
        let mut c = h.checker();
        let folded = c
            .fold_const(&Expr::call_named("sizeof", vec![Expr::name("i64")]))
            .unwrap();
        assert_eq!(folded, ConstValue::Int(8));
    }

    #[test]
    fn invalid_cast_rejected() {
        let mut h = Harness::new();
        let unit = unit_with(vec![compiled_fn(
            "bad_cast",
            &[("p", "bool")],
            "f64",
            vec![Stmt::ret(Some(Expr::call_named("f64", vec![Expr::name("p")])))],
        )]);
        let mut c = h.checker();
        let keys = c.register_unit(&unit).unwrap();
        let err = c.check_function(&keys[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCast);
    }

    #[test]
    fn linear_check_runs_in_pipeline() {
        let mut h = Harness::new();
        let unit = unit_with(vec![compiled_fn(
            "leaky",
            &[],
            "void",
            vec![Stmt::assign_name("t", Expr::call_named("linear", vec![]))],
        )]);
        let mut c = h.checker();
        let keys = c.register_unit(&unit).unwrap();
        let err = c.check_function(&keys[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinearExitNotConsumed);
    }

    #[test]
    fn match_exhaustiveness_runs_in_pipeline() {
        let mut h = Harness::new();
        let unit = unit_with(vec![compiled_fn(
            "partial",
            &[("b", "bool")],
            "i32",
            vec![
                Stmt {
                    span: Span::default(),
                    kind: StmtKind::Match {
                        subject: Expr::name("b"),
                        arms: vec![pythoc_ast::MatchArm::new(
                            Pattern::bool_(true),
                            vec![Stmt::ret(Some(Expr::int(1)))],
                        )],
                    },
                },
                Stmt::ret(Some(Expr::int(0))),
            ],
        )]);
        let mut c = h.checker();
        let keys = c.register_unit(&unit).unwrap();
        let err = c.check_function(&keys[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MatchNonExhaustive);
    }
}
