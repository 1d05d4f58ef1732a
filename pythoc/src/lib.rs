#![forbid(unsafe_code)]

//! The compilation driver: orders translation units, runs the front- and
//! middle-end pipeline per function, re-invokes compilation for
//! effect-variant callees, and deduplicates by the
//! `(name, compile_suffix, effect_suffix)` triple.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, info};

use pythoc_ast::{Expr, ExprKind, FuncDef, Stmt, StmtKind, Unit};
use pythoc_core::effects::{EffectEnv, EffectImpl, OverrideFrame};
use pythoc_core::inline::InlineKernel;
use pythoc_core::lower;
use pythoc_core::registry::Intrinsic;
use pythoc_core::{Checker, CoreError, ErrorKind, Registry, SymbolKey, TypeArena};
use pythoc_ir as ir;

/// One emitted symbol, as recorded in the compile manifest.
#[derive(Clone, Debug, Serialize)]
pub struct ManifestEntry {
    pub name: String,
    pub compile_suffix: String,
    pub effect_suffix: String,
    pub symbol: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Manifest {
    pub symbols: Vec<ManifestEntry>,
}

pub struct Session {
    arena: TypeArena,
    registry: Registry,
    effects: EffectEnv,
    kernel: InlineKernel,
    queue: Vec<SymbolKey>,
    compiled: BTreeMap<SymbolKey, String>,
    in_progress: Vec<SymbolKey>,
    module: ir::Module,
    manifest: Manifest,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            arena: TypeArena::new(),
            registry: Registry::new(),
            effects: EffectEnv::new(),
            kernel: InlineKernel::new(),
            queue: Vec::new(),
            compiled: BTreeMap::new(),
            in_progress: Vec::new(),
            module: ir::Module::new(),
            manifest: Manifest::default(),
        }
    }

    /// Register a translation unit's declarations and queue its `@compile`
    /// functions. Under an active override, the registered variants carry
    /// the current effect suffix (the import interception path).
    pub fn add_unit(&mut self, unit: &Unit) -> Result<(), CoreError> {
        let wanted = {
            let mut checker = Checker::new(
                &mut self.arena,
                &mut self.registry,
                &mut self.effects,
                &mut self.kernel,
            );
            checker.register_unit(unit)?
        };
        // Syntactic effect-read and callee scan, so transitive propagation
        // never depends on compilation order.
        for func in &unit.funcs {
            let key = SymbolKey::base(&func.name.node);
            if let Some(info) = self.registry.function_mut(&key) {
                info.effect_reads = scan_effect_reads(&func.body);
                info.callees = scan_callees(&func.body);
            }
        }
        for key in wanted {
            if self.compiled.contains_key(&key) {
                return Err(CoreError::new(
                    ErrorKind::VariantCollision,
                    format!("symbol '{}' was already emitted this session", key.mangled()),
                ));
            }
            self.queue.push(key);
        }
        Ok(())
    }

    /// `with effect(...)` at the driver boundary. Strict LIFO; the matching
    /// [`Session::pop_effect_override`] is mandatory.
    pub fn push_effect_override(
        &mut self,
        suffix: Option<&str>,
        bindings: Vec<(String, EffectImpl)>,
    ) -> Result<(), CoreError> {
        let frame = OverrideFrame::new(
            suffix.map(str::to_string),
            bindings.into_iter().collect::<HashMap<_, _>>(),
        )?;
        self.effects.push_override(frame);
        Ok(())
    }

    pub fn pop_effect_override(&mut self) -> Result<(), CoreError> {
        self.effects.pop_override().map(|_| ())
    }

    /// Compile everything queued, in registration order, with variant
    /// fanout happening on demand.
    pub fn compile_all(&mut self) -> Result<(), CoreError> {
        while !self.queue.is_empty() {
            let batch: Vec<SymbolKey> = std::mem::take(&mut self.queue);
            for key in batch {
                self.compile_symbol(&key)?;
            }
        }
        Ok(())
    }

    /// Compile one function under the current effect context, returning the
    /// emitted symbol name.
    pub fn compile_function(&mut self, name: &str) -> Result<String, CoreError> {
        let key = SymbolKey::with_suffixes(name, "", &self.effects.current_suffix());
        self.ensure_variant_registered(&key)?;
        self.compile_symbol(&key)?;
        Ok(key.mangled())
    }

    fn ensure_variant_registered(&mut self, key: &SymbolKey) -> Result<(), CoreError> {
        if self.registry.has_function(key) {
            return Ok(());
        }
        let base = self
            .registry
            .base_function(&key.name)
            .cloned()
            .ok_or_else(|| {
                CoreError::new(
                    ErrorKind::TypeMismatch,
                    format!("unknown function '{}'", key.name),
                )
            })?;
        let mut variant = base;
        variant.key = key.clone();
        self.registry.insert_function(variant);
        Ok(())
    }

    fn compile_symbol(&mut self, key: &SymbolKey) -> Result<(), CoreError> {
        // Invariant: one IR symbol per triple per session.
        if self.compiled.contains_key(key) {
            return Ok(());
        }
        if self.in_progress.contains(key) {
            return Err(CoreError::new(
                ErrorKind::CompileCycle,
                format!(
                    "circular compilation dependency through '{}'",
                    key.mangled()
                ),
            ));
        }
        self.in_progress.push(key.clone());
        let result = self.compile_symbol_inner(key);
        self.in_progress.pop();
        result
    }

    fn compile_symbol_inner(&mut self, key: &SymbolKey) -> Result<(), CoreError> {
        debug!(symbol = %key.mangled(), "compiling");
        let checked = {
            let mut checker = Checker::new(
                &mut self.arena,
                &mut self.registry,
                &mut self.effects,
                &mut self.kernel,
            );
            checker.check_function(key)?
        };

        // The checked read/callee sets refine the syntactic scan.
        if let Some(info) = self.registry.function_mut(key) {
            info.effect_reads = checked.effect_reads.clone();
            info.callees = checked.callees.clone();
        }
        self.propagate_transitive_reads();

        // Effect-variant fanout: a callee is redirected to its suffix
        // variant iff its transitive read set intersects the overridden
        // names; otherwise the base variant is called.
        let mut redirects: HashMap<String, String> = HashMap::new();
        let suffix = key.effect_suffix.clone();
        if !suffix.is_empty() {
            let overridden = self.effects.overridden_names();
            for callee in &checked.callees {
                let Some(info) = self.registry.base_function(callee) else {
                    continue;
                };
                if info.def.is_none() {
                    continue; // externs never carry effect variants
                }
                if info.transitive_reads.is_disjoint(&overridden) {
                    continue;
                }
                let vkey = SymbolKey::with_suffixes(callee, "", &suffix);
                self.ensure_variant_registered(&vkey)?;
                self.compile_symbol(&vkey)?;
                redirects.insert(callee.clone(), vkey.mangled());
            }
        }

        let (function, externs) = lower::lower_function(
            &self.arena,
            &self.registry,
            &self.effects,
            &checked,
            &redirects,
        )?;
        info!(symbol = %function.name, "emitted");
        for (name, sig) in externs {
            self.module.externs.entry(name).or_insert(sig);
        }
        self.manifest.symbols.push(ManifestEntry {
            name: key.name.clone(),
            compile_suffix: key.compile_suffix.clone(),
            effect_suffix: key.effect_suffix.clone(),
            symbol: function.name.clone(),
        });
        self.module.functions.insert(function.name.clone(), function);
        self.compiled.insert(key.clone(), key.mangled());
        Ok(())
    }

    /// Fixpoint of `transitive = direct ∪ ⋃ callees.transitive` over the
    /// base function table.
    fn propagate_transitive_reads(&mut self) {
        let snapshot: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)> = self
            .registry
            .functions()
            .filter(|(k, _)| k.compile_suffix.is_empty() && k.effect_suffix.is_empty())
            .map(|(k, info)| {
                (
                    k.name.clone(),
                    (info.effect_reads.clone(), info.callees.clone()),
                )
            })
            .collect();
        let mut transitive: BTreeMap<String, BTreeSet<String>> = snapshot
            .iter()
            .map(|(name, (reads, _))| (name.clone(), reads.clone()))
            .collect();
        loop {
            let mut changed = false;
            for (name, (_, callees)) in &snapshot {
                let mut merged = transitive[name].clone();
                for callee in callees {
                    if let Some(theirs) = transitive.get(callee) {
                        for r in theirs {
                            if merged.insert(r.clone()) {
                                changed = true;
                            }
                        }
                    }
                }
                transitive.insert(name.clone(), merged);
            }
            if !changed {
                break;
            }
        }
        for (name, reads) in transitive {
            let key = SymbolKey::base(&name);
            if let Some(info) = self.registry.function_mut(&key) {
                info.transitive_reads = reads;
            }
        }
    }

    pub fn module(&self) -> &ir::Module {
        &self.module
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn emitted_symbols(&self) -> Vec<String> {
        self.compiled.values().cloned().collect()
    }

    pub fn emit_llvm_ir(&self) -> Result<String, CoreError> {
        pythoc_backend_llvm::emit_llvm_ir(&self.module)
            .map(|a| a.llvm_ir)
            .map_err(|e| CoreError::new(ErrorKind::TypeShapeInvalid, e.message))
    }
}

/// Syntactic scan for `effect.N` reads.
fn scan_effect_reads(body: &[Stmt]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    walk_exprs(body, &mut |e| {
        if let ExprKind::Attribute { base, attr } = &e.kind {
            if base.as_name() == Some("effect") {
                out.insert(attr.node.clone());
            }
        }
    });
    out
}

/// Syntactic scan for direct callees, excluding intrinsics.
fn scan_callees(body: &[Stmt]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    walk_exprs(body, &mut |e| {
        if let Some((name, _)) = e.as_direct_call() {
            if Intrinsic::by_name(name).is_none() {
                out.insert(name.to_string());
            }
        }
    });
    out
}

fn walk_exprs(body: &[Stmt], f: &mut impl FnMut(&Expr)) {
    fn walk_expr(e: &Expr, f: &mut impl FnMut(&Expr)) {
        f(e);
        match &e.kind {
            ExprKind::Tuple(elems) => {
                for el in elems {
                    walk_expr(el, f);
                }
            }
            ExprKind::Attribute { base, .. } => walk_expr(base, f),
            ExprKind::Subscript { base, indices } => {
                walk_expr(base, f);
                for i in indices {
                    walk_expr(i, f);
                }
            }
            ExprKind::Call { callee, args, kwargs } => {
                walk_expr(callee, f);
                for a in args {
                    walk_expr(a, f);
                }
                for (_, v) in kwargs {
                    walk_expr(v, f);
                }
            }
            ExprKind::Unary { operand, .. } => walk_expr(operand, f),
            ExprKind::Binary { left, right, .. } | ExprKind::Compare { left, right, .. } => {
                walk_expr(left, f);
                walk_expr(right, f);
            }
            ExprKind::Lambda { body, .. } => walk_expr(body, f),
            _ => {}
        }
    }
    for stmt in body {
        match &stmt.kind {
            StmtKind::Expr(e) => walk_expr(e, f),
            StmtKind::Assign { target, value } => {
                walk_expr(target, f);
                walk_expr(value, f);
            }
            StmtKind::AnnAssign { target, value, .. } => {
                walk_expr(target, f);
                if let Some(v) = value {
                    walk_expr(v, f);
                }
            }
            StmtKind::Return(v) | StmtKind::Yield(v) => {
                if let Some(v) = v {
                    walk_expr(v, f);
                }
            }
            StmtKind::If { cond, then_body, else_body } => {
                walk_expr(cond, f);
                walk_exprs(then_body, f);
                walk_exprs(else_body, f);
            }
            StmtKind::While { cond, body, else_body } => {
                walk_expr(cond, f);
                walk_exprs(body, f);
                walk_exprs(else_body, f);
            }
            StmtKind::For { target, iter, body, else_body } => {
                walk_expr(target, f);
                walk_expr(iter, f);
                walk_exprs(body, f);
                walk_exprs(else_body, f);
            }
            StmtKind::Match { subject, arms } => {
                walk_expr(subject, f);
                for arm in arms {
                    if let Some(g) = &arm.guard {
                        walk_expr(g, f);
                    }
                    walk_exprs(&arm.body, f);
                }
            }
            StmtKind::With { item, body, .. } => {
                walk_expr(item, f);
                walk_exprs(body, f);
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
        }
    }
}

/// Convenience for tests and embedders: declare and register a group of
/// extern functions from a C import boundary.
pub fn extern_group(lib: &str, decls: Vec<FuncDef>) -> Unit {
    let mut unit = Unit::new(lib);
    for mut decl in decls {
        decl.decorators = vec![pythoc_ast::Decorator::Extern {
            lib: Some(lib.to_string()),
        }];
        unit.funcs.push(decl);
    }
    unit
}
