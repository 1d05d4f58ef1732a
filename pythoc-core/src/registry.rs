//! Named lookup for variables, functions, type definitions, builtins, and
//! effect values, with lexical scopes. Function symbols are keyed by the
//! full `(name, compile_suffix, effect_suffix)` triple and persist across
//! translation units within a driver session.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use pythoc_ast::{FuncDef, Span};

use crate::effects::{mangle, ConstValue};
use crate::types::TypeId;

/// Intrinsics the front end recognizes by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intrinsic {
    Sizeof,
    Ptr,
    NullPtr,
    Linear,
    Consume,
    Move,
    Assume,
    Refine,
    Defer,
    Label,
    Goto,
    GotoBegin,
    GotoEnd,
    Cimport,
    Range,
}

impl Intrinsic {
    pub fn by_name(name: &str) -> Option<Intrinsic> {
        Some(match name {
            "sizeof" => Intrinsic::Sizeof,
            "ptr" => Intrinsic::Ptr,
            "nullptr" => Intrinsic::NullPtr,
            "linear" => Intrinsic::Linear,
            "consume" => Intrinsic::Consume,
            "move" => Intrinsic::Move,
            "assume" => Intrinsic::Assume,
            "refine" => Intrinsic::Refine,
            "defer" => Intrinsic::Defer,
            "label" => Intrinsic::Label,
            "goto" => Intrinsic::Goto,
            "goto_begin" => Intrinsic::GotoBegin,
            "goto_end" => Intrinsic::GotoEnd,
            "cimport" => Intrinsic::Cimport,
            "range" => Intrinsic::Range,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolKey {
    pub name: String,
    pub compile_suffix: String,
    pub effect_suffix: String,
}

impl SymbolKey {
    pub fn base(name: &str) -> Self {
        Self {
            name: name.to_string(),
            compile_suffix: String::new(),
            effect_suffix: String::new(),
        }
    }

    pub fn with_suffixes(name: &str, compile_suffix: &str, effect_suffix: &str) -> Self {
        Self {
            name: name.to_string(),
            compile_suffix: compile_suffix.to_string(),
            effect_suffix: effect_suffix.to_string(),
        }
    }

    pub fn mangled(&self) -> String {
        mangle(&self.name, &self.compile_suffix, &self.effect_suffix)
    }
}

#[derive(Clone, Debug)]
pub struct VarInfo {
    pub name: String,
    pub ty: TypeId,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct FuncInfo {
    pub key: SymbolKey,
    pub sig: TypeId,
    /// Retained definition for inlining and variant recompilation. Extern
    /// declarations have none worth walking.
    pub def: Option<Arc<FuncDef>>,
    pub is_inline: bool,
    pub is_generator: bool,
    pub extern_lib: Option<String>,
    /// Effect names this function reads directly.
    pub effect_reads: BTreeSet<String>,
    /// Effect names read by this function or any transitive callee.
    pub transitive_reads: BTreeSet<String>,
    /// Direct callees, for call-graph ordering and suffix propagation.
    pub callees: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub enum Entity {
    Var(VarInfo),
    Func(SymbolKey),
    Type(TypeId),
    Builtin(Intrinsic),
    EffectValue(ConstValue),
}

pub struct Registry {
    scopes: Vec<HashMap<String, Entity>>,
    functions: HashMap<SymbolKey, FuncInfo>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            functions: HashMap::new(),
        }
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn exit_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "cannot exit the root scope");
        self.scopes.pop();
    }

    pub fn declare(&mut self, name: &str, entity: Entity) {
        self.scopes
            .last_mut()
            .expect("registry always has a root scope")
            .insert(name.to_string(), entity);
    }

    /// Innermost binding wins; intrinsics are a fallback below user names.
    pub fn lookup(&self, name: &str) -> Option<Entity> {
        for scope in self.scopes.iter().rev() {
            if let Some(e) = scope.get(name) {
                return Some(e.clone());
            }
        }
        Intrinsic::by_name(name).map(Entity::Builtin)
    }

    pub fn lookup_var(&self, name: &str) -> Option<VarInfo> {
        match self.lookup(name) {
            Some(Entity::Var(v)) => Some(v),
            _ => None,
        }
    }

    pub fn lookup_type(&self, name: &str) -> Option<TypeId> {
        match self.lookup(name) {
            Some(Entity::Type(t)) => Some(t),
            _ => None,
        }
    }

    pub fn insert_function(&mut self, info: FuncInfo) {
        let key = info.key.clone();
        self.functions.insert(key.clone(), info);
        // The bare name resolves to the base variant in expression position.
        if key.compile_suffix.is_empty() && key.effect_suffix.is_empty() {
            self.declare_global(&key.name.clone(), Entity::Func(key));
        }
    }

    /// Declare into the root scope regardless of current nesting.
    pub fn declare_global(&mut self, name: &str, entity: Entity) {
        self.scopes[0].insert(name.to_string(), entity);
    }

    pub fn function(&self, key: &SymbolKey) -> Option<&FuncInfo> {
        self.functions.get(key)
    }

    pub fn function_mut(&mut self, key: &SymbolKey) -> Option<&mut FuncInfo> {
        self.functions.get_mut(key)
    }

    pub fn base_function(&self, name: &str) -> Option<&FuncInfo> {
        self.functions.get(&SymbolKey::base(name))
    }

    pub fn has_function(&self, key: &SymbolKey) -> bool {
        self.functions.contains_key(key)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&SymbolKey, &FuncInfo)> {
        self.functions.iter()
    }

    /// Names visible at global scope, for capture classification.
    pub fn global_names(&self) -> BTreeSet<String> {
        self.scopes[0].keys().cloned().collect()
    }
}
