//! Compile-time effect resolution.
//!
//! Each effect name resolves through three layers: a direct pin (immutable),
//! the topmost scoped override on the stack, then the library default. Value
//! effects fold to literal constants; function effects monomorphize call
//! sites to concrete symbols. Overrides carry the `effect_suffix` that names
//! the compiled variants they force into existence.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CoreError, ErrorKind};

/// A compile-time constant, as produced by value effects and constant
/// folding.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstValue {
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// What an effect name is bound to.
#[derive(Clone, Debug, PartialEq)]
pub enum EffectImpl {
    /// A function symbol; `effect.rng.next(...)` resolves to it.
    Func(String),
    /// A literal constant that flows into constant folding.
    Value(ConstValue),
}

/// One `with effect(name=impl, ..., suffix=S)` frame.
#[derive(Clone, Debug)]
pub struct OverrideFrame {
    pub suffix: String,
    pub bindings: HashMap<String, EffectImpl>,
}

impl OverrideFrame {
    /// Build a frame, enforcing that overrides always name a suffix.
    pub fn new(
        suffix: Option<String>,
        bindings: HashMap<String, EffectImpl>,
    ) -> Result<Self, CoreError> {
        let suffix = match suffix {
            Some(s) => s,
            None if bindings.is_empty() => String::new(),
            None => {
                return Err(CoreError::new(
                    ErrorKind::EffectSuffixRequired,
                    "scoped effect override requires an explicit suffix",
                ))
            }
        };
        Ok(Self { suffix, bindings })
    }
}

#[derive(Default)]
pub struct EffectEnv {
    pinned: HashMap<String, EffectImpl>,
    defaults: HashMap<String, EffectImpl>,
    overrides: Vec<OverrideFrame>,
}

impl EffectEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// `effect.default(name=impl)`: installs or replaces the default layer.
    pub fn set_default(&mut self, name: &str, imp: EffectImpl) {
        self.defaults.insert(name.to_string(), imp);
    }

    /// `effect.name = impl`: a pin is immutable for the session.
    pub fn pin(&mut self, name: &str, imp: EffectImpl) -> Result<(), CoreError> {
        if self.pinned.contains_key(name) {
            return Err(CoreError::new(
                ErrorKind::EffectRepin,
                format!("effect '{name}' is already pinned"),
            ));
        }
        self.pinned.insert(name.to_string(), imp);
        Ok(())
    }

    pub fn push_override(&mut self, frame: OverrideFrame) {
        self.overrides.push(frame);
    }

    /// Strict LIFO: an unbalanced pop is a programmer error in the driver.
    pub fn pop_override(&mut self) -> Result<OverrideFrame, CoreError> {
        self.overrides.pop().ok_or_else(|| {
            CoreError::new(
                ErrorKind::EffectCycle,
                "unbalanced effect override pop",
            )
        })
    }

    /// Pin > topmost override binding > default > unbound.
    pub fn resolve(&self, name: &str) -> Result<&EffectImpl, CoreError> {
        if let Some(imp) = self.pinned.get(name) {
            return Ok(imp);
        }
        for frame in self.overrides.iter().rev() {
            if let Some(imp) = frame.bindings.get(name) {
                return Ok(imp);
            }
        }
        if let Some(imp) = self.defaults.get(name) {
            return Ok(imp);
        }
        Err(CoreError::new(
            ErrorKind::EffectUnbound,
            format!("effect '{name}' is not bound"),
        ))
    }

    /// The `effect_suffix` active at this point: the topmost frame that
    /// carries a suffix, or empty outside any override.
    pub fn current_suffix(&self) -> String {
        self.overrides
            .iter()
            .rev()
            .find(|f| !f.suffix.is_empty())
            .map(|f| f.suffix.clone())
            .unwrap_or_default()
    }

    /// All effect names bound by any active override frame.
    pub fn overridden_names(&self) -> BTreeSet<String> {
        self.overrides
            .iter()
            .flat_map(|f| f.bindings.keys().cloned())
            .collect()
    }

    pub fn override_depth(&self) -> usize {
        self.overrides.len()
    }
}

/// Symbol mangling: `{name}_{compile_suffix}_{effect_suffix}` with trailing
/// empty components omitted. An empty compile suffix before a nonempty
/// effect suffix keeps its separator, so effect variants are always
/// distinguishable from compile variants (`f__mock` vs `f_fast`).
pub fn mangle(name: &str, compile_suffix: &str, effect_suffix: &str) -> String {
    match (compile_suffix.is_empty(), effect_suffix.is_empty()) {
        (true, true) => name.to_string(),
        (false, true) => format!("{name}_{compile_suffix}"),
        (_, false) => format!("{name}_{compile_suffix}_{effect_suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: &str) -> EffectImpl {
        EffectImpl::Func(name.to_string())
    }

    #[test]
    fn resolution_priority_is_pin_override_default() {
        let mut env = EffectEnv::new();
        env.set_default("rng", func("std_rng"));
        assert_eq!(env.resolve("rng").unwrap(), &func("std_rng"));

        let frame = OverrideFrame::new(
            Some("mock".into()),
            HashMap::from([("rng".to_string(), func("mock_rng"))]),
        )
        .unwrap();
        env.push_override(frame);
        assert_eq!(env.resolve("rng").unwrap(), &func("mock_rng"));

        env.pin("rng", func("pinned_rng")).unwrap();
        assert_eq!(env.resolve("rng").unwrap(), &func("pinned_rng"));

        env.pop_override().unwrap();
        assert_eq!(env.resolve("rng").unwrap(), &func("pinned_rng"));
    }

    #[test]
    fn repin_fails() {
        let mut env = EffectEnv::new();
        env.pin("clock", func("a")).unwrap();
        let err = env.pin("clock", func("b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EffectRepin);
    }

    #[test]
    fn unbound_effect_reports() {
        let env = EffectEnv::new();
        let err = env.resolve("missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EffectUnbound);
    }

    #[test]
    fn override_without_suffix_rejected() {
        let err = OverrideFrame::new(
            None,
            HashMap::from([("rng".to_string(), func("mock_rng"))]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EffectSuffixRequired);
        // Suffix alone (variant-naming context) is fine.
        assert!(OverrideFrame::new(None, HashMap::new()).is_ok());
    }

    #[test]
    fn suffix_tracks_topmost_frame() {
        let mut env = EffectEnv::new();
        assert_eq!(env.current_suffix(), "");
        env.push_override(
            OverrideFrame::new(Some("mock".into()), HashMap::new()).unwrap(),
        );
        env.push_override(
            OverrideFrame::new(Some("fast".into()), HashMap::new()).unwrap(),
        );
        assert_eq!(env.current_suffix(), "fast");
        env.pop_override().unwrap();
        assert_eq!(env.current_suffix(), "mock");
    }

    #[test]
    fn mangling_keeps_effect_slot_distinct() {
        assert_eq!(mangle("f", "", ""), "f");
        assert_eq!(mangle("f", "fast", ""), "f_fast");
        assert_eq!(mangle("f", "", "mock"), "f__mock");
        assert_eq!(mangle("f", "fast", "mock"), "f_fast_mock");
    }
}
