#![allow(clippy::result_large_err)]

use miette::Diagnostic;
use pythoc_ast::Span;
use thiserror::Error;

/// Classification of every failure the front and middle end can surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Parsing / shape
    TypeShapeInvalid,
    RefinedArityMismatch,
    // Types
    TypeMismatch,
    InvalidCast,
    ExternSignatureMismatch,
    // Effects
    EffectUnbound,
    EffectRepin,
    EffectSuffixRequired,
    EffectCycle,
    // Linear ownership
    LinearOverwrite,
    LinearCopy,
    LinearUseAfterConsume,
    LinearUndefined,
    LinearInconsistentMerge,
    LinearExitNotConsumed,
    // Refinement
    RefineTagNotSubset,
    RefineBaseToRefined,
    RefineOutsideForLoop,
    // Match
    MatchNonExhaustive,
    MatchPatternTypeMismatch,
    // Control flow
    LabelNotVisible,
    GotoEndToUncle,
    UnreachableAfterReturn,
    // Driver
    CompileCycle,
    RecursiveInline,
    VariantCollision,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A fatal diagnostic for the current translation unit.
///
/// Inlined code carries a synthetic location; `provenance` then names the
/// inlining chain that produced the statement.
#[derive(Clone, Debug, Error, Diagnostic)]
#[error("{kind}: {message}")]
#[diagnostic(code(pythoc::core))]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[label("{kind}")]
    pub span: Option<miette::SourceSpan>,
    pub provenance: Option<String>,
    /// Uncovered-value witnesses for non-exhaustive matches, sample
    /// offending paths for linear errors.
    pub witnesses: Vec<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            provenance: None,
            witnesses: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span.into());
        self
    }

    pub fn with_provenance(mut self, chain: impl Into<String>) -> Self {
        self.provenance = Some(chain.into());
        self
    }

    pub fn with_witnesses(mut self, witnesses: Vec<String>) -> Self {
        self.witnesses = witnesses;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}
