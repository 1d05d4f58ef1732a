//! Pattern-matrix exhaustiveness checking (Maranget-style useless-clause
//! formulation) and the switch-vs-if-chain lowering selection.
//!
//! Guards are conservatively treated as potentially false: a guarded row
//! never contributes to coverage. Wildcards and bindings are equivalent for
//! exhaustiveness.

use pythoc_ast::{Expr, ExprKind, MatchArm, Pattern as AstPattern, Span};

use crate::error::{CoreError, ErrorKind};
use crate::types::{TypeArena, TypeId, TypeKind};

#[derive(Clone, Debug, PartialEq)]
pub enum Lit {
    Int(i128),
    Bool(bool),
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Pat {
    Wildcard,
    Lit(Lit),
    Ctor {
        tag: i64,
        name: String,
        subs: Vec<Pat>,
    },
    Or(Vec<Pat>),
}

impl Pat {
    fn is_wildcard(&self) -> bool {
        matches!(self, Pat::Wildcard)
    }
}

#[derive(Clone, Debug)]
pub struct Row {
    pub pats: Vec<Pat>,
    pub has_guard: bool,
}

#[derive(Clone, Debug)]
pub struct Matrix {
    pub rows: Vec<Row>,
    pub col_types: Vec<TypeId>,
}

/// Is every value of this type enumerable at compile time?
fn is_finite(arena: &TypeArena, ty: TypeId, seen: &mut Vec<TypeId>) -> bool {
    if seen.contains(&ty) {
        // Recursive types cannot be enumerated.
        return false;
    }
    seen.push(ty);
    let result = match arena.kind(arena.runtime_repr(ty)) {
        TypeKind::Bool => true,
        TypeKind::Enum { .. } => true,
        TypeKind::Struct { fields, .. } => {
            fields.iter().all(|f| is_finite(arena, f.ty, seen))
        }
        _ => false,
    };
    seen.pop();
    result
}

/// All constructors of a finite (or single-constructor) type:
/// `(tag, name, sub_types)`.
fn constructors(arena: &TypeArena, ty: TypeId) -> Vec<(i64, String, Vec<TypeId>)> {
    match arena.kind(arena.runtime_repr(ty)) {
        TypeKind::Bool => vec![
            (1, "True".to_string(), Vec::new()),
            (0, "False".to_string(), Vec::new()),
        ],
        TypeKind::Enum { name, variants, .. } => variants
            .iter()
            .map(|v| {
                let subs = v.payload.map(|p| vec![p]).unwrap_or_default();
                (v.tag, format!("{name}.{}", v.name), subs)
            })
            .collect(),
        TypeKind::Struct { name, fields } => {
            let display = name.clone().unwrap_or_else(|| "tuple".to_string());
            vec![(0, display, fields.iter().map(|f| f.ty).collect())]
        }
        TypeKind::Array { elem, dims } => {
            let n: u64 = dims.iter().product();
            vec![(0, "array".to_string(), vec![*elem; n as usize])]
        }
        _ => Vec::new(),
    }
}

/// Check the matrix; returns `(exhaustive, uncovered witnesses)`.
pub fn is_exhaustive(arena: &TypeArena, matrix: &Matrix) -> (bool, Vec<String>) {
    if matrix.rows.is_empty() {
        if matrix.col_types.is_empty() {
            return (true, Vec::new());
        }
        return (false, vec!["_".to_string()]);
    }
    if matrix.rows[0].pats.is_empty() {
        // No columns left: covered iff some row has no guard.
        if matrix.rows.iter().any(|r| !r.has_guard) {
            return (true, Vec::new());
        }
        return (false, vec!["_".to_string()]);
    }

    let col_ty = matrix.col_types[0];

    // An unguarded wildcard in the first column covers it entirely.
    if matrix
        .rows
        .iter()
        .any(|r| r.pats[0].is_wildcard() && !r.has_guard)
    {
        return is_exhaustive(arena, &specialize_default(matrix));
    }

    let repr = arena.runtime_repr(col_ty);
    let finite = is_finite(arena, col_ty, &mut Vec::new());
    let single_ctor = matches!(
        arena.kind(repr),
        TypeKind::Struct { .. } | TypeKind::Array { .. }
    );

    if finite || single_ctor {
        let mut uncovered = Vec::new();
        for (tag, name, subs) in constructors(arena, col_ty) {
            let specialized = specialize(arena, matrix, col_ty, tag, &subs);
            if specialized.rows.is_empty() {
                uncovered.push(name);
                continue;
            }
            let (sub_ok, sub_uncovered) = is_exhaustive(arena, &specialized);
            if !sub_ok {
                for u in sub_uncovered {
                    uncovered.push(format!("({name}, {u})"));
                }
            }
        }
        return (uncovered.is_empty(), uncovered);
    }

    // Infinite first column (ints, pointers, strings) with no catch-all.
    (
        false,
        vec![format!("_ (catch-all required for {})", arena.display(col_ty))],
    )
}

/// Keep rows matching `tag` in the first column, expanding sub-patterns.
fn specialize(
    arena: &TypeArena,
    matrix: &Matrix,
    col_ty: TypeId,
    tag: i64,
    sub_types: &[TypeId],
) -> Matrix {
    let mut rows = Vec::new();
    for row in &matrix.rows {
        for expanded in specialize_pattern(arena, &row.pats[0], col_ty, tag, sub_types) {
            let mut pats = expanded;
            pats.extend(row.pats[1..].iter().cloned());
            rows.push(Row {
                pats,
                has_guard: row.has_guard,
            });
        }
    }
    let mut col_types = sub_types.to_vec();
    col_types.extend(matrix.col_types[1..].iter().copied());
    Matrix { rows, col_types }
}

/// The first-column expansions of one pattern under a constructor, or empty
/// when the pattern cannot match it.
fn specialize_pattern(
    arena: &TypeArena,
    pat: &Pat,
    col_ty: TypeId,
    tag: i64,
    sub_types: &[TypeId],
) -> Vec<Vec<Pat>> {
    match pat {
        Pat::Wildcard => vec![vec![Pat::Wildcard; sub_types.len()]],
        Pat::Ctor { tag: t, subs, .. } if *t == tag => vec![subs.clone()],
        Pat::Ctor { .. } => Vec::new(),
        Pat::Lit(lit) => {
            // Bool literals double as constructors.
            let is_bool = matches!(arena.kind(arena.runtime_repr(col_ty)), TypeKind::Bool);
            match (is_bool, lit) {
                (true, Lit::Bool(b)) if i64::from(*b) == tag => vec![Vec::new()],
                _ => Vec::new(),
            }
        }
        Pat::Or(alts) => alts
            .iter()
            .flat_map(|a| specialize_pattern(arena, a, col_ty, tag, sub_types))
            .collect(),
    }
}

fn specialize_default(matrix: &Matrix) -> Matrix {
    let rows = matrix
        .rows
        .iter()
        .filter(|r| r.pats[0].is_wildcard())
        .map(|r| Row {
            pats: r.pats[1..].to_vec(),
            has_guard: r.has_guard,
        })
        .collect();
    Matrix {
        rows,
        col_types: matrix.col_types[1..].to_vec(),
    }
}

/// Convert a host pattern into normalized form against the subject type.
pub fn normalize(
    arena: &TypeArena,
    pattern: &AstPattern,
    subject_ty: TypeId,
) -> Result<Pat, CoreError> {
    let repr = arena.runtime_repr(subject_ty);
    match pattern {
        AstPattern::Wildcard { .. } | AstPattern::Binding { .. } => Ok(Pat::Wildcard),
        AstPattern::Value { expr, span } => normalize_value(arena, expr, repr, *span),
        AstPattern::Or { alts, .. } => {
            let alts = alts
                .iter()
                .map(|p| normalize(arena, p, subject_ty))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Pat::Or(alts))
        }
        AstPattern::Sequence { elems, span } => {
            normalize_sequence(arena, elems, repr, *span)
        }
        AstPattern::Struct { name: _, fields, span } => {
            let TypeKind::Struct { fields: def_fields, .. } = arena.kind(repr) else {
                return Err(CoreError::new(
                    ErrorKind::MatchPatternTypeMismatch,
                    format!(
                        "struct pattern against non-struct subject {}",
                        arena.display(subject_ty)
                    ),
                )
                .with_span(*span));
            };
            let def_fields = def_fields.clone();
            let positional = fields.iter().all(|(n, _)| n.is_none());
            let mut subs = vec![Pat::Wildcard; def_fields.len()];
            if positional {
                if fields.len() > def_fields.len() {
                    return Err(CoreError::new(
                        ErrorKind::MatchPatternTypeMismatch,
                        "struct pattern has more fields than the subject",
                    )
                    .with_span(*span));
                }
                for (i, (_, p)) in fields.iter().enumerate() {
                    subs[i] = normalize(arena, p, def_fields[i].ty)?;
                }
            } else {
                for (field_name, p) in fields {
                    let Some(name) = field_name else {
                        return Err(CoreError::new(
                            ErrorKind::MatchPatternTypeMismatch,
                            "cannot mix positional and keyword fields in one pattern",
                        )
                        .with_span(*span));
                    };
                    let Some(index) = def_fields
                        .iter()
                        .position(|f| f.name.as_deref() == Some(name.node.as_str()))
                    else {
                        return Err(CoreError::new(
                            ErrorKind::MatchPatternTypeMismatch,
                            format!("subject has no field '{}'", name.node),
                        )
                        .with_span(*span));
                    };
                    subs[index] = normalize(arena, p, def_fields[index].ty)?;
                }
            }
            Ok(Pat::Ctor {
                tag: 0,
                name: "struct".to_string(),
                subs,
            })
        }
    }
}

fn normalize_value(
    arena: &TypeArena,
    expr: &Expr,
    repr: TypeId,
    span: Span,
) -> Result<Pat, CoreError> {
    // `Enum.Variant` references become constructors.
    if let ExprKind::Attribute { base, attr } = &expr.kind {
        if let TypeKind::Enum { name, variants, .. } = arena.kind(repr) {
            if base.as_name() == Some(name.as_str()) {
                let Some(v) = variants.iter().find(|v| v.name == attr.node) else {
                    return Err(CoreError::new(
                        ErrorKind::MatchPatternTypeMismatch,
                        format!("enum '{name}' has no variant '{}'", attr.node),
                    )
                    .with_span(span));
                };
                return Ok(Pat::Ctor {
                    tag: v.tag,
                    name: format!("{name}.{}", v.name),
                    subs: Vec::new(),
                });
            }
        }
    }
    let lit = match &expr.kind {
        ExprKind::Int(v) => Lit::Int(*v),
        ExprKind::Bool(b) => Lit::Bool(*b),
        ExprKind::Str(s) => Lit::Str(s.clone()),
        ExprKind::Unary { op: pythoc_ast::UnaryOp::Neg, .. } => {
            Lit::Int(expr.as_int_lit().ok_or_else(|| {
                CoreError::new(
                    ErrorKind::MatchPatternTypeMismatch,
                    "pattern is not a compile-time literal",
                )
                .with_span(span)
            })?)
        }
        _ => {
            return Err(CoreError::new(
                ErrorKind::MatchPatternTypeMismatch,
                "pattern is not a compile-time literal",
            )
            .with_span(span))
        }
    };
    let kind = arena.kind(repr);
    let matches_ty = match (&lit, kind) {
        (Lit::Int(_), TypeKind::Int { .. }) => true,
        (Lit::Int(_), TypeKind::Enum { .. }) => true,
        (Lit::Bool(_), TypeKind::Bool) => true,
        (Lit::Str(_), _) => true,
        _ => false,
    };
    if !matches_ty {
        return Err(CoreError::new(
            ErrorKind::MatchPatternTypeMismatch,
            format!("literal pattern does not match subject type {}", arena.display(repr)),
        )
        .with_span(span));
    }
    // Integer literals over an enum subject select the variant by tag.
    if let (Lit::Int(v), TypeKind::Enum { name, variants, .. }) = (&lit, kind) {
        let Some(variant) = variants.iter().find(|var| i128::from(var.tag) == *v) else {
            return Err(CoreError::new(
                ErrorKind::MatchPatternTypeMismatch,
                format!("enum '{name}' has no variant with tag {v}"),
            )
            .with_span(span));
        };
        return Ok(Pat::Ctor {
            tag: variant.tag,
            name: format!("{name}.{}", variant.name),
            subs: Vec::new(),
        });
    }
    Ok(Pat::Lit(lit))
}

fn normalize_sequence(
    arena: &TypeArena,
    elems: &[AstPattern],
    repr: TypeId,
    span: Span,
) -> Result<Pat, CoreError> {
    // Enum decomposition: `(Status.Ok, payload)`.
    if let TypeKind::Enum { name, variants, .. } = arena.kind(repr) {
        let Some(AstPattern::Value { expr, .. }) = elems.first() else {
            return Err(CoreError::new(
                ErrorKind::MatchPatternTypeMismatch,
                format!("enum pattern over '{name}' must start with a variant"),
            )
            .with_span(span));
        };
        let head = normalize_value(arena, expr, repr, span)?;
        let Pat::Ctor { tag, name: ctor_name, .. } = head else {
            return Err(CoreError::new(
                ErrorKind::MatchPatternTypeMismatch,
                format!("enum pattern over '{name}' must start with a variant"),
            )
            .with_span(span));
        };
        let payload_ty = variants
            .iter()
            .find(|v| v.tag == tag)
            .and_then(|v| v.payload);
        let subs = match (payload_ty, elems.get(1)) {
            (Some(pt), Some(p)) => vec![normalize(arena, p, pt)?],
            (Some(_), None) => vec![Pat::Wildcard],
            (None, None) => Vec::new(),
            (None, Some(_)) => {
                return Err(CoreError::new(
                    ErrorKind::MatchPatternTypeMismatch,
                    format!("variant {ctor_name} carries no payload"),
                )
                .with_span(span))
            }
        };
        return Ok(Pat::Ctor {
            tag,
            name: ctor_name,
            subs,
        });
    }

    let sub_types: Vec<TypeId> = match arena.kind(repr) {
        TypeKind::Struct { fields, .. } => fields.iter().map(|f| f.ty).collect(),
        TypeKind::Array { elem, dims } => {
            let n: u64 = dims.iter().product();
            vec![*elem; n as usize]
        }
        _ => {
            return Err(CoreError::new(
                ErrorKind::MatchPatternTypeMismatch,
                format!(
                    "sequence pattern against non-composite subject {}",
                    arena.display(repr)
                ),
            )
            .with_span(span))
        }
    };
    if elems.len() != sub_types.len() {
        return Err(CoreError::new(
            ErrorKind::MatchPatternTypeMismatch,
            format!(
                "pattern has {} elements, subject has {}",
                elems.len(),
                sub_types.len()
            ),
        )
        .with_span(span));
    }
    let subs = elems
        .iter()
        .zip(&sub_types)
        .map(|(p, t)| normalize(arena, p, *t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Pat::Ctor {
        tag: 0,
        name: "tuple".to_string(),
        subs,
    })
}

/// Check a whole match statement. An unguarded catch-all short-circuits.
pub fn check_match(
    arena: &TypeArena,
    subject_ty: TypeId,
    arms: &[MatchArm],
    span: Span,
) -> Result<(), CoreError> {
    for arm in arms {
        if arm.guard.is_none()
            && matches!(
                arm.pattern,
                AstPattern::Wildcard { .. } | AstPattern::Binding { .. }
            )
        {
            return Ok(());
        }
    }

    let rows = arms
        .iter()
        .map(|arm| {
            Ok(Row {
                pats: vec![normalize(arena, &arm.pattern, subject_ty)?],
                has_guard: arm.guard.is_some(),
            })
        })
        .collect::<Result<Vec<_>, CoreError>>()?;
    let matrix = Matrix {
        rows,
        col_types: vec![subject_ty],
    };
    let (ok, uncovered) = is_exhaustive(arena, &matrix);
    if ok {
        return Ok(());
    }
    let mut message = "non-exhaustive match".to_string();
    if !uncovered.is_empty() {
        message.push_str(&format!("; uncovered: {}", uncovered.join(", ")));
    }
    if arms.iter().any(|a| a.guard.is_some()) {
        message.push_str(" (guards are treated as potentially false)");
    }
    Err(CoreError::new(ErrorKind::MatchNonExhaustive, message)
        .with_span(span)
        .with_witnesses(uncovered))
}

/// How a checked match should reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoweringStrategy {
    /// Dense unguarded integer dispatch.
    SwitchTable,
    /// Destructuring and guard evaluation in source arm order.
    IfChain,
}

/// A switch table needs a single integral subject and arms that are all
/// unguarded integer literals (or ORs of them); one trailing catch-all is
/// allowed as the default.
pub fn select_lowering(
    arena: &TypeArena,
    subject_ty: TypeId,
    arms: &[MatchArm],
) -> LoweringStrategy {
    if !arena.is_integral(subject_ty) {
        return LoweringStrategy::IfChain;
    }
    for (i, arm) in arms.iter().enumerate() {
        if arm.guard.is_some() {
            return LoweringStrategy::IfChain;
        }
        let last = i + 1 == arms.len();
        if !pattern_is_int_literals(&arm.pattern)
            && !(last
                && matches!(
                    arm.pattern,
                    AstPattern::Wildcard { .. } | AstPattern::Binding { .. }
                ))
        {
            return LoweringStrategy::IfChain;
        }
    }
    LoweringStrategy::SwitchTable
}

fn pattern_is_int_literals(pattern: &AstPattern) -> bool {
    match pattern {
        AstPattern::Value { expr, .. } => expr.as_int_lit().is_some(),
        AstPattern::Or { alts, .. } => alts.iter().all(pattern_is_int_literals),
        _ => false,
    }
}
