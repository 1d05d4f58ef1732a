//! Refinement types: construction, conversion, and the for-else lowering of
//! `refine`.
//!
//! A refined type is its base plus a set of runtime-checkable predicates and
//! a set of proof tags. `assume` (and the type-call form) construct without
//! a check; `refine` compiles to a predicate conjunction guarding a single
//! yield, with the `for`-`else` branch taken on failure.

use std::collections::BTreeSet;

use pythoc_ast::{BinOp, Expr, Stmt};

use crate::error::{CoreError, ErrorKind};
use crate::types::{Field, PredRef, TypeArena, TypeId, TypeKind};

/// A resolved predicate signature: name plus parameter list.
#[derive(Clone, Debug)]
pub struct PredicateSig {
    pub name: String,
    pub params: Vec<(String, TypeId)>,
}

impl PredicateSig {
    fn as_ref(&self) -> PredRef {
        PredRef {
            name: self.name.clone(),
            arity: self.params.len(),
        }
    }
}

/// Build a refined type from annotation parts. With no explicit base the
/// predicate signature decides the shape: a unary predicate refines its
/// parameter type in place, an N-ary predicate induces a struct whose
/// fields are named after the predicate parameters.
pub fn refined_type(
    arena: &mut TypeArena,
    base: Option<TypeId>,
    preds: &[PredicateSig],
    tags: &[String],
) -> Result<TypeId, CoreError> {
    let tag_set: BTreeSet<String> = tags.iter().cloned().collect();
    let base = match base {
        Some(b) => b,
        None => {
            let Some(first) = preds.first() else {
                return Err(CoreError::new(
                    ErrorKind::TypeShapeInvalid,
                    "refined[] needs a base type or at least one predicate",
                ));
            };
            if first.params.len() == 1 {
                first.params[0].1
            } else {
                let fields = first
                    .params
                    .iter()
                    .map(|(name, ty)| Field::named(name, *ty))
                    .collect();
                arena.struct_type(None, fields)?
            }
        }
    };
    arena.refined(base, preds.iter().map(PredicateSig::as_ref).collect(), tag_set)
}

/// Conversion legality between two types where refinement is involved.
///
/// - refined -> base: always allowed (forget).
/// - base -> refined: forbidden; `assume`/`refine` are the only doors in.
/// - refined -> refined: destination tags and predicates must both be
///   subsets of the source's.
pub fn check_conversion(
    arena: &TypeArena,
    from: TypeId,
    to: TypeId,
) -> Result<(), CoreError> {
    if from == to {
        return Ok(());
    }
    match (arena.kind(from), arena.kind(to)) {
        (
            TypeKind::Refined { preds: from_preds, tags: from_tags, .. },
            TypeKind::Refined { preds: to_preds, tags: to_tags, .. },
        ) => {
            if !to_tags.is_subset(from_tags) {
                let missing: Vec<String> = to_tags.difference(from_tags).cloned().collect();
                return Err(CoreError::new(
                    ErrorKind::RefineTagNotSubset,
                    format!(
                        "conversion to {} requires tags not proven here: {}",
                        arena.display(to),
                        missing.join(", ")
                    ),
                )
                .with_witnesses(missing));
            }
            let from_names: BTreeSet<&str> =
                from_preds.iter().map(|p| p.name.as_str()).collect();
            let missing: Vec<String> = to_preds
                .iter()
                .filter(|p| !from_names.contains(p.name.as_str()))
                .map(|p| p.name.clone())
                .collect();
            if !missing.is_empty() {
                return Err(CoreError::new(
                    ErrorKind::RefineTagNotSubset,
                    format!(
                        "conversion to {} requires predicates not established here: {}",
                        arena.display(to),
                        missing.join(", ")
                    ),
                )
                .with_witnesses(missing));
            }
            Ok(())
        }
        (TypeKind::Refined { .. }, _) => {
            if arena.runtime_repr(from) == arena.runtime_repr(to) {
                Ok(())
            } else {
                Err(CoreError::new(
                    ErrorKind::TypeMismatch,
                    format!(
                        "cannot forget {} into unrelated {}",
                        arena.display(from),
                        arena.display(to)
                    ),
                ))
            }
        }
        (_, TypeKind::Refined { .. }) => Err(CoreError::new(
            ErrorKind::RefineBaseToRefined,
            format!(
                "cannot convert {} to {} without assume() or refine()",
                arena.display(from),
                arena.display(to)
            ),
        )),
        _ => Ok(()),
    }
}

/// Lower `for target in refine(values..., preds...): body else: else_body`.
///
/// The expansion yields at most once: the body runs iff every predicate
/// returns true, the else branch runs on failure. `break` leaves the whole
/// expansion, `continue` skips the rest of the body.
pub fn lower_refine_for(
    target: &Expr,
    values: &[Expr],
    preds: &[String],
    body: Vec<Stmt>,
    else_body: Vec<Stmt>,
    fresh_id: u64,
) -> Result<Vec<Stmt>, CoreError> {
    if values.is_empty() || preds.is_empty() {
        return Err(CoreError::new(
            ErrorKind::TypeShapeInvalid,
            "refine() requires at least one value and one predicate",
        ));
    }
    if target.as_name().is_none() {
        return Err(CoreError::new(
            ErrorKind::TypeMismatch,
            "refine loop target must be a single name",
        ));
    }

    let break_label = format!("__refine_break_{fresh_id}");
    let continue_label = format!("__refine_continue_{fresh_id}");

    let mut guard: Option<Expr> = None;
    for pred in preds {
        let call = Expr::call_named(pred, values.to_vec());
        guard = Some(match guard {
            None => call,
            Some(g) => Expr::binary(g, BinOp::And, call),
        });
    }
    let guard = guard.expect("at least one predicate");

    // The target is an unchecked construction: the guard just proved every
    // predicate.
    let mut assume_args = values.to_vec();
    assume_args.extend(preds.iter().map(|p| Expr::name(p)));
    let bind = Stmt::assign(target.clone(), Expr::call_named("assume", assume_args));

    let mut then_body = vec![bind];
    let mut inner = body;
    retarget(&mut inner, &break_label, &continue_label);
    then_body.push(Stmt::with_(
        Expr::call_named("label", vec![Expr::str_(&continue_label)]),
        inner,
    ));

    Ok(vec![Stmt::with_(
        Expr::call_named("label", vec![Expr::str_(&break_label)]),
        vec![Stmt::if_(guard, then_body, else_body)],
    )])
}

fn retarget(body: &mut [Stmt], break_label: &str, continue_label: &str) {
    use pythoc_ast::StmtKind;
    for stmt in body {
        match &mut stmt.kind {
            StmtKind::Break => {
                *stmt = Stmt::expr(Expr::call_named(
                    "goto_end",
                    vec![Expr::str_(break_label)],
                ));
            }
            StmtKind::Continue => {
                *stmt = Stmt::expr(Expr::call_named(
                    "goto_end",
                    vec![Expr::str_(continue_label)],
                ));
            }
            StmtKind::If { then_body, else_body, .. } => {
                retarget(then_body, break_label, continue_label);
                retarget(else_body, break_label, continue_label);
            }
            StmtKind::With { body, .. } => retarget(body, break_label, continue_label),
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    retarget(&mut arm.body, break_label, continue_label);
                }
            }
            StmtKind::While { .. } | StmtKind::For { .. } => {}
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pythoc_ast::StmtKind;

    fn sig(name: &str, params: &[(&str, TypeId)]) -> PredicateSig {
        PredicateSig {
            name: name.to_string(),
            params: params.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
        }
    }

    #[test]
    fn predicate_only_form_infers_base() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let t = refined_type(&mut arena, None, &[sig("is_positive", &[("v", i32_)])], &[])
            .unwrap();
        assert_eq!(arena.runtime_repr(t), i32_);
    }

    #[test]
    fn multi_param_predicate_builds_struct_shape() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let t = refined_type(
            &mut arena,
            None,
            &[sig("ordered", &[("lo", i32_), ("hi", i32_)])],
            &[],
        )
        .unwrap();
        let repr = arena.runtime_repr(t);
        let TypeKind::Struct { fields, .. } = arena.kind(repr) else {
            panic!("expected struct repr");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name.as_deref(), Some("lo"));
    }

    #[test]
    fn refined_to_base_forgets() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let t = refined_type(
            &mut arena,
            Some(i32_),
            &[sig("is_positive", &[("v", i32_)])],
            &["Pos".into()],
        )
        .unwrap();
        check_conversion(&arena, t, i32_).unwrap();
    }

    #[test]
    fn base_to_refined_rejected() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let t = refined_type(&mut arena, Some(i32_), &[], &["Pos".into()]).unwrap();
        let err = check_conversion(&arena, i32_, t).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefineBaseToRefined);
    }

    #[test]
    fn refined_to_refined_requires_subset_both_ways() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let wide = refined_type(
            &mut arena,
            Some(i32_),
            &[
                sig("is_positive", &[("v", i32_)]),
                sig("is_even", &[("v", i32_)]),
            ],
            &["Pos".into(), "Even".into()],
        )
        .unwrap();
        let narrow = refined_type(
            &mut arena,
            Some(i32_),
            &[sig("is_positive", &[("v", i32_)])],
            &["Pos".into()],
        )
        .unwrap();

        // Dropping predicates and tags is fine.
        check_conversion(&arena, wide, narrow).unwrap();
        // Gaining them is not.
        let err = check_conversion(&arena, narrow, wide).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefineTagNotSubset);
    }

    #[test]
    fn tag_superset_rejected_even_with_same_predicates() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let preds = [sig("is_positive", &[("v", i32_)])];
        let untagged = refined_type(&mut arena, Some(i32_), &preds, &[]).unwrap();
        let tagged = refined_type(&mut arena, Some(i32_), &preds, &["Checked".into()]).unwrap();
        let err = check_conversion(&arena, untagged, tagged).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefineTagNotSubset);
        assert_eq!(err.witnesses, vec!["Checked"]);
    }

    #[test]
    fn refine_for_lowers_to_guarded_single_yield() {
        let stmts = lower_refine_for(
            &Expr::name("x"),
            &[Expr::int(5)],
            &["is_positive".to_string()],
            vec![Stmt::ret(Some(Expr::name("x")))],
            vec![Stmt::ret(Some(Expr::int(-1)))],
            0,
        )
        .unwrap();

        assert_eq!(stmts.len(), 1);
        let StmtKind::With { body, .. } = &stmts[0].kind else {
            panic!("expected break label scope");
        };
        let StmtKind::If { cond, then_body, else_body } = &body[0].kind else {
            panic!("expected guard");
        };
        assert_eq!(cond.as_direct_call().unwrap().0, "is_positive");
        // bind via assume, then the labelled body.
        let StmtKind::Assign { value, .. } = &then_body[0].kind else {
            panic!("expected assume binding");
        };
        assert_eq!(value.as_direct_call().unwrap().0, "assume");
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn multiple_predicates_conjoin() {
        let stmts = lower_refine_for(
            &Expr::name("x"),
            &[Expr::name("v")],
            &["is_positive".to_string(), "is_even".to_string()],
            vec![Stmt::pass()],
            vec![],
            1,
        )
        .unwrap();
        let StmtKind::With { body, .. } = &stmts[0].kind else {
            panic!("expected label scope");
        };
        let StmtKind::If { cond, .. } = &body[0].kind else {
            panic!("expected guard");
        };
        assert!(matches!(
            cond.kind,
            pythoc_ast::ExprKind::Binary { op: BinOp::And, .. }
        ));
    }

    #[test]
    fn refine_without_predicates_rejected() {
        let err = lower_refine_for(
            &Expr::name("x"),
            &[Expr::int(1)],
            &[],
            vec![],
            vec![],
            2,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeShapeInvalid);
    }
}
