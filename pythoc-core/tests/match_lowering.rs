use pythoc_ast::{ident, Decorator, Expr, FieldDef, MatchArm, Param, Pattern, Span, Stmt, StmtKind, TypeExpr, Unit};
use pythoc_core::effects::EffectEnv;
use pythoc_core::inline::InlineKernel;
use pythoc_core::{Checker, ErrorKind, Registry, TypeArena};

struct Pipeline {
    arena: TypeArena,
    registry: Registry,
    effects: EffectEnv,
    kernel: InlineKernel,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            arena: TypeArena::new(),
            registry: Registry::new(),
            effects: EffectEnv::new(),
            kernel: InlineKernel::new(),
        }
    }

    fn check(&mut self, unit: &Unit) -> Result<(), pythoc_core::CoreError> {
        let mut checker = Checker::new(
            &mut self.arena,
            &mut self.registry,
            &mut self.effects,
            &mut self.kernel,
        );
        let keys = checker.register_unit(unit)?;
        for key in keys {
            checker.check_function(&key)?;
        }
        Ok(())
    }
}

fn match_fn(param_ty: &str, arms: Vec<MatchArm>) -> Unit {
    let mut unit = Unit::new("m");
    unit.funcs.push(pythoc_ast::FuncDef {
        span: Span::default(),
        name: ident("classify"),
        decorators: vec![Decorator::Compile { suffix: None }],
        params: vec![Param {
            span: Span::default(),
            name: ident("v"),
            annotation: Some(TypeExpr::name(param_ty)),
        }],
        ret: Some(TypeExpr::name("i32")),
        body: vec![
            Stmt {
                span: Span::default(),
                kind: StmtKind::Match {
                    subject: Expr::name("v"),
                    arms,
                },
            },
            Stmt::ret(Some(Expr::int(0))),
        ],
    });
    unit
}

#[test]
fn bool_match_with_both_arms_compiles() {
    let mut p = Pipeline::new();
    let unit = match_fn(
        "bool",
        vec![
            MatchArm::new(Pattern::bool_(true), vec![Stmt::ret(Some(Expr::int(1)))]),
            MatchArm::new(Pattern::bool_(false), vec![Stmt::ret(Some(Expr::int(2)))]),
        ],
    );
    p.check(&unit).unwrap();
}

#[test]
fn bool_match_missing_arm_is_rejected() {
    let mut p = Pipeline::new();
    let unit = match_fn(
        "bool",
        vec![MatchArm::new(
            Pattern::bool_(true),
            vec![Stmt::ret(Some(Expr::int(1)))],
        )],
    );
    let err = p.check(&unit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MatchNonExhaustive);
    assert_eq!(err.witnesses, vec!["False"]);
}

#[test]
fn enum_match_over_all_variants_compiles() {
    let mut p = Pipeline::new();
    let mut unit = match_fn(
        "Shape",
        vec![
            MatchArm::new(
                Pattern::sequence(vec![
                    Pattern::value(Expr::attr(Expr::name("Shape"), "Circle")),
                    Pattern::binding("r"),
                ]),
                vec![Stmt::ret(Some(Expr::name("r")))],
            ),
            MatchArm::new(
                Pattern::value(Expr::attr(Expr::name("Shape"), "Point")),
                vec![Stmt::ret(Some(Expr::int(0)))],
            ),
        ],
    );
    unit.classes.push(pythoc_ast::ClassDef {
        span: Span::default(),
        name: ident("Shape"),
        decorators: vec![Decorator::Enum { tag_type: None }],
        fields: vec![
            FieldDef {
                span: Span::default(),
                name: Some(ident("Circle")),
                annotation: Some(TypeExpr::name("i32")),
                tag_value: None,
            },
            FieldDef {
                span: Span::default(),
                name: Some(ident("Point")),
                annotation: None,
                tag_value: None,
            },
        ],
    });
    p.check(&unit).unwrap();
}

#[test]
fn guarded_arms_do_not_count_toward_coverage() {
    let mut p = Pipeline::new();
    let unit = match_fn(
        "bool",
        vec![
            MatchArm::new(Pattern::bool_(true), vec![Stmt::ret(Some(Expr::int(1)))]),
            MatchArm::guarded(
                Pattern::bool_(false),
                Expr::name("v"),
                vec![Stmt::ret(Some(Expr::int(2)))],
            ),
        ],
    );
    let err = p.check(&unit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MatchNonExhaustive);
}

#[test]
fn int_match_needs_catch_all_even_when_dense() {
    let mut p = Pipeline::new();
    let unit = match_fn(
        "i32",
        vec![
            MatchArm::new(Pattern::int(0), vec![Stmt::ret(Some(Expr::int(10)))]),
            MatchArm::new(Pattern::int(1), vec![Stmt::ret(Some(Expr::int(11)))]),
            MatchArm::new(Pattern::int(2), vec![Stmt::ret(Some(Expr::int(12)))]),
        ],
    );
    let err = p.check(&unit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MatchNonExhaustive);

    let unit = match_fn(
        "i32",
        vec![
            MatchArm::new(Pattern::int(0), vec![Stmt::ret(Some(Expr::int(10)))]),
            MatchArm::new(Pattern::wildcard(), vec![Stmt::ret(Some(Expr::int(99)))]),
        ],
    );
    p.check(&unit).unwrap();
}
