use pythoc_ast::{ident, Decorator, Expr, FuncDef, Param, Span, Stmt, TypeExpr, Unit};
use pythoc_core::effects::EffectEnv;
use pythoc_core::inline::InlineKernel;
use pythoc_core::{Checker, CoreError, ErrorKind, Registry, TypeArena};

fn check_unit(unit: &Unit) -> Result<(), CoreError> {
    let mut arena = TypeArena::new();
    let mut registry = Registry::new();
    let mut effects = EffectEnv::new();
    let mut kernel = InlineKernel::new();
    let mut checker = Checker::new(&mut arena, &mut registry, &mut effects, &mut kernel);
    let keys = checker.register_unit(unit)?;
    for key in keys {
        checker.check_function(&key)?;
    }
    Ok(())
}

fn void_fn(name: &str, body: Vec<Stmt>) -> FuncDef {
    FuncDef {
        span: Span::default(),
        name: ident(name),
        decorators: vec![Decorator::Compile { suffix: None }],
        params: vec![],
        ret: None,
        body,
    }
}

fn consume(name: &str) -> Stmt {
    Stmt::expr(Expr::call_named("consume", vec![Expr::name(name)]))
}

fn make_linear(name: &str) -> Stmt {
    Stmt::assign_name(name, Expr::call_named("linear", vec![]))
}

#[test]
fn token_created_and_consumed_compiles() {
    let mut unit = Unit::new("ok");
    unit.funcs
        .push(void_fn("release", vec![make_linear("t"), consume("t")]));
    check_unit(&unit).unwrap();
}

#[test]
fn leaked_token_is_rejected_at_exit() {
    let mut unit = Unit::new("leak");
    unit.funcs.push(void_fn("leak", vec![make_linear("t")]));
    let err = check_unit(&unit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinearExitNotConsumed);
}

#[test]
fn branch_asymmetry_is_rejected_at_the_join() {
    let mut unit = Unit::new("branchy");
    unit.funcs.push(FuncDef {
        params: vec![Param {
            span: Span::default(),
            name: ident("cond"),
            annotation: Some(TypeExpr::name("bool")),
        }],
        ..void_fn(
            "half",
            vec![
                make_linear("t"),
                Stmt::if_(Expr::name("cond"), vec![consume("t")], vec![]),
            ],
        )
    });
    let err = check_unit(&unit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinearInconsistentMerge);
}

#[test]
fn move_between_functions_transfers_ownership() {
    // take() consumes its argument; give() creates and returns a token.
    let mut unit = Unit::new("transfer");
    unit.funcs.push(FuncDef {
        span: Span::default(),
        name: ident("take"),
        decorators: vec![Decorator::Compile { suffix: None }],
        params: vec![Param {
            span: Span::default(),
            name: ident("t"),
            annotation: Some(TypeExpr::linear()),
        }],
        ret: None,
        body: vec![consume("t")],
    });
    unit.funcs.push(FuncDef {
        span: Span::default(),
        name: ident("give"),
        decorators: vec![Decorator::Compile { suffix: None }],
        params: vec![],
        ret: Some(TypeExpr::linear()),
        body: vec![make_linear("t"), Stmt::ret(Some(Expr::name("t")))],
    });
    unit.funcs.push(void_fn(
        "round_trip",
        vec![
            Stmt::assign_name("t", Expr::call_named("give", vec![])),
            Stmt::expr(Expr::call_named("take", vec![Expr::name("t")])),
        ],
    ));
    check_unit(&unit).unwrap();
}

#[test]
fn defer_releases_token_on_every_exit_path() {
    let mut unit = Unit::new("deferred");
    unit.funcs.push(FuncDef {
        span: Span::default(),
        name: ident("release"),
        decorators: vec![Decorator::Compile { suffix: None }],
        params: vec![Param {
            span: Span::default(),
            name: ident("t"),
            annotation: Some(TypeExpr::linear()),
        }],
        ret: None,
        body: vec![consume("t")],
    });
    unit.funcs.push(FuncDef {
        params: vec![Param {
            span: Span::default(),
            name: ident("cond"),
            annotation: Some(TypeExpr::name("bool")),
        }],
        ..void_fn(
            "guarded",
            vec![
                make_linear("t"),
                Stmt::expr(Expr::call_named(
                    "defer",
                    vec![Expr::name("release"), Expr::name("t")],
                )),
                Stmt::if_(Expr::name("cond"), vec![Stmt::ret(None)], vec![]),
            ],
        )
    });
    check_unit(&unit).unwrap();
}

#[test]
fn consuming_a_deferred_token_is_a_double_use() {
    let mut unit = Unit::new("double");
    unit.funcs.push(void_fn(
        "broken",
        vec![
            make_linear("t"),
            Stmt::expr(Expr::call_named(
                "defer",
                vec![Expr::name("sink"), Expr::name("t")],
            )),
            consume("t"),
        ],
    ));
    let err = check_unit(&unit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinearUseAfterConsume);
}

#[test]
fn generator_loop_with_break_keeps_tokens_balanced() {
    // A generator yielding indices; the caller breaks after consuming one
    // token per iteration. Defers registered in the loop body replay on
    // the break edge.
    let mut unit = Unit::new("genbrk");
    unit.funcs.push(FuncDef {
        span: Span::default(),
        name: ident("firsts"),
        decorators: vec![Decorator::Compile { suffix: None }],
        params: vec![],
        ret: Some(TypeExpr::name("i32")),
        body: vec![
            Stmt::yield_(Expr::int(0)),
            Stmt::yield_(Expr::int(1)),
            Stmt::yield_(Expr::int(2)),
        ],
    });
    unit.funcs.push(void_fn(
        "consume_one",
        vec![Stmt::for_(
            Expr::name("x"),
            Expr::call_named("firsts", vec![]),
            vec![
                make_linear("t"),
                consume("t"),
                Stmt::if_(
                    Expr::compare(Expr::name("x"), pythoc_ast::CmpOp::Eq, Expr::int(1)),
                    vec![Stmt::break_()],
                    vec![],
                ),
            ],
        )],
    ));
    check_unit(&unit).unwrap();
}
