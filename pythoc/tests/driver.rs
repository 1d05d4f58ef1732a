use pythoc::{extern_group, Session};
use pythoc_ast::{ident, Decorator, Expr, FuncDef, Param, Span, Stmt, TypeExpr, Unit};
use pythoc_core::effects::EffectImpl;
use pythoc_core::ErrorKind;

fn func(name: &str, params: &[(&str, &str)], ret: &str, body: Vec<Stmt>) -> FuncDef {
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

fn effect_call(name: &str) -> Expr {
    Expr::call(Expr::attr(Expr::name("effect"), name), vec![])
}

/// f calls g; g reads effect.rng.
fn rng_unit() -> Unit {
    let mut unit = Unit::new("rng_demo");
    unit.funcs.push(func(
        "std_rng",
        &[],
        "i32",
        vec![Stmt::ret(Some(Expr::int(4)))],
    ));
    unit.funcs.push(func(
        "mock_rng",
        &[],
        "i32",
        vec![Stmt::ret(Some(Expr::int(7)))],
    ));
    unit.funcs.push(func(
        "g",
        &[],
        "i32",
        vec![Stmt::ret(Some(effect_call("rng")))],
    ));
    unit.funcs.push(func(
        "f",
        &[],
        "i32",
        vec![Stmt::ret(Some(Expr::call_named("g", vec![])))],
    ));
    unit.top_stmts.push(Stmt::expr(Expr::call_kw(
        Expr::attr(Expr::name("effect"), "default"),
        vec![],
        vec![(ident("rng"), Expr::name("std_rng"))],
    )));
    unit
}

#[test]
fn s5_effect_suffix_propagates_to_transitive_callees() {
    let mut session = Session::new();
    session.add_unit(&rng_unit()).unwrap();
    session.compile_all().unwrap();

    session
        .push_effect_override(
            Some("mock"),
            vec![("rng".to_string(), EffectImpl::Func("mock_rng".to_string()))],
        )
        .unwrap();
    let symbol = session.compile_function("f").unwrap();
    session.pop_effect_override().unwrap();
    assert_eq!(symbol, "f__mock");

    let symbols = session.emitted_symbols();
    for expected in ["f", "g", "f__mock", "g__mock"] {
        assert!(symbols.contains(&expected.to_string()), "missing {expected}");
    }

    let ir = session.emit_llvm_ir().unwrap();
    // Base f is unchanged and calls base g.
    let base_f = ir
        .split("define i32 @f(")
        .nth(1)
        .and_then(|s| s.split("\n}").next())
        .expect("base f body");
    assert!(base_f.contains("call i32 @g()"));
    // The variant calls the variant, which calls the mock implementation.
    let variant_f = ir
        .split("define i32 @f__mock(")
        .nth(1)
        .and_then(|s| s.split("\n}").next())
        .expect("variant f body");
    assert!(variant_f.contains("call i32 @g__mock()"));
    let variant_g = ir
        .split("define i32 @g__mock(")
        .nth(1)
        .and_then(|s| s.split("\n}").next())
        .expect("variant g body");
    assert!(variant_g.contains("call i32 @mock_rng()"));
}

#[test]
fn variant_cache_emits_each_triple_once() {
    let mut session = Session::new();
    session.add_unit(&rng_unit()).unwrap();
    session.compile_all().unwrap();

    session
        .push_effect_override(
            Some("mock"),
            vec![("rng".to_string(), EffectImpl::Func("mock_rng".to_string()))],
        )
        .unwrap();
    let first = session.compile_function("f").unwrap();
    let second = session.compile_function("f").unwrap();
    session.pop_effect_override().unwrap();
    assert_eq!(first, second);

    let mock_entries = session
        .manifest()
        .symbols
        .iter()
        .filter(|s| s.symbol == "f__mock")
        .count();
    assert_eq!(mock_entries, 1);
}

#[test]
fn adding_a_compiled_symbol_again_collides() {
    let mut session = Session::new();
    let mut unit = Unit::new("one");
    unit.funcs.push(func("only", &[], "i32", vec![Stmt::ret(Some(Expr::int(1)))]));
    session.add_unit(&unit).unwrap();
    session.compile_all().unwrap();

    let err = session.add_unit(&unit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VariantCollision);
}

#[test]
fn mutually_recursive_effect_variants_cycle() {
    let mut unit = Unit::new("cycle");
    unit.funcs.push(func(
        "ping",
        &[],
        "i32",
        vec![Stmt::ret(Some(Expr::binary(
            Expr::call_named("pong", vec![]),
            pythoc_ast::BinOp::Add,
            effect_call("rng"),
        )))],
    ));
    unit.funcs.push(func(
        "pong",
        &[],
        "i32",
        vec![Stmt::ret(Some(Expr::call_named("ping", vec![])))],
    ));
    unit.funcs.push(func(
        "std_rng",
        &[],
        "i32",
        vec![Stmt::ret(Some(Expr::int(4)))],
    ));
    unit.top_stmts.push(Stmt::expr(Expr::call_kw(
        Expr::attr(Expr::name("effect"), "default"),
        vec![],
        vec![(ident("rng"), Expr::name("std_rng"))],
    )));

    let mut session = Session::new();
    session.add_unit(&unit).unwrap();
    session.compile_all().unwrap();

    session
        .push_effect_override(
            Some("mock"),
            vec![("rng".to_string(), EffectImpl::Func("std_rng".to_string()))],
        )
        .unwrap();
    let err = session.compile_function("ping").unwrap_err();
    session.pop_effect_override().unwrap();
    assert_eq!(err.kind(), ErrorKind::CompileCycle);
}

#[test]
fn s3_defers_replay_in_fifo_order_before_return() {
    let mut session = Session::new();
    session
        .add_unit(&extern_group(
            "log",
            vec![
                FuncDef {
                    span: Span::default(),
                    name: ident("log_a"),
                    decorators: vec![],
                    params: vec![],
                    ret: None,
                    body: vec![Stmt::pass()],
                },
                FuncDef {
                    span: Span::default(),
                    name: ident("log_b"),
                    decorators: vec![],
                    params: vec![],
                    ret: None,
                    body: vec![Stmt::pass()],
                },
            ],
        ))
        .unwrap();

    let mut unit = Unit::new("defers");
    unit.funcs.push(func(
        "tidy",
        &[],
        "void",
        vec![
            Stmt::expr(Expr::call_named("defer", vec![Expr::name("log_a")])),
            Stmt::expr(Expr::call_named("defer", vec![Expr::name("log_b")])),
            Stmt::ret(None),
        ],
    ));
    session.add_unit(&unit).unwrap();
    session.compile_all().unwrap();

    let ir = session.emit_llvm_ir().unwrap();
    let body = ir
        .split("define void @tidy(")
        .nth(1)
        .and_then(|s| s.split("\n}").next())
        .expect("tidy body");
    let a = body.find("call void @log_a()").expect("log_a call");
    let b = body.find("call void @log_b()").expect("log_b call");
    assert!(a < b, "defers must execute first-registered-first");
    assert!(ir.contains("declare void @log_a()"));
}

#[test]
fn s8_refine_success_and_failure_paths() {
    let mut unit = Unit::new("refine_demo");
    unit.funcs.push(func(
        "is_positive",
        &[("v", "i32")],
        "bool",
        vec![Stmt::ret(Some(Expr::compare(
            Expr::name("v"),
            pythoc_ast::CmpOp::Gt,
            Expr::int(0),
        )))],
    ));
    unit.funcs.push(func(
        "pick",
        &[("v", "i32")],
        "i32",
        vec![
            Stmt {
                span: Span::default(),
                kind: pythoc_ast::StmtKind::For {
                    target: Expr::name("x"),
                    iter: Expr::call_named(
                        "refine",
                        vec![Expr::name("v"), Expr::name("is_positive")],
                    ),
                    body: vec![Stmt::ret(Some(Expr::name("x")))],
                    else_body: vec![Stmt::ret(Some(Expr::int(-1)))],
                },
            },
        ],
    ));

    let mut session = Session::new();
    session.add_unit(&unit).unwrap();
    session.compile_all().unwrap();

    let ir = session.emit_llvm_ir().unwrap();
    let body = ir
        .split("define i32 @pick(")
        .nth(1)
        .and_then(|s| s.split("\n}").next())
        .expect("pick body");
    // Guarded by the predicate, with both the success and else returns.
    assert!(body.contains("call i1 @is_positive"));
    assert!(body.contains("ret i32 -1"));
}

#[test]
fn manifest_records_suffix_components() {
    let mut session = Session::new();
    session.add_unit(&rng_unit()).unwrap();
    session.compile_all().unwrap();
    session
        .push_effect_override(
            Some("mock"),
            vec![("rng".to_string(), EffectImpl::Func("mock_rng".to_string()))],
        )
        .unwrap();
    session.compile_function("g").unwrap();
    session.pop_effect_override().unwrap();

    let entry = session
        .manifest()
        .symbols
        .iter()
        .find(|s| s.symbol == "g__mock")
        .expect("variant in manifest");
    assert_eq!(entry.name, "g");
    assert_eq!(entry.compile_suffix, "");
    assert_eq!(entry.effect_suffix, "mock");

    let json = serde_json::to_string(session.manifest()).unwrap();
    assert!(json.contains("\"symbol\":\"g__mock\""));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    std::fs::write(&path, &json).unwrap();
    assert!(std::fs::read_to_string(&path).unwrap().contains("g__mock"));
}

#[test]
fn compiling_under_active_override_registers_suffixed_units() {
    // Import interception: a unit added inside a `with effect` scope
    // compiles directly into its suffix variants.
    let mut session = Session::new();
    let mut lib = Unit::new("lib");
    lib.funcs.push(func(
        "std_rng",
        &[],
        "i32",
        vec![Stmt::ret(Some(Expr::int(4)))],
    ));
    lib.top_stmts.push(Stmt::expr(Expr::call_kw(
        Expr::attr(Expr::name("effect"), "default"),
        vec![],
        vec![(ident("rng"), Expr::name("std_rng"))],
    )));
    session.add_unit(&lib).unwrap();
    session.compile_all().unwrap();

    session
        .push_effect_override(
            Some("fast"),
            vec![("rng".to_string(), EffectImpl::Func("std_rng".to_string()))],
        )
        .unwrap();
    let mut imported = Unit::new("imported");
    imported.funcs.push(func(
        "h",
        &[],
        "i32",
        vec![Stmt::ret(Some(effect_call("rng")))],
    ));
    session.add_unit(&imported).unwrap();
    session.compile_all().unwrap();
    session.pop_effect_override().unwrap();

    assert!(session.emitted_symbols().contains(&"h__fast".to_string()));
}
