use std::sync::Arc;

use noodle::{
    CallTarget, Diagnostic, DiagnosticKind, Engine, EngineBuilder, EngineConfig, Instruction,
    NoodleError, Primitive, ThreadState,
};

fn build(builder: EngineBuilder) -> Arc<Engine> {
    Arc::new(builder.build().expect("engine should build"))
}

fn engine() -> Arc<Engine> {
    build(Engine::builder().with_prelude())
}

fn eval_with(engine: &Arc<Engine>, source: &str) -> Primitive {
    let program = Arc::new(engine.compile("test", source).expect("compilation should succeed"));
    let mut thread = engine
        .create_thread(&program, None, Vec::new())
        .expect("thread should start");
    thread.run().expect("execution should succeed")
}

fn eval(source: &str) -> Primitive {
    eval_with(&engine(), source)
}

fn diagnostic(err: NoodleError) -> Diagnostic {
    match err {
        NoodleError::Diagnostic(diagnostic) => diagnostic,
        other => panic!("expected a diagnostic, received {other}"),
    }
}

fn compile_error(source: &str) -> Diagnostic {
    match engine().compile("test", source) {
        Ok(program) => panic!("expected compile error, got:\n{}", program.disassemble()),
        Err(err) => diagnostic(err),
    }
}

fn run_error(source: &str) -> Diagnostic {
    let engine = engine();
    let program = Arc::new(engine.compile("test", source).expect("compilation should succeed"));
    let mut thread = engine
        .create_thread(&program, None, Vec::new())
        .expect("thread should start");
    match thread.run() {
        Ok(value) => panic!("expected runtime error, received value {value}"),
        Err(err) => diagnostic(err),
    }
}

fn expect_number(value: &Primitive) -> f64 {
    match value {
        Primitive::Number(n) => *n,
        other => panic!("expected Number, found {}", other.type_name()),
    }
}

fn expect_string(value: &Primitive) -> String {
    match value {
        Primitive::String(text) => text.to_string(),
        other => panic!("expected String, found {}", other.type_name()),
    }
}

#[test]
fn evaluates_arithmetic_with_precedence() {
    assert_eq!(eval("return 1 + 2 * 3;"), Primitive::Number(7.0));
    assert_eq!(eval("return (1 + 2) * 3;"), Primitive::Number(9.0));
    assert_eq!(eval("return 10 - 4 - 3;"), Primitive::Number(3.0));
    assert_eq!(eval("return -2 * 3 + 7 % 4;"), Primitive::Number(-3.0));
    assert_eq!(eval("return 1 << 4 | 3;"), Primitive::Number(19.0));
}

#[test]
fn defined_follows_registrations_at_preprocessing_time() {
    let source = "if (defined(FOO)) return 1; else return 0;";
    assert_eq!(eval(source), Primitive::Number(0.0));

    let with_builtin = build(
        Engine::builder().register_builtin("FOO", 0, |_ctx, _args| Ok(Primitive::Null)),
    );
    assert_eq!(eval_with(&with_builtin, source), Primitive::Number(1.0));

    let with_macro = build(
        Engine::builder().register_system_macro("FOO", vec![Instruction::Push(Primitive::Number(3.0))]),
    );
    assert_eq!(eval_with(&with_macro, source), Primitive::Number(1.0));
}

#[test]
fn threads_from_one_program_are_isolated() {
    let engine = build(Engine::builder().with_prelude().register_builtin("pause", 0, |ctx, _args| {
        ctx.suspend();
        Ok(Primitive::Null)
    }));
    let program = Arc::new(
        engine
            .compile(
                "shared",
                r#"
                var x = getArgument(0);
                pause();
                x = x + 1;
                pause();
                return x * 10;
                "#,
            )
            .expect("compiles"),
    );

    let mut first = engine
        .create_thread(&program, None, vec![Primitive::Number(1.0)])
        .expect("first thread");
    let mut second = engine
        .create_thread(&program, None, vec![Primitive::Number(100.0)])
        .expect("second thread");

    assert_eq!(first.resume(), ThreadState::Suspended);
    assert_eq!(second.resume(), ThreadState::Suspended);
    assert_eq!(first.resume(), ThreadState::Suspended);
    assert!(first.result().is_none());
    assert_eq!(second.resume(), ThreadState::Suspended);
    assert_eq!(second.resume(), ThreadState::Completed);
    assert_eq!(first.resume(), ThreadState::Completed);

    assert_eq!(first.result(), Some(&Primitive::Number(20.0)));
    assert_eq!(second.result(), Some(&Primitive::Number(1010.0)));
}

#[test]
fn resume_value_becomes_the_suspended_call_result() {
    let engine = build(Engine::builder().register_builtin("ask", 1, |ctx, _args| {
        ctx.suspend();
        Ok(Primitive::Null)
    }));
    let program = Arc::new(
        engine
            .compile("ask", r#"var answer = ask("question"); return answer + 1;"#)
            .expect("compiles"),
    );
    let mut thread = engine.create_thread(&program, None, Vec::new()).expect("thread");
    assert_eq!(thread.resume(), ThreadState::Suspended);
    assert_eq!(thread.resume_with(Primitive::Number(41.0)), ThreadState::Completed);
    assert_eq!(thread.result(), Some(&Primitive::Number(42.0)));
    assert_eq!(thread.resume(), ThreadState::Completed);
}

#[test]
fn constructing_a_template_without_constructor_fails_to_compile() {
    let engine = build(
        Engine::builder().register_template(noodle::TemplateBuilder::<()>::new("MyType").build()),
    );
    let err = diagnostic(
        engine
            .compile("test", "var thing = new MyType(1, 2);")
            .expect_err("constructor is not registered"),
    );
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    let location = err.location.expect("compile errors carry a location");
    assert_eq!((location.line, location.column), (1, 13));
}

#[test]
fn watchdog_faults_after_exactly_the_cap() {
    let engine = build(Engine::builder().watchdog(Some(100)));
    let program = Arc::new(engine.compile("spin", "while (true) {}").expect("compiles"));
    let mut thread = engine.create_thread(&program, None, Vec::new()).expect("thread");

    assert_eq!(thread.resume(), ThreadState::Faulted);
    assert_eq!(thread.instructions_executed(), 100);
    let error = thread.error().expect("fault is recorded");
    assert_eq!(error.kind, DiagnosticKind::Watchdog);
    assert!(error.kind.is_runtime());
    assert!(error.location.is_some());
}

#[test]
fn watchdog_can_be_overridden_per_thread() {
    let engine = build(Engine::builder().config(EngineConfig {
        watchdog: Some(5),
        ..EngineConfig::default()
    }));
    let program = Arc::new(
        engine
            .compile("count", "var i = 0; while (i < 10) { i++; } return i;")
            .expect("compiles"),
    );

    let mut capped = engine.create_thread(&program, None, Vec::new()).expect("thread");
    assert_eq!(capped.resume(), ThreadState::Faulted);
    assert_eq!(capped.instructions_executed(), 5);

    let mut relaxed = engine.create_thread(&program, None, Vec::new()).expect("thread");
    relaxed.set_watchdog(None);
    assert_eq!(relaxed.resume(), ThreadState::Completed);
    assert_eq!(relaxed.result(), Some(&Primitive::Number(10.0)));
}

#[test]
fn compilation_is_deterministic() {
    let engine = engine();
    let source = r#"
        function fact(n) { if (n <= 1) return 1; return n * fact(n - 1); }
        var total = 0;
        for (var i = 0; i < 5; i++) { total += fact(i); }
        switch (total) { case 34: total = "ok"; break; default: total = null; }
        return total;
    "#;
    let first = engine.compile("same", source).expect("compiles");
    let second = engine.compile("same", source).expect("compiles");
    assert_eq!(first.instructions(), second.instructions());
    assert_eq!(first, second);
}

#[test]
fn call_resolution_requires_exact_arity() {
    let engine = build(
        Engine::builder().register_builtin("foo", 1, |_ctx, args| Ok(args[0].clone())),
    );
    let err = diagnostic(engine.compile("test", "return foo();").expect_err("arity 0 is unknown"));
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    assert!(err.message.contains("foo/0"), "message: {}", err.message);
    assert!(err.notes.iter().any(|note| note.contains("1")));
    let location = err.location.expect("location");
    assert_eq!((location.line, location.column), (1, 8));

    assert_eq!(eval_with(&engine, "return foo(5);"), Primitive::Number(5.0));
}

#[test]
fn break_is_only_legal_inside_loops_and_switches() {
    let err = compile_error("var x = 1;\n  break;");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    let location = err.location.expect("location");
    assert_eq!((location.line, location.column), (2, 3));

    assert_eq!(eval("while (true) { break; } return 5;"), Primitive::Number(5.0));

    let err = compile_error("switch (1) { case 1: continue; }");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
}

#[test]
fn loops_iterate_and_continue() {
    assert_eq!(
        eval("var sum = 0; for (var i = 0; i < 10; i++) { sum += i; } return sum;"),
        Primitive::Number(45.0)
    );
    assert_eq!(
        eval(
            r#"
            var odd = 0;
            var i = 0;
            while (i < 10) {
                i++;
                if (i % 2 == 0) continue;
                odd += i;
            }
            return odd;
            "#
        ),
        Primitive::Number(25.0)
    );
    assert_eq!(
        eval("var runs = 0; do { runs++; } while (false); return runs;"),
        Primitive::Number(1.0)
    );
}

#[test]
fn switch_falls_through_and_runs_default_last() {
    let value = eval(
        r#"
        function classify(n) {
            var out = "";
            switch (n) {
                default: out = out + "d";
                case 1: out = out + "a";
                case 2: out = out + "b"; break;
                case 3: out = out + "c";
            }
            return out;
        }
        return classify(1) + "," + classify(2) + "," + classify(3) + "," + classify(9);
        "#,
    );
    assert_eq!(expect_string(&value), "ab,b,cd,d");
}

#[test]
fn continue_inside_switch_targets_the_enclosing_loop() {
    let value = eval(
        r#"
        var hits = 0;
        for (var i = 0; i < 6; i++) {
            switch (i % 2) {
                case 0: continue;
            }
            hits++;
        }
        return hits;
        "#,
    );
    assert_eq!(value, Primitive::Number(3.0));
}

#[test]
fn functions_recurse_overload_and_default_to_null() {
    let value = eval(
        r#"
        return fib(10) + area(3) + area(2, 5);
        function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
        function area(side) { return side * side; }
        function area(w, h) { return w * h; }
        "#,
    );
    assert_eq!(expect_number(&value), 74.0);
    assert_eq!(eval("function nothing() { var x = 1; } return nothing();"), Primitive::Null);
}

#[test]
fn duplicate_function_declarations_are_rejected() {
    let err = compile_error("function f(a) { return a; }\nfunction f(b) { return b; }");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    assert_eq!(err.location.expect("location").line, 2);

    let err = compile_error("function getArgument(i) { return i; }");
    assert_eq!(err.kind, DiagnosticKind::Compiler);

    let err = compile_error("if (true) { function nested() {} }");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
}

#[test]
fn increments_yield_old_or_new_values() {
    assert_eq!(
        eval("var i = 5; var a = i++; var b = ++i; return a * 100 + b;"),
        Primitive::Number(507.0)
    );
    assert_eq!(eval("var i = 5; i--; --i; return i;"), Primitive::Number(3.0));
    assert_eq!(
        eval("var x = 10; x -= 3; x *= 2; x /= 7; x += 0.5; return x;"),
        Primitive::Number(2.5)
    );
}

#[test]
fn logical_operators_short_circuit() {
    let source = r#"
        function boom() { return 1 / 0 == 0; }
        return (false && boom()) == false && (true || boom());
    "#;
    assert_eq!(eval(source), Primitive::Boolean(true));
}

#[test]
fn logical_operators_require_boolean_operands() {
    let err = run_error("return true && 5;");
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("Boolean"), "message: {}", err.message);

    let err = run_error("return false || \"x\";");
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("found String"), "message: {}", err.message);

    let err = run_error("return 1 && true;");
    assert_eq!(err.kind, DiagnosticKind::Runtime);

    assert_eq!(eval("return false && 5;"), Primitive::Boolean(false));
}

#[test]
fn operand_stack_is_bounded() {
    let engine = build(Engine::builder().config(EngineConfig {
        max_stack_depth: 4,
        ..EngineConfig::default()
    }));
    let program = Arc::new(
        engine
            .compile("deep", "return 1 + (2 + (3 + (4 + (5 + 6))));")
            .expect("compiles"),
    );
    let mut thread = engine.create_thread(&program, None, Vec::new()).expect("thread");
    let err = diagnostic(thread.run().expect_err("stack overflows"));
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("operand stack overflow"), "message: {}", err.message);

    assert_eq!(eval_with(&engine, "return 1 + 2;"), Primitive::Number(3.0));
}

#[test]
fn variables_are_block_scoped() {
    assert_eq!(eval("var a = 1; { var a = 2; } return a;"), Primitive::Number(1.0));
    assert_eq!(eval("x = 4; return x * 2;"), Primitive::Number(8.0));

    let err = compile_error("{ var inner = 1; } return inner;");
    assert_eq!(err.kind, DiagnosticKind::Compiler);

    let err = compile_error("var a = 1;\nvar a = 2;");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    assert!(err.notes.iter().any(|note| note.contains("previously declared")));
}

#[test]
fn strings_concatenate_with_primitives() {
    let value = eval(r#"return "n=" + 3 + ", " + true + ", " + null;"#);
    assert_eq!(expect_string(&value), "n=3, true, null");
    assert_eq!(eval(r#"return "abc" < "abd";"#), Primitive::Boolean(true));
}

#[test]
fn runtime_errors_fault_with_location_and_call_stack() {
    let err = run_error(
        r#"function inner() { return 1 / 0; }
function outer() { return inner(); }
return outer();"#,
    );
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("division by zero"));
    let location = err.location.expect("location");
    assert_eq!(location.line, 1);
    let functions: Vec<_> = err.call_stack.iter().map(|entry| entry.function.as_str()).collect();
    assert_eq!(functions, ["inner/0", "outer/0", "<main>"]);
    assert_eq!(
        err.call_stack[1].location.as_ref().map(|location| location.line),
        Some(2)
    );

    let err = run_error(r#"return "a" < 1;"#);
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    let err = run_error("if (1) return 2;");
    assert!(err.message.contains("Boolean"));
    let err = run_error("return 1.5 << 1;");
    assert_eq!(err.kind, DiagnosticKind::Runtime);
}

#[test]
fn faults_leave_other_threads_untouched() {
    let engine = engine();
    let program = Arc::new(
        engine
            .compile("div", "return 10 / getArgument(0);")
            .expect("compiles"),
    );
    let mut failing = engine
        .create_thread(&program, None, vec![Primitive::Number(0.0)])
        .expect("thread");
    let mut healthy = engine
        .create_thread(&program, None, vec![Primitive::Number(4.0)])
        .expect("thread");
    assert_eq!(failing.resume(), ThreadState::Faulted);
    assert_eq!(healthy.resume(), ThreadState::Completed);
    assert_eq!(healthy.result(), Some(&Primitive::Number(2.5)));
    assert_eq!(failing.resume(), ThreadState::Faulted);
}

#[test]
fn deep_recursion_overflows_the_call_stack() {
    let err = run_error("function down(n) { return down(n + 1); } return down(0);");
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("call stack overflow"));
}

#[test]
fn threads_can_start_at_a_declared_function() {
    let engine = engine();
    let program = Arc::new(
        engine
            .compile("entry", "function add(a, b) { return a + b; } return 0;")
            .expect("compiles"),
    );
    assert_eq!(program.function_offset("add"), program.function("add", 2).map(|f| f.entry));

    let mut thread = engine
        .create_thread(&program, Some("add"), vec![Primitive::Number(2.0), Primitive::Number(3.0)])
        .expect("entry exists");
    assert_eq!(thread.run().expect("runs"), Primitive::Number(5.0));

    assert!(engine.create_thread(&program, Some("add"), Vec::new()).is_err());
}

#[test]
fn prelude_exposes_arguments_and_casts() {
    let engine = engine();
    let program = Arc::new(
        engine
            .compile(
                "prelude",
                r#"
                var total = argumentCount + argumentCount();
                var text = toString(castToInt(getArgument(1)) + total);
                return text + "/" + castToInt(-2.7);
                "#,
            )
            .expect("compiles"),
    );
    let mut thread = engine
        .create_thread(&program, None, vec![Primitive::Number(4.0), Primitive::string("42.9")])
        .expect("thread");
    let value = thread.run().expect("runs");
    assert_eq!(expect_string(&value), "46/-2");
}

#[test]
fn system_macros_expand_to_their_instructions() {
    let engine = build(
        Engine::builder()
            .register_builtin("twice", 1, |_ctx, args| {
                Ok(Primitive::Number(args[0].expect_number("twice")? * 2.0))
            })
            .register_system_macro(
                "EIGHT",
                vec![
                    Instruction::Push(Primitive::Number(4.0)),
                    Instruction::Call {
                        target: CallTarget::Builtin,
                        name: "twice".to_string(),
                        arity: 1,
                    },
                ],
            ),
    );
    assert_eq!(eval_with(&engine, "return EIGHT + 1;"), Primitive::Number(9.0));
}

#[test]
fn functions_share_top_level_variables() {
    let source = r#"
var count = 0;
var label = "n";
function bump(by) {
  count += by;
  return count;
}
function rename() { label = label + count; }
bump(2);
bump(3);
rename();
return label + ":" + count;
"#;
    assert_eq!(expect_string(&eval(source)), "n5:5");
    assert_eq!(
        eval("var x = 1; function f() { var x = 2; return x; } return f() + x;"),
        Primitive::Number(3.0)
    );

    let engine = engine();
    let program = Arc::new(
        engine
            .compile("globals", "var limit = 3; function read() { return limit; }")
            .expect("compiles"),
    );
    assert!(program.disassemble().contains("load_global $0"));
    let mut thread = engine
        .create_thread(&program, Some("read"), Vec::new())
        .expect("thread");
    assert_eq!(thread.run().expect("runs"), Primitive::Null);
    let mut thread = engine.create_thread(&program, None, Vec::new()).expect("thread");
    thread.run().expect("runs");
    assert_eq!(thread.global("limit"), Some(&Primitive::Number(3.0)));
}

#[test]
fn function_locals_stay_private() {
    let err = compile_error("function f() { var hidden = 1; return hidden; }\nreturn hidden;");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    assert!(err.message.contains("unknown variable `hidden`"));
}
