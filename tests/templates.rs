use std::sync::{
    Arc, Mutex,
    atomic::{AtomicI64, Ordering},
};

use noodle::{
    Diagnostic, DiagnosticKind, Engine, EngineBuilder, EngineConfig, Instruction, NativeFunction,
    NoodleError, ObjectRef, Primitive, Repl, TemplateBuilder, Thread,
};

#[derive(Debug)]
struct Counter(i64);

struct Tag;

fn counter_template() -> TemplateBuilder<Counter> {
    let limit = Arc::new(AtomicI64::new(10));
    let current = Arc::clone(&limit);
    TemplateBuilder::<Counter>::new("Counter")
        .constructor(0, |_args| Ok(Counter(0)))
        .constructor(1, |args| Ok(Counter(args[0].expect_number("Counter")? as i64)))
        .method("increment", 0, |counter, _args| {
            counter.0 += 1;
            Ok(Primitive::Null)
        })
        .method("add", 1, |counter, args| {
            counter.0 += args[0].expect_number("add")? as i64;
            Ok(Primitive::Null)
        })
        .method("get", 0, |counter, _args| Ok(Primitive::Number(counter.0 as f64)))
        .static_native(
            NativeFunction::new("zero", 0, |ctx, _args| ctx.alloc("Counter", Counter(0))).returning("Counter"),
        )
        .getter("value", |counter| Ok(Primitive::Number(counter.0 as f64)))
        .setter("value", |counter, value| {
            counter.0 = value.expect_number("value")? as i64;
            Ok(())
        })
        .getter("doubled", |counter| Ok(Primitive::Number((counter.0 * 2) as f64)))
        .static_getter("limit", move |_ctx| Ok(Primitive::Number(current.load(Ordering::SeqCst) as f64)))
        .static_setter("limit", move |_ctx, value| {
            limit.store(value.expect_number("limit")? as i64, Ordering::SeqCst);
            Ok(())
        })
        .display(|counter| format!("Counter({})", counter.0))
        .equality(|lhs, rhs| lhs.0 == rhs.0)
}

fn builder() -> EngineBuilder {
    Engine::builder()
        .with_prelude()
        .register_template(counter_template().build())
        .register_template(TemplateBuilder::<Tag>::new("Tag").constructor(0, |_args| Ok(Tag)).build())
}

fn start(source: &str) -> Thread {
    let engine = Arc::new(builder().build().expect("engine should build"));
    let program = Arc::new(engine.compile("templates", source).expect("compilation should succeed"));
    engine
        .create_thread(&program, None, Vec::new())
        .expect("thread should start")
}

fn eval(source: &str) -> Primitive {
    start(source).run().expect("execution should succeed")
}

fn diagnostic(result: Result<impl std::fmt::Debug, NoodleError>) -> Diagnostic {
    match result {
        Ok(value) => panic!("expected an error, received {value:?}"),
        Err(NoodleError::Diagnostic(diagnostic)) => diagnostic,
        Err(other) => panic!("expected a diagnostic, received {other}"),
    }
}

fn compile_error(source: &str) -> Diagnostic {
    let engine = builder().build().expect("engine should build");
    diagnostic(engine.compile("templates", source).map(|_| ()))
}

fn registration_error(builder: EngineBuilder) -> String {
    match builder.build() {
        Ok(_) => panic!("expected registration to fail"),
        Err(NoodleError::Registration(message)) => message,
        Err(other) => panic!("expected a registration error, received {other}"),
    }
}

#[test]
fn constructors_and_methods_operate_on_instances() {
    let source = r#"
var c = new Counter(5);
c.increment();
c.add(10);
return c.get();
"#;
    assert_eq!(eval(source), Primitive::Number(16.0));
    assert_eq!(eval("var c = new Counter(); return c.get();"), Primitive::Number(0.0));
}

#[test]
fn typed_parameters_allow_method_calls() {
    let source = r#"
function bump(c: Counter, times) {
  for (var i = 0; i < times; i++) {
    c.increment();
  }
  return c.get();
}
return bump(new Counter(1), 3);
"#;
    assert_eq!(eval(source), Primitive::Number(4.0));
}

#[test]
fn static_functions_return_typed_objects() {
    let source = r#"
var z = Counter.zero();
z.add(7);
return z.get();
"#;
    assert_eq!(eval(source), Primitive::Number(7.0));
}

#[test]
fn objects_render_through_their_template() {
    assert_eq!(
        eval("var c = new Counter(5); return \"c=\" + c;"),
        Primitive::string("c=Counter(5)")
    );
    assert_eq!(
        eval("var c = new Counter(2); return c.toString();"),
        Primitive::string("Counter(2)")
    );
    assert_eq!(
        eval("var c = new Counter(3); return toString(c);"),
        Primitive::string("Counter(3)")
    );
}

#[test]
fn equals_compares_contents() {
    let source = r#"
var a = new Counter(2);
var b = new Counter(2);
var c = new Counter(3);
return a.equals(b) && !a.equals(c) && !a.equals(2);
"#;
    assert_eq!(eval(source), Primitive::Boolean(true));
}

#[test]
fn host_reads_returned_objects_from_the_heap() {
    let mut thread = start("var c = new Counter(40); c.add(2); return c;");
    let value = thread.run().expect("execution should succeed");
    let object = value.as_object().expect("an object result");
    let counter = thread.heap().get::<Counter>(object).expect("a Counter");
    assert_eq!(counter.0, 42);
}

#[test]
fn method_calls_need_a_known_template() {
    let err = compile_error("function f(c) { return c.get(); }\nreturn f(new Counter());");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    assert!(err.message.contains("unknown template"));

    let err = compile_error("var c = new Counter();\nreturn c.missing();");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    assert!(err.message.contains("has no method `missing/0`"));

    let err = compile_error("return Counter.make();");
    assert_eq!(err.kind, DiagnosticKind::Compiler);

    let err = compile_error("var c: Widget = null;");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
}

#[test]
fn assigning_another_template_is_a_compile_error() {
    let err = compile_error("var c = new Counter();\nc = new Tag();");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    let location = err.location.expect("location");
    assert_eq!((location.line, location.column), (2, 5));
}

#[test]
fn null_receiver_is_a_runtime_error() {
    let err = diagnostic(start("var c: Counter;\nreturn c.get();").run());
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("expects a `Counter` receiver"));
    assert_eq!(err.location.expect("location").line, 2);
}

#[test]
fn invalid_registrations_are_rejected() {
    let message = registration_error(
        Engine::builder()
            .register_template(counter_template().build())
            .register_template(counter_template().build()),
    );
    assert!(message.contains("Counter"));

    let duplicate_method = TemplateBuilder::<Counter>::new("Twice")
        .method("get", 0, |counter, _args| Ok(Primitive::Number(counter.0 as f64)))
        .method("get", 0, |_counter, _args| Ok(Primitive::Null))
        .build();
    let message = registration_error(Engine::builder().register_template(duplicate_method));
    assert!(message.contains("get/0"));

    let message = registration_error(
        Engine::builder()
            .register_native(NativeFunction::new("make", 0, |_ctx, _args| Ok(Primitive::Null)).returning("Nope")),
    );
    assert!(message.contains("Nope"));

    registration_error(Engine::builder().register_system_macro(
        "PAIR",
        vec![
            Instruction::Push(Primitive::Number(1.0)),
            Instruction::Push(Primitive::Number(2.0)),
        ],
    ));
    registration_error(Engine::builder().register_system_macro("SLOT", vec![Instruction::Load(0)]));
    let message = registration_error(Engine::builder().register_system_macro("SHARED", vec![Instruction::LoadGlobal(0)]));
    assert!(message.contains("cannot access variables or properties"));

    let twice_value = TemplateBuilder::<Counter>::new("Twice")
        .getter("value", |counter| Ok(Primitive::Number(counter.0 as f64)))
        .getter("value", |_counter| Ok(Primitive::Null))
        .build();
    let message = registration_error(Engine::builder().register_template(twice_value));
    assert!(message.contains("getter `value`"));

    registration_error(
        Engine::builder()
            .register_builtin("twice", 0, |_ctx, _args| Ok(Primitive::Null))
            .register_builtin("twice", 0, |_ctx, _args| Ok(Primitive::Null)),
    );
}

#[test]
fn host_can_release_objects() {
    let mut thread = start("return new Counter(9);");
    let object = thread
        .run()
        .expect("execution should succeed")
        .as_object()
        .expect("an object result");
    let released = thread.heap_mut().release(object).expect("object is live");
    let counter = released.downcast::<Counter>().expect("a Counter");
    assert_eq!(counter.0, 9);
    assert!(thread.heap().get::<Counter>(object).is_err());
    assert!(thread.heap_mut().release(object).is_none());
}

#[test]
fn repl_lines_render_objects() {
    let engine = Arc::new(builder().build().expect("engine should build"));
    let mut repl = Repl::new(engine);
    assert_eq!(
        repl.eval_line("return new Counter(4);").expect("line should run"),
        Primitive::string("Counter(4)")
    );
    match repl.eval_line("return c.get();") {
        Err(NoodleError::Diagnostic(diagnostic)) => assert!(diagnostic.kind.is_compile_time()),
        other => panic!("expected a compile error, received {other:?}"),
    }
}

#[test]
fn properties_read_and_write_through_accessors() {
    let source = r#"
var c = new Counter(5);
c.value = c.value + 2;
c.value += 3;
c.value++;
var old = c.value--;
var now = ++c.value;
return c.doubled + old * 1000 + now * 100000;
"#;
    assert_eq!(eval(source), Primitive::Number(1_111_022.0));
    assert_eq!(
        eval("var c = new Counter(1); return c.template;"),
        Primitive::string("Counter")
    );
}

#[test]
fn static_properties_belong_to_the_template() {
    let source = r#"
Counter.limit = 4;
Counter.limit += 1;
Counter.limit++;
var before = Counter.limit++;
return before * 10 + Counter.limit;
"#;
    assert_eq!(eval(source), Primitive::Number(67.0));
    assert_eq!(eval("return ++Counter.limit;"), Primitive::Number(11.0));
}

#[test]
fn property_access_is_checked_at_compile_time() {
    let err = compile_error("var c = new Counter();\nc.doubled = 4;");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    assert!(err.message.contains("no writable property `doubled`"));

    let err = compile_error("var c = new Counter();\nreturn c.missing;");
    assert!(err.message.contains("no readable property `missing`"));

    let err = compile_error("var c = new Counter();\nreturn c.limit;");
    assert!(err.notes.iter().any(|note| note.contains("Counter.limit")));

    let err = compile_error("return Counter.value;");
    assert!(err.message.contains("no readable static property `value`"));

    let err = compile_error("function f(c) { return c.value; }\nreturn f(new Counter());");
    assert!(err.message.contains("unknown template"));
}

#[test]
fn property_on_null_receiver_is_a_runtime_error() {
    let err = diagnostic(start("var c: Counter;\nreturn c.value;").run());
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("expects a `Counter` receiver"));
    assert_eq!(err.location.expect("location").line, 2);
}

#[test]
fn arrays_hold_values_by_index() {
    let source = r#"
var a = new Array(3);
a.set(0, 4);
var old = a.set(0, 6);
a.set(2, "x");
return a.length * 100 + a.get(0) * 10 + old;
"#;
    assert_eq!(eval(source), Primitive::Number(364.0));
    assert_eq!(
        eval("var a = new Array(2); a.set(1, true); return \"\" + a;"),
        Primitive::string("[null, true]")
    );

    let err = diagnostic(start("var a = new Array(2);\nreturn a.get(2);").run());
    assert_eq!(err.kind, DiagnosticKind::Runtime);
    assert!(err.message.contains("out of range"));

    let err = diagnostic(start("return new Array(-1);").run());
    assert!(err.message.contains("non-negative"));

    let err = compile_error("var a = new Array(1);\na.length = 3;");
    assert!(err.message.contains("no writable property `length`"));
}

#[test]
fn untyped_variables_learn_the_template_assigned_to_them() {
    assert_eq!(
        eval("var x;\nx = new Counter(3);\nx.increment();\nreturn x.get();"),
        Primitive::Number(4.0)
    );
    assert_eq!(
        eval("function f() { var y; y = new Counter(2); return y.get(); }\nreturn f();"),
        Primitive::Number(2.0)
    );
    let err = compile_error("var x;\nx = new Counter();\nx = new Tag();");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
}

#[test]
fn released_handles_do_not_reach_recycled_slots() {
    let mut thread = start("return new Counter(1);");
    let first = thread
        .run()
        .expect("execution should succeed")
        .as_object()
        .expect("an object result");
    thread.heap_mut().release(first).expect("object is live");

    let second = thread.heap_mut().alloc(first.template, Box::new(Counter(2)));
    assert_eq!(second.handle, first.handle);
    assert_ne!(second, first);
    assert!(thread.heap().get::<Counter>(first).is_err());
    assert!(thread.heap_mut().release(first).is_none());
    assert_eq!(thread.heap().get::<Counter>(second).expect("a Counter").0, 2);
}

#[test]
fn unreachable_objects_are_collected_while_running() {
    let source = r#"
var keep = new Counter(7);
var arr = new Array(1);
arr.set(0, new Counter(5));
var i = 0;
while (i < 10000) {
  var b = new Counter(i);
  i++;
}
var c: Counter = arr.get(0);
return keep.get() + c.get();
"#;
    let mut thread = start(source);
    assert_eq!(thread.run().expect("execution should succeed"), Primitive::Number(12.0));
    assert!(thread.heap().len() < 300, "heap holds {} objects", thread.heap().len());
}

#[test]
fn pinned_objects_survive_collection() {
    let stashed: Arc<Mutex<Option<ObjectRef>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&stashed);
    let engine = builder()
        .config(EngineConfig {
            gc_threshold: 16,
            ..EngineConfig::default()
        })
        .register_builtin("stash", 0, move |ctx, _args| {
            let object = ctx.alloc("Counter", Counter(77))?.as_object();
            if let Some(object) = object {
                ctx.heap().pin(object);
            }
            *slot.lock().expect("lock") = object;
            Ok(Primitive::Null)
        })
        .build()
        .expect("engine should build");
    let engine = Arc::new(engine);
    let program = Arc::new(
        engine
            .compile("pins", "stash();\nfor (var i = 0; i < 500; i++) { new Counter(i); }")
            .expect("compilation should succeed"),
    );
    let mut thread = engine.create_thread(&program, None, Vec::new()).expect("thread should start");
    thread.run().expect("execution should succeed");

    let object = stashed.lock().expect("lock").expect("stash ran");
    assert_eq!(thread.heap().get::<Counter>(object).expect("still alive").0, 77);
    assert!(thread.heap().len() < 40);
    assert!(thread.heap_mut().unpin(object));
}

#[test]
fn repl_keeps_variables_between_lines() {
    let engine = Arc::new(builder().build().expect("engine should build"));
    let mut repl = Repl::new(engine);
    assert_eq!(repl.eval_line("var c = new Counter(4);").expect("line should run"), Primitive::Null);
    repl.eval_line("c.add(1);").expect("line should run");
    assert_eq!(repl.eval_line("return c.get();").expect("line should run"), Primitive::Number(5.0));

    repl.eval_line("var n = 2;").expect("line should run");
    assert_eq!(repl.eval_line("n += 3; return n;").expect("line should run"), Primitive::Number(5.0));
    assert!(repl.eval_line("return missing;").is_err());
    assert_eq!(repl.eval_line("return c.value + n;").expect("line should run"), Primitive::Number(10.0));
    assert_eq!(repl.variables().collect::<Vec<_>>(), ["c", "n"]);
}
