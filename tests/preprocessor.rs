use std::sync::Arc;

use noodle::{
    Diagnostic, DiagnosticKind, Engine, EngineBuilder, NoodleError, Primitive,
    lexer::{Payload, Token, TokenKind},
    preprocessor::{Preprocessor, PreprocessorBuiltin},
};

fn run(builder: EngineBuilder, source: &str) -> Primitive {
    let engine = Arc::new(builder.build().expect("engine should build"));
    let program = Arc::new(engine.compile("pp", source).expect("compilation should succeed"));
    let mut thread = engine
        .create_thread(&program, None, Vec::new())
        .expect("thread should start");
    thread.run().expect("execution should succeed")
}

fn eval(source: &str) -> Primitive {
    run(Engine::builder().with_prelude(), source)
}

fn compile_error(source: &str) -> Diagnostic {
    let engine = Engine::builder().with_prelude().build().expect("engine should build");
    match engine.compile("pp", source) {
        Ok(_) => panic!("expected preprocessing to fail"),
        Err(NoodleError::Diagnostic(diagnostic)) => diagnostic,
        Err(other) => panic!("expected a diagnostic, received {other}"),
    }
}

#[test]
fn object_like_macros_substitute_their_body() {
    assert_eq!(eval("#define TWO 2\nreturn TWO * 21;"), Primitive::Number(42.0));
    assert_eq!(
        eval("#define GREETING \"hi\"\nreturn GREETING + \"!\";"),
        Primitive::string("hi!")
    );
}

#[test]
fn function_like_macros_take_arguments() {
    assert_eq!(
        eval("#define ADD(a, b) ((a) + (b))\nreturn ADD(1, 2) * 2;"),
        Primitive::Number(6.0)
    );
    assert_eq!(
        eval("#define FIRST(a, b) a\nreturn FIRST((1 + 2), 5);"),
        Primitive::Number(3.0)
    );
    assert_eq!(
        eval("#define SQUARE(x) ((x) * (x))\n#define QUAD(x) SQUARE(SQUARE(x))\nreturn QUAD(2);"),
        Primitive::Number(16.0)
    );
}

#[test]
fn macro_output_is_rescanned_with_following_tokens() {
    assert_eq!(
        eval("#define F(x) (x + 1)\n#define CALL F\nreturn CALL(2);"),
        Primitive::Number(3.0)
    );
    assert_eq!(
        eval("#define APPLY(f, v) f(v)\n#define DOUBLE(x) ((x) * 2)\nreturn APPLY(DOUBLE, 5);"),
        Primitive::Number(10.0)
    );
}

#[test]
fn macros_do_not_expand_inside_themselves() {
    assert_eq!(
        eval("var A = 5;\n#define A A + 1\nreturn A;"),
        Primitive::Number(6.0)
    );
    assert_eq!(
        eval("var A = 1;\nvar B = 10;\n#define A B + 1\n#define B A * 2\nreturn A;"),
        Primitive::Number(3.0)
    );
}

#[test]
fn macro_arity_mismatch_is_a_syntax_error() {
    let err = compile_error("#define ADD(a, b) a + b\nreturn ADD(1);");
    assert_eq!(err.kind, DiagnosticKind::Syntax);
    assert_eq!(err.location.expect("location").line, 2);
}

#[test]
fn redefining_a_macro_is_a_compiler_error() {
    let err = compile_error("#define LIMIT 1\n#define LIMIT 2\nreturn LIMIT;");
    assert_eq!(err.kind, DiagnosticKind::Compiler);
    let location = err.location.expect("location");
    assert_eq!((location.line, location.column), (2, 9));
}

#[test]
fn undef_removes_a_macro() {
    assert_eq!(
        eval("#define X 1\n#undef X\nreturn defined(X);"),
        Primitive::Boolean(false)
    );
}

#[test]
fn conditional_blocks_select_code() {
    let source = r#"
#define DEBUG
#ifdef DEBUG
return 1;
#else
return 2;
#endif
"#;
    assert_eq!(eval(source), Primitive::Number(1.0));

    let source = r#"
#ifndef RELEASE
var mode = "debug";
#else
var mode = "release";
#endif
return mode;
"#;
    assert_eq!(eval(source), Primitive::string("debug"));
}

#[test]
fn if_directives_evaluate_expressions() {
    let source = r#"
#define LEVEL 3
#if LEVEL > 2 && defined(LEVEL)
return "high";
#else
return "low";
#endif
"#;
    assert_eq!(eval(source), Primitive::string("high"));

    let nested = r#"
#if 0
  #if 1
  return "inner";
  #endif
  return "outer";
#else
return "skipped";
#endif
"#;
    assert_eq!(eval(nested), Primitive::string("skipped"));
}

#[test]
fn malformed_conditionals_are_syntax_errors() {
    let err = compile_error("#if UNKNOWN_NAME\nreturn 1;\n#endif");
    assert_eq!(err.kind, DiagnosticKind::Syntax);

    let err = compile_error("#ifdef A\nreturn 1;");
    assert_eq!(err.kind, DiagnosticKind::Syntax);

    let err = compile_error("#endif");
    assert_eq!(err.kind, DiagnosticKind::Syntax);

    let err = compile_error("#if 1\n#else\n#else\n#endif");
    assert_eq!(err.kind, DiagnosticKind::Syntax);
}

#[test]
fn error_directive_reports_its_message() {
    let err = compile_error("#if 1\n#error \"unsupported target\"\n#endif");
    assert_eq!(err.kind, DiagnosticKind::Syntax);
    assert_eq!(err.message, "unsupported target");
    assert_eq!(err.location.expect("location").line, 2);

    assert_eq!(
        eval("#if 0\n#error \"never\"\n#endif\nreturn 0;"),
        Primitive::Number(0.0)
    );
}

#[test]
fn trailing_backslash_continues_a_directive() {
    assert_eq!(
        eval("#define SUM(a, b) a \\\n    + b\nreturn SUM(2, 3);"),
        Primitive::Number(5.0)
    );
}

#[test]
fn defined_checks_macros_builtins_and_system_macros() {
    assert_eq!(eval("return defined(getArgument);"), Primitive::Boolean(true));
    assert_eq!(eval("return defined(argumentCount);"), Primitive::Boolean(true));
    assert_eq!(eval("#define M\nreturn defined(M);"), Primitive::Boolean(true));
    assert_eq!(eval("var x = 1; return defined(x);"), Primitive::Boolean(false));
}

#[test]
fn defined_ignores_constants_and_templates() {
    let builder = Engine::builder().with_prelude().register_constant("ANSWER", 42.0);
    assert_eq!(
        run(builder, "return defined(ANSWER) || defined(Array);"),
        Primitive::Boolean(false)
    );
}

#[test]
fn defined_rejects_bad_arguments() {
    let err = compile_error("return defined();");
    assert_eq!(err.kind, DiagnosticKind::Syntax);
    assert_eq!(err.location.expect("location").column, 8);

    let err = compile_error("return defined(1);");
    assert_eq!(err.kind, DiagnosticKind::Syntax);
    assert_eq!(err.location.expect("location").column, 16);

    let err = compile_error("return defined(a b);");
    assert_eq!(err.kind, DiagnosticKind::Syntax);
    assert_eq!(err.location.expect("location").column, 18);
}

#[test]
fn host_constants_replace_identifiers() {
    let builder = Engine::builder()
        .register_constant("ANSWER", 42.0)
        .register_constant("NAME", "noodle");
    assert_eq!(
        run(builder, "#if ANSWER == 42\nreturn NAME + ANSWER;\n#endif"),
        Primitive::string("noodle42")
    );
}

fn stringify(_pp: &Preprocessor<'_>, call: &Token, args: &[Vec<Token>]) -> Result<Vec<Token>, Diagnostic> {
    let text = args[0]
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    Ok(vec![Token::new(TokenKind::String, call.location.clone(), Payload::Text(text))])
}

#[test]
fn custom_preprocessor_builtins_see_raw_tokens() {
    let builder = Engine::builder().register_preprocessor_builtin(PreprocessorBuiltin::new(
        "stringify",
        1,
        stringify,
    ));
    assert_eq!(run(builder, "return stringify(a + b);"), Primitive::string("a + b"));

    let engine = Engine::builder()
        .register_preprocessor_builtin(PreprocessorBuiltin::new("defined", 1, stringify))
        .build();
    assert!(matches!(engine, Err(NoodleError::Registration(_))));
}
