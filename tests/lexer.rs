use noodle::{
    DiagnosticKind, Primitive,
    ast::BinaryOp,
    lexer::{Keyword, Payload, Token, TokenKind, tokenize},
};

fn kinds(source: &str) -> Vec<TokenKind> {
    tokenize("lex", source)
        .expect("tokenize should succeed")
        .into_iter()
        .map(|token| token.kind)
        .collect()
}

fn tokens(source: &str) -> Vec<Token> {
    tokenize("lex", source).expect("tokenize should succeed")
}

#[test]
fn recognises_declarations_and_punctuation() {
    assert_eq!(
        kinds("var x: Point = new Point(1, 2);"),
        vec![
            TokenKind::Keyword(Keyword::Var),
            TokenKind::Identifier,
            TokenKind::Colon,
            TokenKind::Identifier,
            TokenKind::Assign,
            TokenKind::Keyword(Keyword::New),
            TokenKind::Identifier,
            TokenKind::LParen,
            TokenKind::Number,
            TokenKind::Comma,
            TokenKind::Number,
            TokenKind::RParen,
            TokenKind::Semicolon,
            TokenKind::Eof,
        ]
    );
    assert_eq!(
        kinds("# \\ . { }"),
        vec![
            TokenKind::Pound,
            TokenKind::Backslash,
            TokenKind::Dot,
            TokenKind::LBrace,
            TokenKind::RBrace,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn number_literals_round_trip() {
    for literal in ["0", "42", "1.5", "0.125", "1024.75"] {
        let lexed = tokens(literal);
        let expected: f64 = literal.parse().expect("valid literal");
        assert_eq!(lexed[0].number(), Some(expected));
        assert_eq!(lexed[0].to_string(), literal);
    }
}

#[test]
fn string_literals_process_escapes() {
    let source = r#""line\n\ttab \"quoted\" \\ done""#;
    let lexed = tokens(source);
    assert_eq!(lexed[0].kind, TokenKind::String);
    assert_eq!(lexed[0].text(), Some("line\n\ttab \"quoted\" \\ done"));
    assert_eq!(lexed[0].to_string(), source);
}

#[test]
fn operators_carry_their_payloads() {
    let lexed = tokens("a += 1; b--; c <= d << 2 && !e != f");
    let payloads: Vec<&Payload> = lexed.iter().map(|token| &token.payload).collect();
    assert_eq!(payloads[1], &Payload::Assign(Some(BinaryOp::Add)));
    assert_eq!(lexed[5].kind, TokenKind::Adjust);
    assert_eq!(lexed[5].number(), Some(-1.0));
    assert_eq!(lexed[8].operator(), Some(BinaryOp::LessEqual));
    assert_eq!(lexed[10].operator(), Some(BinaryOp::ShiftLeft));
    assert_eq!(lexed[12].operator(), Some(BinaryOp::And));
    assert_eq!(lexed[13].kind, TokenKind::UnaryOperator);
    assert_eq!(lexed[15].operator(), Some(BinaryOp::NotEqual));
}

#[test]
fn identifiers_accept_unicode_letters() {
    let lexed = tokens("größe = _ñ2 + été;");
    assert_eq!(lexed[0].text(), Some("größe"));
    assert_eq!(lexed[2].text(), Some("_ñ2"));
    assert_eq!(lexed[4].text(), Some("été"));
    assert_eq!(lexed[4].location.column, 15);
}

#[test]
fn booleans_lex_as_constants() {
    let lexed = tokens("true false null");
    assert_eq!(lexed[0].payload, Payload::Constant(Primitive::Boolean(true)));
    assert_eq!(lexed[1].payload, Payload::Constant(Primitive::Boolean(false)));
    assert!(lexed[2].is_keyword(Keyword::Null));
}

#[test]
fn comments_are_skipped_and_locations_tracked() {
    let lexed = tokens("// heading\n/* block\n comment */ value = 3;");
    let value = &lexed[0];
    assert_eq!(value.text(), Some("value"));
    assert_eq!((value.location.line, value.location.column), (3, 13));
    assert_eq!(&*value.location.source, "lex");
}

#[test]
fn malformed_input_is_a_lex_error() {
    let err = tokenize("lex", "var s = \"open").expect_err("unterminated string");
    assert_eq!(err.kind, DiagnosticKind::Lex);
    let location = err.location.expect("location");
    assert_eq!((location.line, location.column), (1, 9));

    let err = tokenize("lex", "var a = 1;\n  @").expect_err("unknown character");
    assert_eq!(err.kind, DiagnosticKind::Lex);
    let location = err.location.expect("location");
    assert_eq!((location.line, location.column), (2, 3));

    let err = tokenize("lex", r#""\q""#).expect_err("unknown escape");
    assert_eq!(err.kind, DiagnosticKind::Lex);

    let err = tokenize("lex", "/* never closed").expect_err("unterminated comment");
    assert_eq!(err.kind, DiagnosticKind::Lex);
}
