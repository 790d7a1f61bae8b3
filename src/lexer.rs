use std::{fmt, sync::Arc};

use crate::{
    ast::{BinaryOp, UnaryOp},
    diagnostics::{CodeLocation, Diagnostic},
    value::{Primitive, format_number},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    If,
    Else,
    While,
    Do,
    For,
    Break,
    Continue,
    Return,
    Switch,
    Case,
    Default,
    Function,
    New,
    Null,
    Var,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::If => "if",
            Self::Else => "else",
            Self::While => "while",
            Self::Do => "do",
            Self::For => "for",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Return => "return",
            Self::Switch => "switch",
            Self::Case => "case",
            Self::Default => "default",
            Self::Function => "function",
            Self::New => "new",
            Self::Null => "null",
            Self::Var => "var",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,
    Number,
    String,
    /// Literal value produced by `true`/`false` or by preprocessor substitution.
    Constant,
    /// Identifier the preprocessor resolved to a host system macro.
    SystemMacro,
    Keyword(Keyword),
    Operator,
    UnaryOperator,
    Assign,
    /// `++` or `--`; the payload holds the signed step.
    Adjust,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Colon,
    Dot,
    Pound,
    Backslash,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Number(f64),
    Text(String),
    Operator(BinaryOp),
    Unary(UnaryOp),
    /// `=` carries `None`, compound assignments carry their operator.
    Assign(Option<BinaryOp>),
    Constant(Primitive),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: CodeLocation,
    pub payload: Payload,
}

impl Token {
    pub fn new(kind: TokenKind, location: CodeLocation, payload: Payload) -> Self {
        Self {
            kind,
            location,
            payload,
        }
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }

    /// Identifier name or string contents.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self.payload {
            Payload::Number(value) => Some(value),
            _ => None,
        }
    }

    pub fn operator(&self) -> Option<BinaryOp> {
        match self.payload {
            Payload::Operator(op) => Some(op),
            _ => None,
        }
    }

    /// Short description used in diagnostics.
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::String => "string literal".to_string(),
            _ => format!("`{self}`"),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.payload) {
            (TokenKind::String, Payload::Text(text)) => write!(f, "\"{}\"", escape(text)),
            (_, Payload::Text(text)) => f.write_str(text),
            (_, Payload::Number(value)) if self.kind == TokenKind::Number => {
                f.write_str(&format_number(*value))
            }
            (_, Payload::Number(value)) => f.write_str(if *value < 0.0 { "--" } else { "++" }),
            (_, Payload::Operator(op)) => write!(f, "{op}"),
            (_, Payload::Unary(op)) => write!(f, "{op}"),
            (_, Payload::Assign(None)) => f.write_str("="),
            (_, Payload::Assign(Some(op))) => write!(f, "{op}="),
            (_, Payload::Constant(Primitive::String(text))) => write!(f, "\"{}\"", escape(text)),
            (_, Payload::Constant(value)) => write!(f, "{value}"),
            (TokenKind::Keyword(keyword), Payload::None) => f.write_str(keyword.as_str()),
            (kind, Payload::None) => f.write_str(match kind {
                TokenKind::LParen => "(",
                TokenKind::RParen => ")",
                TokenKind::LBrace => "{",
                TokenKind::RBrace => "}",
                TokenKind::Comma => ",",
                TokenKind::Semicolon => ";",
                TokenKind::Colon => ":",
                TokenKind::Dot => ".",
                TokenKind::Pound => "#",
                TokenKind::Backslash => "\\",
                _ => "",
            }),
        }
    }
}

/// Re-escapes string contents so they can be printed as a literal.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            '\0' => escaped.push_str("\\0"),
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub struct Lexer<'a> {
    source: &'a str,
    name: Arc<str>,
    chars: std::str::CharIndices<'a>,
    peeked: Option<(usize, char)>,
    current: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(name: impl Into<Arc<str>>, source: &'a str) -> Self {
        Self {
            source,
            name: name.into(),
            chars: source.char_indices(),
            peeked: None,
            current: 0,
            line: 1,
            column: 1,
        }
    }

    fn location(&self) -> CodeLocation {
        CodeLocation::new(Arc::clone(&self.name), self.line, self.column)
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let next = self.peeked.take().or_else(|| self.chars.next());
        if let Some((idx, ch)) = next {
            self.current = idx + ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        next
    }

    fn peek(&mut self) -> Option<char> {
        if self.peeked.is_none() {
            self.peeked = self.chars.next();
        }
        self.peeked.map(|(_, ch)| ch)
    }

    /// The character after the peeked one.
    fn peek_second(&mut self) -> Option<char> {
        self.peek();
        self.chars.clone().next().map(|(_, ch)| ch)
    }

    fn match_next(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), Diagnostic> {
        loop {
            match (self.peek(), self.peek_second()) {
                (Some(ch), _) if ch.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.location();
                    self.bump();
                    self.bump();
                    let mut depth = 1;
                    while depth > 0 {
                        match self.bump() {
                            Some((_, '*')) if self.peek() == Some('/') => {
                                self.bump();
                                depth -= 1;
                            }
                            Some((_, '/')) if self.peek() == Some('*') => {
                                self.bump();
                                depth += 1;
                            }
                            Some(_) => {}
                            None => return Err(Diagnostic::lex("unterminated block comment", start)),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn identifier_or_keyword(&mut self, start: usize, location: CodeLocation) -> Token {
        while matches!(self.peek(), Some(ch) if ch.is_alphanumeric() || ch == '_') {
            self.bump();
        }
        let lexeme = &self.source[start..self.current];
        match lexeme {
            "true" => Token::new(
                TokenKind::Constant,
                location,
                Payload::Constant(Primitive::Boolean(true)),
            ),
            "false" => Token::new(
                TokenKind::Constant,
                location,
                Payload::Constant(Primitive::Boolean(false)),
            ),
            _ => match keyword_for(lexeme) {
                Some(keyword) => Token::new(TokenKind::Keyword(keyword), location, Payload::None),
                None => Token::new(
                    TokenKind::Identifier,
                    location,
                    Payload::Text(lexeme.to_string()),
                ),
            },
        }
    }

    fn number_literal(&mut self, start: usize, location: CodeLocation) -> Result<Token, Diagnostic> {
        let mut seen_dot = false;
        loop {
            match self.peek() {
                Some('0'..='9') => {
                    self.bump();
                }
                Some('.') if !seen_dot && matches!(self.peek_second(), Some('0'..='9')) => {
                    seen_dot = true;
                    self.bump();
                }
                _ => break,
            }
        }
        let lexeme = &self.source[start..self.current];
        let value = lexeme
            .parse::<f64>()
            .map_err(|_| Diagnostic::lex(format!("invalid number literal `{lexeme}`"), location.clone()))?;
        Ok(Token::new(TokenKind::Number, location, Payload::Number(value)))
    }

    fn string_literal(&mut self, location: CodeLocation) -> Result<Token, Diagnostic> {
        let mut value = String::new();
        while let Some((_, ch)) = self.bump() {
            match ch {
                '"' => return Ok(Token::new(TokenKind::String, location, Payload::Text(value))),
                '\\' => {
                    let escape_location = self.location();
                    match self.bump() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, 'r')) => value.push('\r'),
                        Some((_, 't')) => value.push('\t'),
                        Some((_, '0')) => value.push('\0'),
                        Some((_, '"')) => value.push('"'),
                        Some((_, '\'')) => value.push('\''),
                        Some((_, '\\')) => value.push('\\'),
                        Some((_, other)) => {
                            return Err(Diagnostic::lex(
                                format!("unknown escape sequence `\\{other}`"),
                                escape_location,
                            ));
                        }
                        None => break,
                    }
                }
                _ => value.push(ch),
            }
        }
        Err(Diagnostic::lex("unterminated string literal", location))
    }

    /// Operator with an optional `=` compound form.
    fn operator(&mut self, location: CodeLocation, op: BinaryOp) -> Token {
        if self.match_next('=') {
            Token::new(TokenKind::Assign, location, Payload::Assign(Some(op)))
        } else {
            Token::new(TokenKind::Operator, location, Payload::Operator(op))
        }
    }

    fn simple_token(location: CodeLocation, kind: TokenKind) -> Token {
        Token::new(kind, location, Payload::None)
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, Diagnostic> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let location = self.location();
            let Some((start, ch)) = self.bump() else {
                tokens.push(Self::simple_token(location, TokenKind::Eof));
                break;
            };

            let token = match ch {
                ch if ch.is_alphabetic() || ch == '_' => self.identifier_or_keyword(start, location),
                '0'..='9' => self.number_literal(start, location)?,
                '"' => self.string_literal(location)?,
                '(' => Self::simple_token(location, TokenKind::LParen),
                ')' => Self::simple_token(location, TokenKind::RParen),
                '{' => Self::simple_token(location, TokenKind::LBrace),
                '}' => Self::simple_token(location, TokenKind::RBrace),
                ',' => Self::simple_token(location, TokenKind::Comma),
                ';' => Self::simple_token(location, TokenKind::Semicolon),
                ':' => Self::simple_token(location, TokenKind::Colon),
                '.' => Self::simple_token(location, TokenKind::Dot),
                '#' => Self::simple_token(location, TokenKind::Pound),
                '\\' => Self::simple_token(location, TokenKind::Backslash),
                '+' if self.match_next('+') => {
                    Token::new(TokenKind::Adjust, location, Payload::Number(1.0))
                }
                '-' if self.match_next('-') => {
                    Token::new(TokenKind::Adjust, location, Payload::Number(-1.0))
                }
                '+' => self.operator(location, BinaryOp::Add),
                '-' => self.operator(location, BinaryOp::Subtract),
                '*' => self.operator(location, BinaryOp::Multiply),
                '/' => self.operator(location, BinaryOp::Divide),
                '%' => self.operator(location, BinaryOp::Modulo),
                '^' => self.operator(location, BinaryOp::BitXor),
                '&' if self.match_next('&') => {
                    Token::new(TokenKind::Operator, location, Payload::Operator(BinaryOp::And))
                }
                '|' if self.match_next('|') => {
                    Token::new(TokenKind::Operator, location, Payload::Operator(BinaryOp::Or))
                }
                '&' => self.operator(location, BinaryOp::BitAnd),
                '|' => self.operator(location, BinaryOp::BitOr),
                '=' => {
                    if self.match_next('=') {
                        Token::new(TokenKind::Operator, location, Payload::Operator(BinaryOp::Equal))
                    } else {
                        Token::new(TokenKind::Assign, location, Payload::Assign(None))
                    }
                }
                '!' => {
                    if self.match_next('=') {
                        Token::new(
                            TokenKind::Operator,
                            location,
                            Payload::Operator(BinaryOp::NotEqual),
                        )
                    } else {
                        Token::new(TokenKind::UnaryOperator, location, Payload::Unary(UnaryOp::Not))
                    }
                }
                '<' => {
                    let op = if self.match_next('<') {
                        BinaryOp::ShiftLeft
                    } else if self.match_next('=') {
                        BinaryOp::LessEqual
                    } else {
                        BinaryOp::Less
                    };
                    Token::new(TokenKind::Operator, location, Payload::Operator(op))
                }
                '>' => {
                    let op = if self.match_next('>') {
                        BinaryOp::ShiftRight
                    } else if self.match_next('=') {
                        BinaryOp::GreaterEqual
                    } else {
                        BinaryOp::Greater
                    };
                    Token::new(TokenKind::Operator, location, Payload::Operator(op))
                }
                other => {
                    return Err(Diagnostic::lex(
                        format!("unexpected character `{other}`"),
                        location,
                    ));
                }
            };
            tokens.push(token);
        }
        Ok(tokens)
    }
}

/// Tokenizes `source`, tagging every location with `name`.
pub fn tokenize(name: &str, source: &str) -> Result<Vec<Token>, Diagnostic> {
    Lexer::new(name, source).tokenize()
}

fn keyword_for(ident: &str) -> Option<Keyword> {
    use self::Keyword as Kw;
    let keyword = match ident {
        "if" => Kw::If,
        "else" => Kw::Else,
        "while" => Kw::While,
        "do" => Kw::Do,
        "for" => Kw::For,
        "break" => Kw::Break,
        "continue" => Kw::Continue,
        "return" => Kw::Return,
        "switch" => Kw::Switch,
        "case" => Kw::Case,
        "default" => Kw::Default,
        "function" => Kw::Function,
        "new" => Kw::New,
        "null" => Kw::Null,
        "var" => Kw::Var,
        _ => return None,
    };
    Some(keyword)
}
