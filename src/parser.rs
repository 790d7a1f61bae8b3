use crate::{
    ast::{
        BinaryOp, Expr, ExprKind, FunctionDecl, Param, Script, Stmt, StmtKind, SwitchCase, Target,
        TypeName, UnaryOp,
    },
    diagnostics::Diagnostic,
    lexer::{Keyword, Payload, Token, TokenKind},
    value::Primitive,
};

/// Parses a preprocessed token stream ending in `Eof`.
pub fn parse_script(tokens: Vec<Token>) -> Result<Script, Diagnostic> {
    Parser::new(tokens)?.parse_script()
}

struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Result<Self, Diagnostic> {
        match tokens.last() {
            Some(last) if last.is(TokenKind::Eof) => Ok(Self { tokens, current: 0 }),
            Some(last) => Err(Diagnostic::syntax(
                "token stream is missing its end marker",
                last.location.clone(),
            )),
            None => Err(Diagnostic::new(
                crate::diagnostics::DiagnosticKind::Syntax,
                "empty token stream",
            )),
        }
    }

    fn parse_script(&mut self) -> Result<Script, Diagnostic> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            statements.push(self.parse_statement()?);
        }
        Ok(Script { statements })
    }

    fn parse_statement(&mut self) -> Result<Stmt, Diagnostic> {
        let token = self.peek().clone();
        let location = token.location.clone();
        let kind = match token.kind {
            TokenKind::Keyword(Keyword::Var) => return self.parse_var_decl(),
            TokenKind::Keyword(Keyword::Function) => return self.parse_function(),
            TokenKind::Keyword(Keyword::If) => return self.parse_if(),
            TokenKind::Keyword(Keyword::While) => return self.parse_while(),
            TokenKind::Keyword(Keyword::Do) => return self.parse_do_while(),
            TokenKind::Keyword(Keyword::For) => return self.parse_for(),
            TokenKind::Keyword(Keyword::Switch) => return self.parse_switch(),
            TokenKind::Keyword(Keyword::Return) => return self.parse_return(),
            TokenKind::LBrace => {
                let statements = self.parse_block()?;
                return Ok(Stmt {
                    kind: StmtKind::Block(statements),
                    location,
                });
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                StmtKind::Break
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                StmtKind::Continue
            }
            TokenKind::Semicolon => {
                self.advance();
                return Ok(Stmt {
                    kind: StmtKind::Block(Vec::new()),
                    location,
                });
            }
            _ => return self.parse_simple_statement(true),
        };
        self.consume_optional_semicolon();
        Ok(Stmt { kind, location })
    }

    /// Assignment or expression statement, as used by statements and `for` clauses.
    fn parse_simple_statement(&mut self, allow_semicolon: bool) -> Result<Stmt, Diagnostic> {
        let location = self.peek().location.clone();
        let expr = self.parse_expression()?;
        let kind = if self.check(TokenKind::Assign) {
            let Some(target) = assignable(&expr) else {
                return Err(self.error(self.peek(), "invalid assignment target"));
            };
            let op = match self.advance().payload {
                Payload::Assign(op) => op,
                _ => None,
            };
            let value = self.parse_expression()?;
            StmtKind::Assign { target, op, value }
        } else {
            StmtKind::Expr(expr)
        };
        if allow_semicolon {
            self.consume_optional_semicolon();
        }
        Ok(Stmt { kind, location })
    }

    fn parse_var_decl(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::Var)?.location;
        let name = self.consume_identifier("expected variable name after `var`")?;
        let annotation = self.parse_annotation()?;
        let initializer = if self.check(TokenKind::Assign) {
            let token = self.advance();
            if token.payload != Payload::Assign(None) {
                return Err(self.error(&token, "expected `=` in variable declaration"));
            }
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.consume_optional_semicolon();
        Ok(Stmt {
            kind: StmtKind::Var {
                name: name.text().unwrap_or_default().to_string(),
                annotation,
                initializer,
            },
            location,
        })
    }

    fn parse_annotation(&mut self) -> Result<Option<TypeName>, Diagnostic> {
        if !self.matches(TokenKind::Colon) {
            return Ok(None);
        }
        let token = self.consume_identifier("expected template name after `:`")?;
        Ok(Some(TypeName {
            name: token.text().unwrap_or_default().to_string(),
            location: token.location,
        }))
    }

    fn parse_function(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::Function)?.location;
        let name = self.consume_identifier("expected function name")?;
        self.consume(TokenKind::LParen, "expected `(` after function name")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let param = self.consume_identifier("expected parameter name")?;
                let annotation = self.parse_annotation()?;
                params.push(Param {
                    name: param.text().unwrap_or_default().to_string(),
                    annotation,
                    location: param.location,
                });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected `)` after parameters")?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::Function(FunctionDecl {
                name: name.text().unwrap_or_default().to_string(),
                params,
                body,
            }),
            location,
        })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        self.consume(TokenKind::LBrace, "expected `{` to start block")?;
        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.is_at_end() {
            statements.push(self.parse_statement()?);
        }
        self.consume(TokenKind::RBrace, "expected `}` to close block")?;
        Ok(statements)
    }

    fn parse_if(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::If)?.location;
        let condition = self.parse_expression()?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.matches_keyword(Keyword::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            location,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::While)?.location;
        let condition = self.parse_expression()?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt {
            kind: StmtKind::While { condition, body },
            location,
        })
    }

    fn parse_do_while(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::Do)?.location;
        let body = Box::new(self.parse_statement()?);
        self.consume_keyword(Keyword::While)?;
        let condition = self.parse_expression()?;
        self.consume_optional_semicolon();
        Ok(Stmt {
            kind: StmtKind::DoWhile { body, condition },
            location,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::For)?.location;
        let parenthesized = self.matches(TokenKind::LParen);

        let init = if self.check(TokenKind::Semicolon) {
            None
        } else if self.check_keyword(Keyword::Var) {
            Some(Box::new(self.parse_var_decl_clause()?))
        } else {
            Some(Box::new(self.parse_simple_statement(false)?))
        };
        self.consume(TokenKind::Semicolon, "expected `;` after loop initializer")?;

        let condition = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume(TokenKind::Semicolon, "expected `;` after loop condition")?;

        let closing = if parenthesized {
            TokenKind::RParen
        } else {
            TokenKind::LBrace
        };
        let step = if self.check(closing) {
            None
        } else {
            Some(Box::new(self.parse_simple_statement(false)?))
        };
        if parenthesized {
            self.consume(TokenKind::RParen, "expected `)` after loop clauses")?;
        }

        let body = Box::new(self.parse_statement()?);
        Ok(Stmt {
            kind: StmtKind::For {
                init,
                condition,
                step,
                body,
            },
            location,
        })
    }

    /// `var` declaration inside a `for` header, which ends at `;` rather than consuming it.
    fn parse_var_decl_clause(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::Var)?.location;
        let name = self.consume_identifier("expected variable name after `var`")?;
        let annotation = self.parse_annotation()?;
        let initializer = if self.matches(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::Var {
                name: name.text().unwrap_or_default().to_string(),
                annotation,
                initializer,
            },
            location,
        })
    }

    fn parse_switch(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::Switch)?.location;
        let subject = self.parse_expression()?;
        self.consume(TokenKind::LBrace, "expected `{` after switch subject")?;

        let mut cases = Vec::new();
        let mut default: Option<Vec<Stmt>> = None;
        while !self.check(TokenKind::RBrace) && !self.is_at_end() {
            let label = self.advance();
            match label.kind {
                TokenKind::Keyword(Keyword::Case) => {
                    let value = self.parse_expression()?;
                    self.consume(TokenKind::Colon, "expected `:` after case value")?;
                    let body = self.parse_case_body()?;
                    cases.push(SwitchCase { value, body });
                }
                TokenKind::Keyword(Keyword::Default) => {
                    if default.is_some() {
                        return Err(self.error(&label, "switch already has a `default` label"));
                    }
                    self.consume(TokenKind::Colon, "expected `:` after `default`")?;
                    default = Some(self.parse_case_body()?);
                }
                _ => {
                    return Err(self.error(
                        &label,
                        format!("expected `case` or `default`, found {}", label.describe()),
                    ));
                }
            }
        }
        self.consume(TokenKind::RBrace, "expected `}` to close switch")?;
        Ok(Stmt {
            kind: StmtKind::Switch {
                subject,
                cases,
                default,
            },
            location,
        })
    }

    fn parse_case_body(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        let mut body = Vec::new();
        while !self.check(TokenKind::RBrace)
            && !self.check_keyword(Keyword::Case)
            && !self.check_keyword(Keyword::Default)
            && !self.is_at_end()
        {
            body.push(self.parse_statement()?);
        }
        Ok(body)
    }

    fn parse_return(&mut self) -> Result<Stmt, Diagnostic> {
        let location = self.consume_keyword(Keyword::Return)?.location;
        let value = if self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RBrace)
            || self.check_keyword(Keyword::Case)
            || self.check_keyword(Keyword::Default)
            || self.is_at_end()
        {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume_optional_semicolon();
        Ok(Stmt {
            kind: StmtKind::Return(value),
            location,
        })
    }

    fn parse_expression(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary(1)
    }

    /// Precedence climbing over left-associative binary operators.
    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().operator() {
                Some(op) if self.check(TokenKind::Operator) && op.precedence() >= min_precedence => op,
                _ => break,
            };
            let location = self.advance().location;
            let right = self.parse_binary(op.precedence() + 1)?;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                location,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.peek().clone();
        let op = match (&token.kind, &token.payload) {
            (TokenKind::UnaryOperator, Payload::Unary(op)) => Some(*op),
            (TokenKind::Operator, Payload::Operator(BinaryOp::Subtract)) => Some(UnaryOp::Negate),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                location: token.location,
            });
        }
        if token.is(TokenKind::Adjust) {
            self.advance();
            let at = self.peek().clone();
            let operand = self.parse_postfix()?;
            let Some(target) = assignable(&operand) else {
                return Err(self.error(&at, "increment target must be a variable or property"));
            };
            return Ok(Expr {
                kind: ExprKind::Update {
                    target,
                    delta: token.number().unwrap_or(1.0),
                    prefix: true,
                },
                location: token.location,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, Diagnostic> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(TokenKind::Dot) {
                self.advance();
                let name = self.consume_identifier("expected member name after `.`")?;
                let receiver = Box::new(expr);
                let member = name.text().unwrap_or_default().to_string();
                let kind = if self.check(TokenKind::LParen) {
                    ExprKind::Member {
                        receiver,
                        name: member,
                        args: self.parse_arguments()?,
                    }
                } else {
                    ExprKind::Property { receiver, name: member }
                };
                expr = Expr {
                    kind,
                    location: name.location,
                };
            } else if self.check(TokenKind::Adjust) {
                let Some(target) = assignable(&expr) else {
                    return Err(self.error(self.peek(), "increment target must be a variable or property"));
                };
                let token = self.advance();
                expr = Expr {
                    kind: ExprKind::Update {
                        target,
                        delta: token.number().unwrap_or(1.0),
                        prefix: false,
                    },
                    location: expr.location,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.advance();
        let location = token.location.clone();
        let kind = match (&token.kind, token.payload) {
            (TokenKind::Number, Payload::Number(value)) => ExprKind::Literal(Primitive::Number(value)),
            (TokenKind::String, Payload::Text(text)) => ExprKind::Literal(Primitive::string(text)),
            (TokenKind::Constant, Payload::Constant(value)) => ExprKind::Literal(value),
            (TokenKind::Keyword(Keyword::Null), _) => ExprKind::Literal(Primitive::Null),
            (TokenKind::SystemMacro, Payload::Text(name)) => ExprKind::SystemMacro(name),
            (TokenKind::Identifier, Payload::Text(name)) => {
                if self.check(TokenKind::LParen) {
                    let args = self.parse_arguments()?;
                    ExprKind::Call { name, args }
                } else {
                    ExprKind::Variable(name)
                }
            }
            (TokenKind::Keyword(Keyword::New), _) => {
                let template = self.consume_identifier("expected template name after `new`")?;
                if !self.check(TokenKind::LParen) {
                    return Err(self.error(self.peek(), "expected `(` after template name"));
                }
                let args = self.parse_arguments()?;
                ExprKind::New {
                    template: template.text().unwrap_or_default().to_string(),
                    args,
                }
            }
            (TokenKind::LParen, _) => {
                let inner = self.parse_expression()?;
                self.consume(TokenKind::RParen, "expected `)` after expression")?;
                return Ok(inner);
            }
            (_, payload) => {
                let found = Token::new(token.kind, location, payload);
                return Err(self.error(
                    &found,
                    format!("expected expression, found {}", found.describe()),
                ));
            }
        };
        Ok(Expr { kind, location })
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, Diagnostic> {
        self.consume(TokenKind::LParen, "expected `(`")?;
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected `)` after arguments")?;
        Ok(args)
    }

    fn consume_optional_semicolon(&mut self) {
        while self.matches(TokenKind::Semicolon) {}
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn matches_keyword(&mut self, keyword: Keyword) -> bool {
        self.matches(TokenKind::Keyword(keyword))
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().is(kind)
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.peek().is_keyword(keyword)
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token, Diagnostic> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(
                self.peek(),
                format!("{message}, found {}", self.peek().describe()),
            ))
        }
    }

    fn consume_keyword(&mut self, keyword: Keyword) -> Result<Token, Diagnostic> {
        self.consume(
            TokenKind::Keyword(keyword),
            &format!("expected `{}`", keyword.as_str()),
        )
    }

    fn consume_identifier(&mut self, message: &str) -> Result<Token, Diagnostic> {
        self.consume(TokenKind::Identifier, message)
    }

    /// Returns the current token and moves past it; `Eof` is never consumed.
    fn advance(&mut self) -> Token {
        let token = self.tokens[self.current].clone();
        if !self.is_at_end() {
            self.current += 1;
        }
        token
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn is_at_end(&self) -> bool {
        self.peek().is(TokenKind::Eof)
    }

    fn error(&self, token: &Token, message: impl Into<String>) -> Diagnostic {
        Diagnostic::syntax(message, token.location.clone())
    }
}

/// The assignment target an expression denotes, if it denotes one.
fn assignable(expr: &Expr) -> Option<Target> {
    match &expr.kind {
        ExprKind::Variable(name) => Some(Target::Variable(name.clone())),
        ExprKind::Property { receiver, name } => Some(Target::Property {
            receiver: receiver.clone(),
            name: name.clone(),
        }),
        _ => None,
    }
}
