//! Token-to-token rewriting pass run before parsing: directives, macros,
//! preprocessor builtins, host constants and system-macro marking.

use std::fmt;

use log::trace;

use crate::{
    ast::UnaryOp,
    diagnostics::{CodeLocation, Diagnostic},
    engine::Engine,
    lexer::{Keyword, Payload, Token, TokenKind},
    registry::CallHolder,
    value::Primitive,
};

/// Signature of a preprocessor builtin. It receives the raw argument groups
/// and returns the tokens that replace the invocation.
pub type BuiltinFn = fn(&Preprocessor<'_>, &Token, &[Vec<Token>]) -> Result<Vec<Token>, Diagnostic>;

#[derive(Clone)]
pub struct PreprocessorBuiltin {
    pub name: String,
    pub arity: usize,
    pub callback: BuiltinFn,
}

impl PreprocessorBuiltin {
    pub fn new(name: impl Into<String>, arity: usize, callback: BuiltinFn) -> Self {
        Self {
            name: name.into(),
            arity,
            callback,
        }
    }
}

impl fmt::Debug for PreprocessorBuiltin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<preprocessor builtin {}/{}>", self.name, self.arity)
    }
}

/// `defined(NAME)`: true when NAME is a macro, a host builtin or a system macro.
pub fn builtin_defined(
    preprocessor: &Preprocessor<'_>,
    call: &Token,
    args: &[Vec<Token>],
) -> Result<Vec<Token>, Diagnostic> {
    let group = args.first().map(Vec::as_slice).unwrap_or_default();
    let name = match group {
        [] => return Err(Diagnostic::syntax("`defined` expects a name", call.location.clone())),
        [token] if token.is(TokenKind::Identifier) => token.text().unwrap_or_default(),
        [token] => {
            return Err(Diagnostic::syntax(
                format!("`defined` expects an identifier, found {}", token.describe()),
                token.location.clone(),
            ));
        }
        [_, extra, ..] => {
            return Err(Diagnostic::syntax(
                format!("`defined` expects a single name, found {}", extra.describe()),
                extra.location.clone(),
            ));
        }
    };
    let defined = preprocessor.is_macro(name) || preprocessor.engine().has_symbol(name);
    Ok(vec![constant(call, Primitive::Boolean(defined))])
}

#[derive(Debug, Clone)]
pub struct Macro {
    pub name: String,
    /// `None` for object-like macros.
    pub params: Option<Vec<String>>,
    pub body: Vec<Token>,
    pub location: CodeLocation,
}

#[derive(Debug)]
struct Conditional {
    /// Whether the enclosing region was active when this block opened.
    parent_active: bool,
    /// Whether any branch of this block has been taken so far.
    taken: bool,
    active: bool,
    seen_else: bool,
    location: CodeLocation,
}

pub struct Preprocessor<'e> {
    engine: &'e Engine,
    macros: CallHolder<Macro>,
    conditionals: Vec<Conditional>,
}

/// Runs the preprocessor over a full token stream.
pub fn preprocess(engine: &Engine, tokens: Vec<Token>) -> Result<Vec<Token>, Diagnostic> {
    Preprocessor::new(engine).run(tokens)
}

impl<'e> Preprocessor<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            macros: CallHolder::new(),
            conditionals: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn is_macro(&self, name: &str) -> bool {
        self.macros.has_name(name)
    }

    pub fn macros(&self) -> &CallHolder<Macro> {
        &self.macros
    }

    fn active(&self) -> bool {
        self.conditionals.last().is_none_or(|block| block.active)
    }

    pub fn run(&mut self, tokens: Vec<Token>) -> Result<Vec<Token>, Diagnostic> {
        let mut output = Vec::with_capacity(tokens.len());
        let mut cursor = Cursor::new(&tokens);
        loop {
            if !cursor.is_rescanning() {
                let Some(token) = tokens.get(cursor.pos) else {
                    break;
                };
                match token.kind {
                    TokenKind::Pound => {
                        let (line, next) = directive_line(&tokens, cursor.pos);
                        self.directive(token, &line)?;
                        cursor.pos = next;
                        continue;
                    }
                    TokenKind::Eof => {
                        if let Some(open) = self.conditionals.last() {
                            return Err(Diagnostic::syntax(
                                "conditional block is missing `#endif`",
                                open.location.clone(),
                            ));
                        }
                        output.push(Pending::fresh(token.clone()));
                        break;
                    }
                    _ if !self.active() => {
                        cursor.pos += 1;
                        continue;
                    }
                    _ => {}
                }
            }
            let Some(item) = cursor.next() else {
                break;
            };
            self.expand(item, &mut cursor, &mut output)?;
        }
        trace!("preprocessed into {} tokens", output.len());
        Ok(output.into_iter().map(|item| item.token).collect())
    }

    fn directive(&mut self, pound: &Token, line: &[Token]) -> Result<(), Diagnostic> {
        let Some(head) = line.first() else {
            return Err(Diagnostic::syntax("expected a directive name after `#`", pound.location.clone()));
        };
        let name = match (&head.kind, head.text()) {
            (TokenKind::Identifier, Some(text)) => text,
            (TokenKind::Keyword(keyword), _) => keyword.as_str(),
            _ => {
                return Err(Diagnostic::syntax(
                    format!("expected a directive name, found {}", head.describe()),
                    head.location.clone(),
                ));
            }
        };
        let rest = &line[1..];
        let active = self.active();

        match name {
            "if" | "ifdef" | "ifndef" => {
                let condition = if !active {
                    false
                } else if name == "if" {
                    self.evaluate_condition(head, rest)?
                } else {
                    let defined = self.defined_name(head, rest)?;
                    if name == "ifdef" { defined } else { !defined }
                };
                self.conditionals.push(Conditional {
                    parent_active: active,
                    taken: condition,
                    active: active && condition,
                    seen_else: false,
                    location: head.location.clone(),
                });
            }
            "else" => {
                let Some(block) = self.conditionals.last_mut() else {
                    return Err(Diagnostic::syntax("`#else` without `#if`", head.location.clone()));
                };
                if block.seen_else {
                    return Err(Diagnostic::syntax("duplicate `#else`", head.location.clone()));
                }
                block.seen_else = true;
                block.active = block.parent_active && !block.taken;
                block.taken = true;
            }
            "endif" => {
                if self.conditionals.pop().is_none() {
                    return Err(Diagnostic::syntax("`#endif` without `#if`", head.location.clone()));
                }
            }
            _ if !active => {}
            "define" => self.define(head, rest)?,
            "undef" => {
                self.defined_name(head, rest)?;
                if let Some(text) = rest.first().and_then(Token::text) {
                    self.macros.remove_name(text);
                }
            }
            "error" => {
                let message = rest
                    .iter()
                    .map(|token| match (&token.kind, token.text()) {
                        (TokenKind::String, Some(text)) => text.to_string(),
                        _ => token.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                return Err(Diagnostic::syntax(message, pound.location.clone()));
            }
            other => {
                return Err(Diagnostic::syntax(
                    format!("unknown directive `#{other}`"),
                    head.location.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Checks the single-name operand of `#ifdef`/`#ifndef`/`#undef`.
    fn defined_name(&self, head: &Token, rest: &[Token]) -> Result<bool, Diagnostic> {
        match rest {
            [] => Err(Diagnostic::syntax("expected a name", head.location.clone())),
            [token, ..] if !token.is(TokenKind::Identifier) => Err(Diagnostic::syntax(
                format!("expected a name, found {}", token.describe()),
                token.location.clone(),
            )),
            [token] => {
                let name = token.text().unwrap_or_default();
                Ok(self.is_macro(name) || self.engine.has_symbol(name))
            }
            [_, extra, ..] => Err(Diagnostic::syntax(
                format!("unexpected {} after name", extra.describe()),
                extra.location.clone(),
            )),
        }
    }

    fn define(&mut self, head: &Token, rest: &[Token]) -> Result<(), Diagnostic> {
        let Some(name_token) = rest.first() else {
            return Err(Diagnostic::syntax("expected macro name after `#define`", head.location.clone()));
        };
        let Some(name) = name_token.text().filter(|_| name_token.is(TokenKind::Identifier)) else {
            return Err(Diagnostic::syntax(
                format!("expected macro name, found {}", name_token.describe()),
                name_token.location.clone(),
            ));
        };

        let mut body_start = 1;
        let params = match rest.get(1) {
            Some(paren) if paren.is(TokenKind::LParen) && touches(name_token, name, paren) => {
                let mut params: Vec<String> = Vec::new();
                let mut index = 2;
                loop {
                    let Some(token) = rest.get(index) else {
                        return Err(Diagnostic::syntax(
                            "unterminated macro parameter list",
                            paren.location.clone(),
                        ));
                    };
                    index += 1;
                    match token.kind {
                        TokenKind::RParen if params.is_empty() => break,
                        TokenKind::Identifier => {
                            let param = token.text().unwrap_or_default().to_string();
                            if params.contains(&param) {
                                return Err(Diagnostic::syntax(
                                    format!("duplicate macro parameter `{param}`"),
                                    token.location.clone(),
                                ));
                            }
                            params.push(param);
                            match rest.get(index).map(|next| next.kind) {
                                Some(TokenKind::Comma) => index += 1,
                                Some(TokenKind::RParen) => {
                                    index += 1;
                                    break;
                                }
                                _ => {
                                    let at = rest.get(index).unwrap_or(token);
                                    return Err(Diagnostic::syntax(
                                        "expected `,` or `)` in macro parameter list",
                                        at.location.clone(),
                                    ));
                                }
                            }
                        }
                        _ => {
                            return Err(Diagnostic::syntax(
                                format!("expected parameter name, found {}", token.describe()),
                                token.location.clone(),
                            ));
                        }
                    }
                }
                body_start = index;
                Some(params)
            }
            _ => None,
        };

        let arity = params.as_ref().map_or(0, Vec::len);
        let definition = Macro {
            name: name.to_string(),
            params,
            body: rest[body_start..].to_vec(),
            location: name_token.location.clone(),
        };
        self.macros
            .register(name, arity, definition)
            .map_err(|_| {
                Diagnostic::compiler(
                    format!("macro `{name}` with {arity} parameter(s) is already defined"),
                    name_token.location.clone(),
                )
            })
    }

    /// Expands one token. Macro output is queued back onto `cursor` so it is
    /// rescanned together with the tokens that follow the invocation.
    fn expand(&self, item: Pending, cursor: &mut Cursor<'_>, output: &mut Vec<Pending>) -> Result<(), Diagnostic> {
        let name = match (&item.token.kind, item.token.text()) {
            (TokenKind::Identifier, Some(name)) if !item.hides(name) => name.to_string(),
            _ => {
                output.push(item);
                return Ok(());
            }
        };
        let location = item.token.location.clone();
        let has_parens = cursor.peek().is_some_and(|next| next.is(TokenKind::LParen));

        let builtins = self.engine.preprocessor_builtins();
        if builtins.has_name(&name) {
            let args = if has_parens {
                collect_arguments(cursor, &location)?
            } else {
                Vec::new()
            };
            let Some(builtin) = builtins.lookup(&name, args.len()) else {
                let expected = builtins
                    .arities(&name)
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" or ");
                return Err(Diagnostic::syntax(
                    format!("`{name}` expects {expected} argument(s), found {}", args.len()),
                    location,
                ));
            };
            let args = args
                .into_iter()
                .map(|group| group.into_iter().map(|arg| arg.token).collect::<Vec<_>>())
                .collect::<Vec<_>>();
            let replacement = (builtin.callback)(self, &item.token, &args)?;
            output.extend(replacement.into_iter().map(Pending::fresh));
            return Ok(());
        }

        if self.macros.has_name(&name) {
            let function_like = self
                .macros
                .iter()
                .any(|(macro_name, _, definition)| macro_name == name && definition.params.is_some());
            if has_parens && function_like {
                let args = collect_arguments(cursor, &location)?;
                let definition = self
                    .macros
                    .lookup(&name, args.len())
                    .filter(|definition| definition.params.is_some())
                    .ok_or_else(|| {
                        Diagnostic::syntax(
                            format!("macro `{name}` does not take {} argument(s)", args.len()),
                            location.clone(),
                        )
                    })?;
                let mut expanded_args = Vec::with_capacity(args.len());
                for arg in args {
                    expanded_args.push(self.expand_all(arg)?);
                }
                let hidden = item.hidden_with(&name);
                cursor.requeue(substitute(definition, &expanded_args, &hidden));
                return Ok(());
            }
            if let Some(definition) = self
                .macros
                .lookup(&name, 0)
                .filter(|definition| definition.params.is_none())
            {
                let hidden = item.hidden_with(&name);
                cursor.requeue(substitute(definition, &[], &hidden));
                return Ok(());
            }
        }

        if !has_parens {
            if let Some(value) = self.engine.constant(&name) {
                output.push(Pending::fresh(constant(&item.token, value.clone())));
                return Ok(());
            }
            if self.engine.system_macro(&name).is_some() {
                output.push(Pending::fresh(Token::new(
                    TokenKind::SystemMacro,
                    location,
                    Payload::Text(name),
                )));
                return Ok(());
            }
        }

        output.push(item);
        Ok(())
    }

    /// Fully expands a detached token list, such as a macro argument.
    fn expand_all(&self, tokens: Vec<Pending>) -> Result<Vec<Pending>, Diagnostic> {
        let mut cursor = Cursor::detached(tokens);
        let mut output = Vec::new();
        while let Some(item) = cursor.next() {
            self.expand(item, &mut cursor, &mut output)?;
        }
        Ok(output)
    }

    fn evaluate_condition(&self, head: &Token, rest: &[Token]) -> Result<bool, Diagnostic> {
        let expanded = self
            .expand_all(rest.iter().cloned().map(Pending::fresh).collect())?
            .into_iter()
            .map(|item| item.token)
            .collect::<Vec<_>>();
        let mut evaluator = ConditionEvaluator {
            tokens: &expanded,
            pos: 0,
            fallback: head.location.clone(),
        };
        let value = evaluator.expression(1)?;
        if let Some(extra) = expanded.get(evaluator.pos) {
            return Err(Diagnostic::syntax(
                format!("unexpected {} in `#if` condition", extra.describe()),
                extra.location.clone(),
            ));
        }
        match value {
            Primitive::Boolean(value) => Ok(value),
            Primitive::Number(value) => Ok(value != 0.0),
            other => Err(Diagnostic::syntax(
                format!("`#if` condition must be a Boolean or Number, found {}", other.type_name()),
                head.location.clone(),
            )),
        }
    }
}

/// Tokens after `#` up to the end of the line; a trailing `\` joins the next line.
fn directive_line(tokens: &[Token], pound: usize) -> (Vec<Token>, usize) {
    let mut line = Vec::new();
    let mut pos = pound + 1;
    let mut current_line = tokens[pound].location.line;
    while let Some(token) = tokens.get(pos) {
        if token.is(TokenKind::Eof) {
            break;
        }
        if token.location.line != current_line {
            match line.last() {
                Some(last) if Token::is(last, TokenKind::Backslash) => {
                    line.pop();
                    current_line = token.location.line;
                }
                _ => break,
            }
        }
        line.push(token.clone());
        pos += 1;
    }
    if line.last().is_some_and(|last| last.is(TokenKind::Backslash)) {
        line.pop();
    }
    (line, pos)
}

/// Whether `paren` immediately follows the macro name with no whitespace.
fn touches(name_token: &Token, name: &str, paren: &Token) -> bool {
    name_token.location.line == paren.location.line
        && name_token.location.column + name.chars().count() as u32 == paren.location.column
}

/// A token on its way through expansion, tagged with the macros whose
/// expansion produced it. Those macros are not expanded again inside it.
#[derive(Debug, Clone)]
struct Pending {
    token: Token,
    hidden: Vec<String>,
}

impl Pending {
    fn fresh(token: Token) -> Self {
        Self {
            token,
            hidden: Vec::new(),
        }
    }

    fn hides(&self, name: &str) -> bool {
        self.hidden.iter().any(|hidden| hidden == name)
    }

    fn hidden_with(&self, name: &str) -> Vec<String> {
        let mut hidden = self.hidden.clone();
        if !self.hides(name) {
            hidden.push(name.to_string());
        }
        hidden
    }

    fn hidden_under(&self, names: &[String]) -> Self {
        let mut item = self.clone();
        for name in names {
            if !item.hides(name) {
                item.hidden.push(name.clone());
            }
        }
        item
    }
}

/// Reads source tokens, serving queued expansion output first. `Eof` is
/// never handed out.
struct Cursor<'t> {
    source: &'t [Token],
    pos: usize,
    /// Stored in reverse so the next token is at the end.
    queued: Vec<Pending>,
}

impl<'t> Cursor<'t> {
    fn new(source: &'t [Token]) -> Self {
        Self {
            source,
            pos: 0,
            queued: Vec::new(),
        }
    }

    fn detached(tokens: Vec<Pending>) -> Self {
        let mut cursor = Self::new(&[]);
        cursor.requeue(tokens);
        cursor
    }

    fn is_rescanning(&self) -> bool {
        !self.queued.is_empty()
    }

    fn peek(&self) -> Option<&Token> {
        match self.queued.last() {
            Some(item) => Some(&item.token),
            None => self.source.get(self.pos).filter(|token| !token.is(TokenKind::Eof)),
        }
    }

    fn next(&mut self) -> Option<Pending> {
        if let Some(item) = self.queued.pop() {
            return Some(item);
        }
        let token = self.source.get(self.pos).filter(|token| !token.is(TokenKind::Eof))?;
        self.pos += 1;
        Some(Pending::fresh(token.clone()))
    }

    /// Puts `tokens` in front of everything not yet read.
    fn requeue(&mut self, tokens: Vec<Pending>) {
        self.queued.extend(tokens.into_iter().rev());
    }
}

/// Reads `( a, (b, c), d )` from the cursor into top-level argument groups.
fn collect_arguments(cursor: &mut Cursor<'_>, call: &CodeLocation) -> Result<Vec<Vec<Pending>>, Diagnostic> {
    let open = match cursor.next() {
        Some(open) if open.token.is(TokenKind::LParen) => open,
        _ => return Err(Diagnostic::syntax("expected `(`", call.clone())),
    };
    let mut groups: Vec<Vec<Pending>> = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0usize;
    while let Some(item) = cursor.next() {
        match item.token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen if depth == 0 => {
                if !current.is_empty() || !groups.is_empty() {
                    if current.is_empty() {
                        return Err(Diagnostic::syntax("empty argument", item.token.location));
                    }
                    groups.push(current);
                }
                return Ok(groups);
            }
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                if current.is_empty() {
                    return Err(Diagnostic::syntax("empty argument", item.token.location));
                }
                groups.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(item);
    }
    Err(Diagnostic::syntax("unterminated argument list", open.token.location))
}

/// Macro body with parameters replaced, every token hidden under `hidden`.
fn substitute(definition: &Macro, args: &[Vec<Pending>], hidden: &[String]) -> Vec<Pending> {
    let params = definition.params.as_deref().unwrap_or_default();
    let mut body = Vec::with_capacity(definition.body.len());
    for token in &definition.body {
        let position = match (&token.kind, token.text()) {
            (TokenKind::Identifier, Some(name)) => params.iter().position(|param| param == name),
            _ => None,
        };
        match position.and_then(|index| args.get(index)) {
            Some(arg) => body.extend(arg.iter().map(|item| item.hidden_under(hidden))),
            None => body.push(Pending {
                token: token.clone(),
                hidden: hidden.to_vec(),
            }),
        }
    }
    body
}

fn constant(at: &Token, value: Primitive) -> Token {
    Token::new(TokenKind::Constant, at.location.clone(), Payload::Constant(value))
}

/// Evaluates the expanded tokens of an `#if` line.
struct ConditionEvaluator<'t> {
    tokens: &'t [Token],
    pos: usize,
    fallback: CodeLocation,
}

impl ConditionEvaluator<'_> {
    fn expression(&mut self, min_precedence: u8) -> Result<Primitive, Diagnostic> {
        let tokens = self.tokens;
        let mut left = self.unary()?;
        while let Some(token) = tokens.get(self.pos) {
            let op = match token.operator() {
                Some(op) if token.is(TokenKind::Operator) && op.precedence() >= min_precedence => op,
                _ => break,
            };
            self.pos += 1;
            let right = self.expression(op.precedence() + 1)?;
            left = left
                .binary(op, &right)
                .map_err(|err| Diagnostic::syntax(err.message, token.location.clone()))?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Primitive, Diagnostic> {
        let tokens = self.tokens;
        let Some(token) = tokens.get(self.pos) else {
            return Err(Diagnostic::syntax("expected an expression", self.fallback.clone()));
        };
        self.pos += 1;
        let op = match (&token.kind, &token.payload) {
            (TokenKind::UnaryOperator, Payload::Unary(op)) => Some(*op),
            (TokenKind::Operator, Payload::Operator(crate::ast::BinaryOp::Subtract)) => {
                Some(UnaryOp::Negate)
            }
            _ => None,
        };
        if let Some(op) = op {
            let operand = self.unary()?;
            return operand
                .unary(op)
                .map_err(|err| Diagnostic::syntax(err.message, token.location.clone()));
        }
        match (&token.kind, &token.payload) {
            (TokenKind::Number, Payload::Number(value)) => Ok(Primitive::Number(*value)),
            (TokenKind::String, Payload::Text(text)) => Ok(Primitive::string(text.as_str())),
            (TokenKind::Constant, Payload::Constant(value)) => Ok(value.clone()),
            (TokenKind::Keyword(Keyword::Null), _) => Ok(Primitive::Null),
            (TokenKind::LParen, _) => {
                let value = self.expression(1)?;
                match tokens.get(self.pos) {
                    Some(close) if close.is(TokenKind::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    Some(other) => Err(Diagnostic::syntax(
                        format!("expected `)`, found {}", other.describe()),
                        other.location.clone(),
                    )),
                    None => Err(Diagnostic::syntax("expected `)`", token.location.clone())),
                }
            }
            (TokenKind::Identifier, _) => Err(Diagnostic::syntax(
                format!("unknown identifier {} in `#if` condition", token.describe()),
                token.location.clone(),
            )),
            _ => Err(Diagnostic::syntax(
                format!("unexpected {} in `#if` condition", token.describe()),
                token.location.clone(),
            )),
        }
    }
}
