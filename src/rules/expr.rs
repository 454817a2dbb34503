//! Condition expressions
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := sum ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" ) sum )?
//! sum     := primary ( "+" primary )*
//! primary := literal | "[" list "]" | "(" or ")" | call | variable
//! ```
//!
//! Variables are dotted paths rooted at `auth`, `resource`, `request`, or a
//! variable bound by the rule's path pattern. `request.tenant` is the
//! partition the request runs against.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde_json::{Number, Value};

use crate::storage::lookup_dotted;

use super::context::EvaluationContext;
use super::errors::{RulesError, RulesResult};
use super::functions::Builtin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A parsed condition
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    /// Dotted variable reference, split on `.`
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

// ----------------------------------------------------------------------
// Tokens
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(Number),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
}

struct Lexed {
    token: Token,
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Lexed>, (usize, String)> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        let (token, width) = match (c, next) {
            (c, _) if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('!', _) => (Token::Bang, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('"', _) | ('\'', _) => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err((position, "unterminated string".into())),
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, '\\')) => {
                            let escaped = match chars.get(j + 1) {
                                Some((_, 'n')) => '\n',
                                Some((_, 't')) => '\t',
                                Some((_, ch)) => *ch,
                                None => return Err((position, "unterminated string".into())),
                            };
                            text.push(escaped);
                            j += 2;
                        }
                        Some((_, ch)) => {
                            text.push(*ch);
                            j += 1;
                        }
                    }
                }
                (Token::Str(text), j + 1 - i)
            }
            (c, _) if c.is_ascii_digit() => {
                let mut j = i;
                while chars.get(j).map_or(false, |(_, ch)| ch.is_ascii_digit() || *ch == '.') {
                    j += 1;
                }
                let start = position;
                let end = chars.get(j).map_or(source.len(), |(p, _)| *p);
                let text = &source[start..end];
                let number = if text.contains('.') {
                    text.parse::<f64>().ok().and_then(Number::from_f64)
                } else {
                    text.parse::<i64>().ok().map(Number::from)
                };
                match number {
                    Some(n) => (Token::Num(n), j - i),
                    None => return Err((position, format!("invalid number '{}'", text))),
                }
            }
            (c, _) if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while chars
                    .get(j)
                    .map_or(false, |(_, ch)| ch.is_ascii_alphanumeric() || *ch == '_')
                {
                    j += 1;
                }
                let end = chars.get(j).map_or(source.len(), |(p, _)| *p);
                (Token::Ident(source[position..end].to_string()), j - i)
            }
            (c, _) => return Err((position, format!("unexpected character '{}'", c))),
        };

        tokens.push(Lexed { token, position });
        i += width;
    }
    Ok(tokens)
}

// ----------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------

const ROOTS: [&str; 3] = ["auth", "resource", "request"];

struct Parser<'r> {
    rule: &'r str,
    source_len: usize,
    tokens: Vec<Lexed>,
    cursor: usize,
    bindings: &'r HashSet<String>,
}

impl<'r> Parser<'r> {
    fn error(&self, position: usize, message: impl Into<String>) -> RulesError {
        RulesError::ConditionSyntax {
            rule: self.rule.to_string(),
            position,
            message: message.into(),
        }
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map_or(self.source_len, |t| t.position)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|t| &t.token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> RulesResult<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(self.position(), format!("expected {}", what)))
        }
    }

    fn parse_or(&mut self) -> RulesResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> RulesResult<Expr> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> RulesResult<Expr> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> RulesResult<Expr> {
        let left = self.parse_sum()?;
        let op = match self.peek() {
            Some(Token::EqEq) => CompareOp::Eq,
            Some(Token::NotEq) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            Some(Token::Ident(word)) if word == "in" => {
                self.cursor += 1;
                let right = self.parse_sum()?;
                return Ok(Expr::In(Box::new(left), Box::new(right)));
            }
            _ => return Ok(left),
        };
        self.cursor += 1;
        let right = self.parse_sum()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_sum(&mut self) -> RulesResult<Expr> {
        let mut left = self.parse_primary()?;
        while self.eat(&Token::Plus) {
            let right = self.parse_primary()?;
            left = Expr::Add(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> RulesResult<Expr> {
        let position = self.position();
        let Some(token) = self.peek().cloned() else {
            return Err(self.error(position, "unexpected end of condition"));
        };
        self.cursor += 1;

        match token {
            Token::Str(text) => Ok(Expr::Literal(Value::String(text))),
            Token::Num(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Minus => match self.peek().cloned() {
                Some(Token::Num(n)) => {
                    self.cursor += 1;
                    let negated = n
                        .as_i64()
                        .and_then(|i| i.checked_neg())
                        .map(Number::from)
                        .or_else(|| n.as_f64().and_then(|f| Number::from_f64(-f)));
                    negated
                        .map(|n| Expr::Literal(Value::Number(n)))
                        .ok_or_else(|| self.error(position, "invalid number"))
                }
                _ => Err(self.error(position, "'-' must precede a number")),
            },
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma, "',' or ']'")?;
                    }
                }
                Ok(Expr::List(items))
            }
            Token::Ident(word) => self.parse_identifier(word, position),
            other => Err(self.error(position, format!("unexpected {:?}", other))),
        }
    }

    fn parse_identifier(&mut self, word: String, position: usize) -> RulesResult<Expr> {
        match word.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        if self.eat(&Token::LParen) {
            let mut args = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    args.push(self.parse_or()?);
                    if self.eat(&Token::RParen) {
                        break;
                    }
                    self.expect(Token::Comma, "',' or ')'")?;
                }
            }
            let builtin = Builtin::resolve(&word).ok_or_else(|| RulesError::UnknownFunction {
                rule: self.rule.to_string(),
                name: word.clone(),
            })?;
            if builtin.arity() != args.len() {
                return Err(RulesError::ArityMismatch {
                    rule: self.rule.to_string(),
                    name: word,
                    expected: builtin.arity(),
                    found: args.len(),
                });
            }
            return Ok(Expr::Call(builtin, args));
        }

        if !ROOTS.contains(&word.as_str()) && !self.bindings.contains(&word) {
            return Err(self.error(position, format!("unknown variable '{}'", word)));
        }

        let mut path = vec![word];
        while self.eat(&Token::Dot) {
            match self.peek().cloned() {
                Some(Token::Ident(part)) => {
                    self.cursor += 1;
                    path.push(part);
                }
                _ => return Err(self.error(self.position(), "expected field name after '.'")),
            }
        }
        Ok(Expr::Var(path))
    }
}

/// Parse `source` for the rule named `rule`, whose path pattern binds
/// `bindings`.
pub fn parse(rule: &str, source: &str, bindings: &HashSet<String>) -> RulesResult<Expr> {
    let tokens = tokenize(source).map_err(|(position, message)| RulesError::ConditionSyntax {
        rule: rule.to_string(),
        position,
        message,
    })?;
    let mut parser = Parser {
        rule,
        source_len: source.len(),
        tokens,
        cursor: 0,
        bindings,
    };
    let expr = parser.parse_or()?;
    if parser.cursor < parser.tokens.len() {
        return Err(parser.error(parser.position(), "unexpected trailing input"));
    }
    Ok(expr)
}

// ----------------------------------------------------------------------
// Evaluation
// ----------------------------------------------------------------------

/// State for evaluating conditions against one request.
pub(crate) struct Scope<'s, 'a> {
    pub ctx: &'s EvaluationContext<'a>,
    pub bindings: &'s HashMap<String, String>,
    /// Cleared when a condition reads anything outside the cache key
    cacheable: Cell<bool>,
}

impl<'s, 'a> Scope<'s, 'a> {
    pub fn new(ctx: &'s EvaluationContext<'a>, bindings: &'s HashMap<String, String>) -> Self {
        Self {
            ctx,
            bindings,
            cacheable: Cell::new(true),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable.get()
    }

    /// A condition holds only when it evaluates to `true`.
    pub fn holds(&self, expr: &Expr) -> bool {
        matches!(self.eval(expr), Some(Value::Bool(true)))
    }

    /// `None` when the expression is ill-typed for these inputs.
    pub fn eval(&self, expr: &Expr) -> Option<Value> {
        match expr {
            Expr::Literal(value) => Some(value.clone()),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Expr::Var(path) => Some(self.resolve(path)),
            Expr::Not(inner) => match self.eval(inner)? {
                Value::Bool(b) => Some(Value::Bool(!b)),
                _ => None,
            },
            Expr::And(left, right) => match self.eval(left)? {
                Value::Bool(false) => Some(Value::Bool(false)),
                Value::Bool(true) => match self.eval(right)? {
                    Value::Bool(b) => Some(Value::Bool(b)),
                    _ => None,
                },
                _ => None,
            },
            Expr::Or(left, right) => match self.eval(left)? {
                Value::Bool(true) => Some(Value::Bool(true)),
                Value::Bool(false) => match self.eval(right)? {
                    Value::Bool(b) => Some(Value::Bool(b)),
                    _ => None,
                },
                _ => None,
            },
            Expr::Compare(op, left, right) => {
                let (left, right) = (self.eval(left)?, self.eval(right)?);
                let result = match op {
                    CompareOp::Eq => values_equal(&left, &right),
                    CompareOp::Ne => !values_equal(&left, &right),
                    CompareOp::Lt => compare(&left, &right)? == Ordering::Less,
                    CompareOp::Le => compare(&left, &right)? != Ordering::Greater,
                    CompareOp::Gt => compare(&left, &right)? == Ordering::Greater,
                    CompareOp::Ge => compare(&left, &right)? != Ordering::Less,
                };
                Some(Value::Bool(result))
            }
            Expr::In(needle, haystack) => {
                let (needle, haystack) = (self.eval(needle)?, self.eval(haystack)?);
                let found = match (&needle, &haystack) {
                    (_, Value::Array(items)) => items.iter().any(|item| values_equal(item, &needle)),
                    (Value::String(key), Value::Object(fields)) => fields.contains_key(key),
                    (Value::String(part), Value::String(whole)) => whole.contains(part.as_str()),
                    _ => return None,
                };
                Some(Value::Bool(found))
            }
            Expr::Add(left, right) => add(self.eval(left)?, self.eval(right)?),
            Expr::Call(builtin, args) => {
                if builtin.reads_storage() {
                    self.cacheable.set(false);
                }
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Option<Vec<_>>>()?;
                builtin.call(&args, self.ctx)
            }
        }
    }

    /// Missing data resolves to null.
    fn resolve(&self, path: &[String]) -> Value {
        let (root, rest) = match path.split_first() {
            Some(split) => split,
            None => return Value::Null,
        };

        let base = match root.as_str() {
            "auth" => match self.ctx.auth {
                Some(auth) => auth.to_value(),
                None => return Value::Null,
            },
            "resource" => {
                self.cacheable.set(false);
                match self.ctx.resource {
                    Some(doc) => serde_json::json!({
                        "id": doc.id,
                        "path": doc.path.as_str(),
                        "version": doc.version,
                        "data": doc.data,
                    }),
                    None => return Value::Null,
                }
            }
            // The tenant is part of the cache key; the payload is not.
            "request" if rest.len() == 1 && rest[0] == "tenant" => {
                return self
                    .ctx
                    .tenant
                    .map_or(Value::Null, |tenant| Value::String(tenant.to_string()));
            }
            "request" => {
                self.cacheable.set(false);
                serde_json::json!({
                    "data": self.ctx.request_data,
                    "tenant": self.ctx.tenant,
                })
            }
            bound => match self.bindings.get(bound) {
                Some(value) => Value::String(value.clone()),
                None => return Value::Null,
            },
        };

        if rest.is_empty() {
            return base;
        }
        lookup_dotted(&base, &rest.join("."))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn add(a: Value, b: Value) -> Option<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x.checked_add(y).map(Value::from);
            }
            Number::from_f64(x.as_f64()? + y.as_f64()?).map(Value::Number)
        }
        (Value::String(mut x), Value::String(y)) => {
            x.push_str(&y);
            Some(Value::String(x))
        }
        (Value::Array(mut xs), Value::Array(ys)) => {
            xs.extend(ys);
            Some(Value::Array(xs))
        }
        _ => None,
    }
}
