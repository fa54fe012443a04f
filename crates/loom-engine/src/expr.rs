//! Restricted condition language for CONDITION steps, step gates, and guards.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := operand (op operand)?
//! op      := == != < <= > >= contains in
//! operand := literal | path | "(" or ")"
//! path    := name ("." name | "[" integer "]" | "[" string "]")*
//! ```
//!
//! Names resolve only against the roots supplied at compile time (`input`,
//! `shared`, `variables`, ...). There are no calls and no assignment, so an
//! expression can read its scope and nothing else. The pseudo-field
//! `length` yields the size of a string, array, or object.

use std::cmp::Ordering;

use serde_json::Value;

use loom_core::error::{LoomError, Result};

const MAX_DEPTH: usize = 64;
/// Cap on operator nodes. Tree depth never exceeds it, which bounds the
/// recursion in `eval` and in dropping the tree.
const MAX_OPERATORS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String, Vec<PathSegment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

/// A compiled, validated condition.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse `source`, allowing only the given root names.
    pub fn compile(source: &str, roots: &[&str]) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(LoomError::Expression("empty expression".into()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            operators: 0,
            roots,
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(LoomError::Expression(format!(
                "unexpected token {tok:?} in `{source}`"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against a scope object whose keys are the root names.
    pub fn evaluate(&self, scope: &Value) -> Result<bool> {
        Ok(truthy(&eval(&self.expr, scope)?))
    }
}

// -- Tokenizer -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            '[' => { tokens.push(Token::LBracket); i += 1; }
            ']' => { tokens.push(Token::RBracket); i += 1; }
            '.' => { tokens.push(Token::Dot); i += 1; }
            '=' if next == Some('=') => { tokens.push(Token::Op(CompareOp::Eq)); i += 2; }
            '!' if next == Some('=') => { tokens.push(Token::Op(CompareOp::Ne)); i += 2; }
            '!' => { tokens.push(Token::Not); i += 1; }
            '<' if next == Some('=') => { tokens.push(Token::Op(CompareOp::Le)); i += 2; }
            '<' => { tokens.push(Token::Op(CompareOp::Lt)); i += 1; }
            '>' if next == Some('=') => { tokens.push(Token::Op(CompareOp::Ge)); i += 2; }
            '>' => { tokens.push(Token::Op(CompareOp::Gt)); i += 1; }
            '&' if next == Some('&') => { tokens.push(Token::And); i += 2; }
            '|' if next == Some('|') => { tokens.push(Token::Or); i += 2; }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(LoomError::Expression(format!(
                                "unterminated string in `{src}`"
                            )))
                        }
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                s.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| LoomError::Expression(format!("bad number `{text}`")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CompareOp::Contains),
                    "in" => Token::Op(CompareOp::In),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(LoomError::Expression(format!(
                    "unexpected character `{other}` in `{src}`"
                )))
            }
        }
    }
    Ok(tokens)
}

// -- Parser ----------------------------------------------------------------

struct Parser<'r> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    operators: usize,
    roots: &'r [&'r str],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(LoomError::Expression("expression nested too deeply".into()));
        }
        Ok(())
    }

    fn count_operator(&mut self) -> Result<()> {
        self.operators += 1;
        if self.operators > MAX_OPERATORS {
            return Err(LoomError::Expression(format!(
                "expression has more than {MAX_OPERATORS} operators"
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            self.count_operator()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            self.count_operator()?;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            self.descend()?;
            self.count_operator()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            self.count_operator()?;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(LoomError::Expression("expected `)`".into())),
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Value::Null)),
                _ => self.parse_path(name),
            },
            Some(tok) => Err(LoomError::Expression(format!("unexpected token {tok:?}"))),
            None => Err(LoomError::Expression("unexpected end of expression".into())),
        }
    }

    fn parse_path(&mut self, root: String) -> Result<Expr> {
        if !self.roots.contains(&root.as_str()) {
            return Err(LoomError::Expression(format!(
                "unknown name `{root}` (allowed: {})",
                self.roots.join(", ")
            )));
        }
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(key)) => segments.push(PathSegment::Key(key)),
                        _ => return Err(LoomError::Expression("expected field name after `.`".into())),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let seg = match self.advance() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            PathSegment::Index(n as usize)
                        }
                        Some(Token::Str(key)) => PathSegment::Key(key),
                        _ => return Err(LoomError::Expression("expected index or key inside `[]`".into())),
                    };
                    if self.advance() != Some(Token::RBracket) {
                        return Err(LoomError::Expression("expected `]`".into()));
                    }
                    segments.push(seg);
                }
                _ => break,
            }
        }
        Ok(Expr::Path(root, segments))
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

// -- Evaluation ------------------------------------------------------------

fn eval(expr: &Expr, scope: &Value) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(root, segments) => Ok(lookup(scope, root, segments)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?))),
        Expr::And(l, r) => {
            if !truthy(&eval(l, scope)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, scope)?)))
        }
        Expr::Or(l, r) => {
            if truthy(&eval(l, scope)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, scope)?)))
        }
        Expr::Compare(l, op, r) => {
            let left = eval(l, scope)?;
            let right = eval(r, scope)?;
            compare(&left, *op, &right).map(Value::Bool)
        }
    }
}

fn lookup(scope: &Value, root: &str, segments: &[PathSegment]) -> Value {
    let mut current = scope.get(root).cloned().unwrap_or(Value::Null);
    for seg in segments {
        current = match (seg, &current) {
            (PathSegment::Key(k), Value::Object(map)) if map.contains_key(k) => map[k].clone(),
            (PathSegment::Key(k), v) if k == "length" => match v {
                Value::String(s) => Value::from(s.chars().count()),
                Value::Array(a) => Value::from(a.len()),
                Value::Object(o) => Value::from(o.len()),
                _ => Value::Null,
            },
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    current
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| LoomError::Expression("cannot order NaN".into()))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(LoomError::Expression(format!(
            "cannot order {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

fn contains(container: &Value, item: &Value) -> bool {
    match (container, item) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), _) => items.iter().any(|v| values_equal(v, item)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool> {
    Ok(match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Lt => order(left, right)? == Ordering::Less,
        CompareOp::Le => order(left, right)? != Ordering::Greater,
        CompareOp::Gt => order(left, right)? == Ordering::Greater,
        CompareOp::Ge => order(left, right)? != Ordering::Less,
        CompareOp::Contains => contains(left, right),
        CompareOp::In => contains(right, left),
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
