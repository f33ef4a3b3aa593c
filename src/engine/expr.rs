//! Sandboxed expression interpreter
//!
//! Evaluates the small JavaScript-flavoured expression language used by
//! `js:` assertions and `{{js: ...}}` substitution tokens. There is no
//! access to the host beyond an explicit [`Scope`]: bound identifiers,
//! `Math`, `Date.now()`, a handful of conversion functions and, when the
//! scope allows it, read-only environment variables.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr        := logical_or ('?' expr ':' expr)?
//! logical_or  := logical_and ('||' logical_and)*
//! logical_and := equality ('&&' equality)*
//! equality    := relational (('==' | '!=' | '===' | '!==') relational)*
//! relational  := additive (('<' | '>' | '<=' | '>=') additive)*
//! additive    := term (('+' | '-') term)*
//! term        := unary (('*' | '/' | '%') unary)*
//! unary       := ('!' | '-' | '+' | 'typeof') unary | postfix
//! postfix     := primary ('.' ident | '[' expr ']' | '(' args ')')*
//! primary     := number | string | ident | 'true' | 'false' | 'null'
//!              | 'undefined' | '(' expr ')'
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use thiserror::Error;

use super::variables::Vars;

/// Errors raised while parsing or evaluating an expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("SyntaxError: {message} at position {position}")]
    Syntax { message: String, position: usize },

    #[error("ReferenceError: {0} is not defined")]
    Reference(String),

    #[error("TypeError: {0}")]
    Type(String),
}

impl ExprError {
    fn syntax(message: impl Into<String>, position: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            position,
        }
    }
}

type EvalResult = std::result::Result<Value, ExprError>;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Built-in namespaces reachable from expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Math,
    Date,
    Env,
    Variables,
}

/// Callable built-ins
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    Global(&'static str),
    Math(&'static str),
    DateNow,
    StringMethod { receiver: String, name: &'static str },
    NumberMethod { receiver: f64, name: &'static str },
}

/// A runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Namespace(Namespace),
    Function(Function),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Value {
    /// JavaScript truthiness
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Namespace(_) | Value::Function(_) => true,
        }
    }

    /// JavaScript `Number(value)`
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Namespace(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// JavaScript `typeof`
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Namespace(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Namespace(ns) => write!(f, "[object {:?}]", ns),
            Value::Function(_) => write!(f, "function () {{ [native code] }}"),
        }
    }
}

/// Format a number the way JavaScript prints it
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// JavaScript `Number(string)`: whole-string conversion, NaN on junk
fn string_to_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN);
    }
    let valid = t
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !valid {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// JavaScript `parseFloat`: longest leading decimal literal, NaN if none
pub fn parse_float_prefix(s: &str) -> f64 {
    let t = s.trim_start();
    let rest = t.strip_prefix(['+', '-']).unwrap_or(t);
    if rest.starts_with("Infinity") {
        return if t.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    let bytes = t.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    let mantissa = &t[digits_start..end];
    if mantissa.is_empty() || mantissa == "." {
        return f64::NAN;
    }
    // Optional exponent, only if followed by digits
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    t[..end].parse::<f64>().unwrap_or(f64::NAN)
}

/// JavaScript `parseInt`
fn parse_int_prefix(s: &str, radix: Option<u32>) -> f64 {
    let t = s.trim_start();
    let (negative, mut rest) = match t.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    let mut radix = radix.unwrap_or(10);
    if radix == 16 || radix == 10 {
        if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
            rest = hex;
            radix = 16;
        }
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let digits: String = rest.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let mut value = 0f64;
    for c in digits.chars() {
        value = value * radix as f64 + c.to_digit(radix).unwrap_or(0) as f64;
    }
    if negative {
        -value
    } else {
        value
    }
}

/// JavaScript abstract equality (`==`)
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (x, y) if x.is_nullish() || y.is_nullish() => x.is_nullish() && y.is_nullish(),
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(n), Value::Str(s)) | (Value::Str(s), Value::Number(n)) => {
            *n == string_to_number(s)
        }
        (Value::Bool(_), _) => loose_eq(&Value::Number(a.to_number()), b),
        (_, Value::Bool(_)) => loose_eq(a, &Value::Number(b.to_number())),
        (Value::Namespace(x), Value::Namespace(y)) => x == y,
        _ => false,
    }
}

/// JavaScript strict equality (`===`)
pub fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Namespace(x), Value::Namespace(y)) => x == y,
        _ => false,
    }
}

/// JavaScript relational comparison; `None` when either side is NaN
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        return Some(x.cmp(y));
    }
    a.to_number().partial_cmp(&b.to_number())
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The closed set of identifiers an expression may see
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: HashMap<String, Value>,
    variables: Vars,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an identifier
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Expose a read-only `variables` namespace over a snapshot
    pub fn with_variables(mut self, variables: Vars) -> Self {
        self.variables = variables;
        self.bindings
            .insert("variables".to_string(), Value::Namespace(Namespace::Variables));
        self
    }

    /// Expose the process environment as a read-only `env` namespace
    pub fn with_env(mut self) -> Self {
        self.bindings
            .insert("env".to_string(), Value::Namespace(Namespace::Env));
        self
    }

    /// Whether an identifier is bound (built-ins excluded)
    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Value bound to an identifier (built-ins excluded)
    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.get(name) {
            return Some(value.clone());
        }
        let builtin = match name {
            "Math" => Value::Namespace(Namespace::Math),
            "Date" => Value::Namespace(Namespace::Date),
            "NaN" => Value::Number(f64::NAN),
            "Infinity" => Value::Number(f64::INFINITY),
            "parseInt" | "parseFloat" | "String" | "Number" | "Boolean" | "isNaN" => {
                Value::Function(Function::Global(global_name(name)))
            }
            _ => return None,
        };
        Some(builtin)
    }
}

/// Whether `name` is one of the always-available globals
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "Math"
            | "Date"
            | "NaN"
            | "Infinity"
            | "parseInt"
            | "parseFloat"
            | "String"
            | "Number"
            | "Boolean"
            | "isNaN"
    )
}

fn global_name(name: &str) -> &'static str {
    match name {
        "parseInt" => "parseInt",
        "parseFloat" => "parseFloat",
        "String" => "String",
        "Number" => "Number",
        "Boolean" => "Boolean",
        _ => "isNaN",
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    span: Range<usize>,
}

const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "(",
    ")", "[", "]", ".", ",", "?", ":",
];

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;

        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text = &src[start..i];
            let value = text
                .parse::<f64>()
                .map_err(|_| ExprError::syntax(format!("Invalid number '{}'", text), start))?;
            tokens.push(Token {
                tok: Tok::Number(value),
                span: start..i,
            });
            continue;
        }

        if c == b'\'' || c == b'"' || c == b'`' {
            let (value, end) = read_string(src, i)?;
            i = end;
            tokens.push(Token {
                tok: Tok::Str(value),
                span: start..i,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c >= 0x80 {
            let rest = &src[i..];
            let len = rest
                .char_indices()
                .find(|(_, ch)| !(ch.is_alphanumeric() || *ch == '_' || *ch == '$'))
                .map(|(idx, _)| idx)
                .unwrap_or(rest.len());
            if len == 0 {
                let ch = rest.chars().next().unwrap_or('?');
                return Err(ExprError::syntax(
                    format!("Unexpected character '{}'", ch),
                    start,
                ));
            }
            i += len;
            tokens.push(Token {
                tok: Tok::Ident(src[start..i].to_string()),
                span: start..i,
            });
            continue;
        }

        let punct = PUNCTUATORS
            .iter()
            .find(|p| src[i..].starts_with(**p))
            .ok_or_else(|| {
                let ch = src[i..].chars().next().unwrap_or('?');
                ExprError::syntax(format!("Unexpected character '{}'", ch), i)
            })?;
        i += punct.len();
        tokens.push(Token {
            tok: Tok::Punct(*punct),
            span: start..i,
        });
    }

    Ok(tokens)
}

fn read_string(src: &str, start: usize) -> std::result::Result<(String, usize), ExprError> {
    let mut chars = src[start..].char_indices();
    let quote = chars.next().map(|(_, q)| q).unwrap_or('"');
    let mut value = String::new();

    while let Some((offset, ch)) = chars.next() {
        if ch == quote {
            return Ok((value, start + offset + ch.len_utf8()));
        }
        if ch == '\\' {
            match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, '0')) => value.push('\0'),
                Some((_, other)) => value.push(other),
                None => break,
            }
        } else {
            value.push(ch);
        }
    }

    Err(ExprError::syntax("Unterminated string literal", start))
}

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Short-circuit operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalOp::And => "&&",
            LogicalOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Logical(LogicalOp, Box<Node>, Box<Node>),
    Conditional(Box<Node>, Box<Node>, Box<Node>),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Call(Box<Node>, Vec<Node>),
}

/// A syntax tree node with its source span
#[derive(Debug, Clone)]
pub struct Node {
    expr: Expr,
    span: Range<usize>,
}

impl Node {
    fn new(expr: Expr, span: Range<usize>) -> Self {
        Self { expr, span }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Tok::Punct(q)) if *q == p)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.span.start)
            .unwrap_or(self.len)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> std::result::Result<usize, ExprError> {
        if let Some(token) = self.tokens.get(self.pos) {
            if token.tok == Tok::Punct(punct_static(p)) {
                self.pos += 1;
                return Ok(token.span.end);
            }
        }
        Err(ExprError::syntax(format!("Expected '{}'", p), self.position()))
    }

    fn expression(&mut self) -> std::result::Result<Node, ExprError> {
        let test = self.logical_or()?;
        if self.eat_punct("?") {
            let then = self.expression()?;
            self.expect_punct(":")?;
            let otherwise = self.expression()?;
            let span = test.span.start..otherwise.span.end;
            return Ok(Node::new(
                Expr::Conditional(Box::new(test), Box::new(then), Box::new(otherwise)),
                span,
            ));
        }
        Ok(test)
    }

    fn logical_or(&mut self) -> std::result::Result<Node, ExprError> {
        self.logical_level(LogicalOp::Or, Self::logical_and)
    }

    fn logical_and(&mut self) -> std::result::Result<Node, ExprError> {
        self.logical_level(LogicalOp::And, Self::equality)
    }

    fn logical_level(
        &mut self,
        op: LogicalOp,
        next: fn(&mut Self) -> std::result::Result<Node, ExprError>,
    ) -> std::result::Result<Node, ExprError> {
        let mut left = next(self)?;
        while self.eat_punct(op.as_str()) {
            let right = next(self)?;
            let span = left.span.start..right.span.end;
            left = Node::new(Expr::Logical(op, Box::new(left), Box::new(right)), span);
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> std::result::Result<Node, ExprError>,
    ) -> std::result::Result<Node, ExprError> {
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in ops {
                if self.eat_punct(symbol) {
                    let right = next(self)?;
                    let span = left.span.start..right.span.end;
                    left = Node::new(Expr::Binary(*op, Box::new(left), Box::new(right)), span);
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn equality(&mut self) -> std::result::Result<Node, ExprError> {
        self.binary_level(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNotEq),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::NotEq),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> std::result::Result<Node, ExprError> {
        self.binary_level(
            &[
                ("<=", BinaryOp::LtEq),
                (">=", BinaryOp::GtEq),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> std::result::Result<Node, ExprError> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::term)
    }

    fn term(&mut self) -> std::result::Result<Node, ExprError> {
        self.binary_level(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> std::result::Result<Node, ExprError> {
        let start = self.position();
        let op = match self.peek() {
            Some(Tok::Punct("!")) => Some(UnaryOp::Not),
            Some(Tok::Punct("-")) => Some(UnaryOp::Neg),
            Some(Tok::Punct("+")) => Some(UnaryOp::Plus),
            Some(Tok::Ident(name)) if name == "typeof" => Some(UnaryOp::TypeOf),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let operand = self.unary()?;
            let span = start..operand.span.end;
            return Ok(Node::new(Expr::Unary(op, Box::new(operand)), span));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> std::result::Result<Node, ExprError> {
        let mut node = self.primary()?;
        loop {
            if self.eat_punct(".") {
                match self.advance() {
                    Some(Token {
                        tok: Tok::Ident(name),
                        span,
                    }) => {
                        let full = node.span.start..span.end;
                        node = Node::new(Expr::Member(Box::new(node), name), full);
                    }
                    _ => {
                        return Err(ExprError::syntax(
                            "Expected property name after '.'",
                            self.position(),
                        ))
                    }
                }
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                let end = self.expect_punct("]")?;
                let full = node.span.start..end;
                node = Node::new(Expr::Index(Box::new(node), Box::new(index)), full);
            } else if self.eat_punct("(") {
                let mut args = Vec::new();
                if !self.at_punct(")") {
                    loop {
                        args.push(self.expression()?);
                        if !self.eat_punct(",") {
                            break;
                        }
                    }
                }
                let end = self.expect_punct(")")?;
                let full = node.span.start..end;
                node = Node::new(Expr::Call(Box::new(node), args), full);
            } else {
                return Ok(node);
            }
        }
    }

    fn primary(&mut self) -> std::result::Result<Node, ExprError> {
        let position = self.position();
        let token = self
            .advance()
            .ok_or_else(|| ExprError::syntax("Unexpected end of expression", position))?;
        let span = token.span.clone();
        let expr = match token.tok {
            Tok::Number(n) => Expr::Literal(Value::Number(n)),
            Tok::Str(s) => Expr::Literal(Value::Str(s)),
            Tok::Ident(name) => match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                "undefined" => Expr::Literal(Value::Undefined),
                _ => Expr::Ident(name),
            },
            Tok::Punct("(") => {
                let inner = self.expression()?;
                let end = self.expect_punct(")")?;
                // Keep the parentheses in the span so operand text reads naturally
                return Ok(Node::new(inner.expr, span.start..end));
            }
            Tok::Punct(p) => {
                return Err(ExprError::syntax(format!("Unexpected token '{}'", p), span.start))
            }
        };
        Ok(Node::new(expr, span))
    }
}

fn punct_static(p: &str) -> &'static str {
    PUNCTUATORS.iter().find(|q| **q == p).copied().unwrap_or("")
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// A parsed expression, ready to evaluate against any [`Scope`]
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    root: Node,
}

impl Program {
    /// Parse an expression
    pub fn parse(source: &str) -> std::result::Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: source.len(),
        };
        let root = parser.expression()?;
        if parser.pos < parser.tokens.len() {
            return Err(ExprError::syntax("Unexpected trailing input", parser.position()));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the whole expression
    pub fn evaluate(&self, scope: &Scope) -> EvalResult {
        eval(&self.root, scope)
    }

    /// Evaluate a sub-node of this program
    pub fn evaluate_node(&self, node: &Node, scope: &Scope) -> EvalResult {
        eval(node, scope)
    }

    /// Source text of a sub-node
    pub fn text(&self, node: &Node) -> &str {
        self.source
            .get(node.span.clone())
            .map(str::trim)
            .unwrap_or("")
    }

    /// Operands of a top-level `&&`/`||` chain, flattened left to right
    ///
    /// Returns `None` when the root is not a logical operator.
    pub fn logical_operands(&self) -> Option<(LogicalOp, Vec<&Node>)> {
        let op = match &self.root.expr {
            Expr::Logical(op, _, _) => *op,
            _ => return None,
        };
        let mut operands = Vec::new();
        flatten_logical(&self.root, op, &mut operands);
        Some((op, operands))
    }

    /// Free identifiers referenced by the expression, in first-use order
    pub fn identifiers(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_identifiers(&self.root, &mut names);
        names
    }
}

fn flatten_logical<'a>(node: &'a Node, op: LogicalOp, out: &mut Vec<&'a Node>) {
    match &node.expr {
        Expr::Logical(inner, left, right) if *inner == op => {
            flatten_logical(left, op, out);
            flatten_logical(right, op, out);
        }
        _ => out.push(node),
    }
}

fn collect_identifiers(node: &Node, out: &mut Vec<String>) {
    match &node.expr {
        Expr::Literal(_) => {}
        Expr::Ident(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        Expr::Unary(_, inner) | Expr::Member(inner, _) => collect_identifiers(inner, out),
        Expr::Binary(_, l, r) | Expr::Logical(_, l, r) | Expr::Index(l, r) => {
            collect_identifiers(l, out);
            collect_identifiers(r, out);
        }
        Expr::Conditional(a, b, c) => {
            collect_identifiers(a, out);
            collect_identifiers(b, out);
            collect_identifiers(c, out);
        }
        Expr::Call(callee, args) => {
            collect_identifiers(callee, out);
            for arg in args {
                collect_identifiers(arg, out);
            }
        }
    }
}

/// Parse and evaluate in one go
pub fn evaluate(source: &str, scope: &Scope) -> EvalResult {
    Program::parse(source)?.evaluate(scope)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(node: &Node, scope: &Scope) -> EvalResult {
    match &node.expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => scope
            .lookup(name)
            .ok_or_else(|| ExprError::Reference(name.clone())),
        Expr::Unary(op, operand) => {
            if *op == UnaryOp::TypeOf {
                if let Expr::Ident(name) = &operand.expr {
                    return Ok(Value::Str(
                        scope
                            .lookup(name)
                            .map(|v| v.type_name())
                            .unwrap_or("undefined")
                            .to_string(),
                    ));
                }
            }
            let value = eval(operand, scope)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!value.truthy()),
                UnaryOp::Neg => Value::Number(-value.to_number()),
                UnaryOp::Plus => Value::Number(value.to_number()),
                UnaryOp::TypeOf => Value::Str(value.type_name().to_string()),
            })
        }
        Expr::Logical(op, left, right) => {
            let l = eval(left, scope)?;
            match (op, l.truthy()) {
                (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(l),
                _ => eval(right, scope),
            }
        }
        Expr::Binary(op, left, right) => {
            let l = eval(left, scope)?;
            let r = eval(right, scope)?;
            Ok(binary(*op, &l, &r))
        }
        Expr::Conditional(test, then, otherwise) => {
            if eval(test, scope)?.truthy() {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Expr::Member(object, property) => {
            let target = eval(object, scope)?;
            member(&target, property, scope)
        }
        Expr::Index(object, index) => {
            let target = eval(object, scope)?;
            let key = eval(index, scope)?;
            if let (Value::Str(s), Value::Number(n)) = (&target, &key) {
                let idx = *n as usize;
                return Ok(s
                    .chars()
                    .nth(idx)
                    .filter(|_| n.fract() == 0.0 && *n >= 0.0)
                    .map(|c| Value::Str(c.to_string()))
                    .unwrap_or(Value::Undefined));
            }
            member(&target, &key.to_string(), scope)
        }
        Expr::Call(callee, args) => {
            let function = eval(callee, scope)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, scope)?);
            }
            match function {
                Value::Function(f) => call(&f, &values),
                other => Err(ExprError::Type(format!(
                    "{} is not a function",
                    describe_callee(callee, &other)
                ))),
            }
        }
    }
}

fn describe_callee(node: &Node, value: &Value) -> String {
    match &node.expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member(_, prop) => prop.clone(),
        _ => value.to_string(),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::Eq => Value::Bool(loose_eq(l, r)),
        BinaryOp::NotEq => Value::Bool(!loose_eq(l, r)),
        BinaryOp::StrictEq => Value::Bool(strict_eq(l, r)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_eq(l, r)),
        BinaryOp::Lt => Value::Bool(compare(l, r) == Some(Ordering::Less)),
        BinaryOp::Gt => Value::Bool(compare(l, r) == Some(Ordering::Greater)),
        BinaryOp::LtEq => Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::GtEq => Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Add => {
            if matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)) {
                Value::Str(format!("{}{}", l, r))
            } else {
                Value::Number(l.to_number() + r.to_number())
            }
        }
        BinaryOp::Sub => Value::Number(l.to_number() - r.to_number()),
        BinaryOp::Mul => Value::Number(l.to_number() * r.to_number()),
        BinaryOp::Div => Value::Number(l.to_number() / r.to_number()),
        BinaryOp::Rem => Value::Number(l.to_number() % r.to_number()),
    }
}

const STRING_METHODS: &[&str] = &[
    "includes",
    "startsWith",
    "endsWith",
    "indexOf",
    "toLowerCase",
    "toUpperCase",
    "trim",
    "substring",
    "slice",
    "padStart",
    "charAt",
    "toString",
];

const MATH_FUNCTIONS: &[&str] = &[
    "floor", "ceil", "round", "abs", "min", "max", "random", "pow", "sqrt", "trunc", "sign",
];

fn member(target: &Value, property: &str, scope: &Scope) -> EvalResult {
    match target {
        Value::Undefined | Value::Null => Err(ExprError::Type(format!(
            "Cannot read properties of {} (reading '{}')",
            target, property
        ))),
        Value::Str(s) => {
            if property == "length" {
                return Ok(Value::Number(s.chars().count() as f64));
            }
            Ok(STRING_METHODS
                .iter()
                .find(|m| **m == property)
                .map(|name| {
                    Value::Function(Function::StringMethod {
                        receiver: s.clone(),
                        name: *name,
                    })
                })
                .unwrap_or(Value::Undefined))
        }
        Value::Number(n) => Ok(["toString", "toFixed"]
            .iter()
            .find(|m| **m == property)
            .map(|name| {
                Value::Function(Function::NumberMethod {
                    receiver: *n,
                    name: *name,
                })
            })
            .unwrap_or(Value::Undefined)),
        Value::Namespace(Namespace::Math) => Ok(match property {
            "PI" => Value::Number(std::f64::consts::PI),
            "E" => Value::Number(std::f64::consts::E),
            _ => MATH_FUNCTIONS
                .iter()
                .find(|m| **m == property)
                .map(|name| Value::Function(Function::Math(*name)))
                .unwrap_or(Value::Undefined),
        }),
        Value::Namespace(Namespace::Date) => Ok(if property == "now" {
            Value::Function(Function::DateNow)
        } else {
            Value::Undefined
        }),
        Value::Namespace(Namespace::Env) => Ok(std::env::var(property)
            .map(Value::Str)
            .unwrap_or(Value::Undefined)),
        Value::Namespace(Namespace::Variables) => Ok(scope
            .variables
            .get(property)
            .map(|v| Value::Str(v.clone()))
            .unwrap_or(Value::Undefined)),
        Value::Bool(_) | Value::Function(_) => Ok(Value::Undefined),
    }
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

/// Clamp a relative index the way `String.prototype.slice` does
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let n = value.to_number();
    if n.is_nan() {
        return 0;
    }
    let n = n.trunc();
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        (n as usize).min(len)
    }
}

/// Clamp an index the way `String.prototype.substring` does
fn absolute_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let n = value.to_number();
    if n.is_nan() || n < 0.0 {
        0
    } else {
        (n.trunc() as usize).min(len)
    }
}

/// `Math.min`/`Math.max`: NaN is contagious
fn fold_numbers(args: &[Value], init: f64, pick: fn(f64, f64) -> f64) -> f64 {
    args.iter().map(Value::to_number).fold(init, |acc, v| {
        if acc.is_nan() || v.is_nan() {
            f64::NAN
        } else {
            pick(acc, v)
        }
    })
}

fn call(function: &Function, args: &[Value]) -> EvalResult {
    match function {
        Function::Global(name) => Ok(match *name {
            "parseInt" => {
                let radix = match arg(args, 1) {
                    Value::Undefined => None,
                    v => Some(v.to_number() as u32),
                };
                Value::Number(parse_int_prefix(&arg(args, 0).to_string(), radix))
            }
            "parseFloat" => Value::Number(parse_float_prefix(&arg(args, 0).to_string())),
            "String" => Value::Str(if args.is_empty() {
                String::new()
            } else {
                arg(args, 0).to_string()
            }),
            "Number" => Value::Number(if args.is_empty() {
                0.0
            } else {
                arg(args, 0).to_number()
            }),
            "Boolean" => Value::Bool(arg(args, 0).truthy()),
            _ => Value::Bool(arg(args, 0).to_number().is_nan()),
        }),
        Function::DateNow => Ok(Value::Number(
            chrono::Utc::now().timestamp_millis() as f64,
        )),
        Function::Math(name) => {
            let x = arg(args, 0).to_number();
            Ok(Value::Number(match *name {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                "round" => (x + 0.5).floor(),
                "abs" => x.abs(),
                "sqrt" => x.sqrt(),
                "trunc" => x.trunc(),
                "sign" => {
                    if x.is_nan() || x == 0.0 {
                        x
                    } else {
                        x.signum()
                    }
                }
                "pow" => x.powf(arg(args, 1).to_number()),
                "random" => rand::random::<f64>(),
                "min" => fold_numbers(args, f64::INFINITY, f64::min),
                _ => fold_numbers(args, f64::NEG_INFINITY, f64::max),
            }))
        }
        Function::NumberMethod { receiver, name } => Ok(Value::Str(match *name {
            "toFixed" => {
                let digits = arg(args, 0).to_number();
                let digits = if digits.is_nan() { 0 } else { digits as usize };
                format!("{:.*}", digits.min(100), receiver)
            }
            _ => format_number(*receiver),
        })),
        Function::StringMethod { receiver, name } => string_method(receiver, name, args),
    }
}

/// Longest string `padStart` will build
const MAX_PAD_LENGTH: usize = 10_000;

fn string_method(s: &str, name: &str, args: &[Value]) -> EvalResult {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let needle = || arg(args, 0).to_string();

    Ok(match name {
        "includes" => Value::Bool(s.contains(&needle())),
        "startsWith" => Value::Bool(s.starts_with(&needle())),
        "endsWith" => Value::Bool(s.ends_with(&needle())),
        "indexOf" => Value::Number(
            s.find(&needle())
                .map(|byte| s[..byte].chars().count() as f64)
                .unwrap_or(-1.0),
        ),
        "toLowerCase" => Value::Str(s.to_lowercase()),
        "toUpperCase" => Value::Str(s.to_uppercase()),
        "trim" => Value::Str(s.trim().to_string()),
        "charAt" => {
            let idx = absolute_index(&arg(args, 0), len, 0);
            Value::Str(chars.get(idx).map(|c| c.to_string()).unwrap_or_default())
        }
        "substring" => {
            let a = absolute_index(&arg(args, 0), len, 0);
            let b = absolute_index(&arg(args, 1), len, len);
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            Value::Str(chars[start..end].iter().collect())
        }
        "slice" => {
            let start = relative_index(&arg(args, 0), len, 0);
            let end = relative_index(&arg(args, 1), len, len);
            Value::Str(if start < end {
                chars[start..end].iter().collect()
            } else {
                String::new()
            })
        }
        "padStart" => {
            let target = arg(args, 0).to_number();
            let target = if target.is_nan() { 0 } else { target as usize };
            let target = target.min(MAX_PAD_LENGTH);
            let fill = match arg(args, 1) {
                Value::Undefined => " ".to_string(),
                v => v.to_string(),
            };
            if target <= len || fill.is_empty() {
                Value::Str(s.to_string())
            } else {
                let pad: String = fill.chars().cycle().take(target - len).collect();
                Value::Str(format!("{}{}", pad, s))
            }
        }
        _ => Value::Str(s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        let mut scope = Scope::new();
        scope
            .bind("RESULT_CODE", "0")
            .bind("SESSION_ID", "abc123")
            .bind("COUNT", "12");
        scope
    }

    fn eval_str(src: &str) -> Value {
        evaluate(src, &scope()).unwrap()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval_str("1 + 2 * 3"), Value::Number(7.0));
        assert_eq!(eval_str("(1 + 2) * 3"), Value::Number(9.0));
        assert_eq!(eval_str("-4 % 3"), Value::Number(-1.0));
        assert_eq!(eval_str("10 / 4"), Value::Number(2.5));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(eval_str("'id-' + 1 + 2"), Value::Str("id-12".into()));
        assert_eq!(eval_str("COUNT + 1"), Value::Str("121".into()));
        assert_eq!(eval_str("Number(COUNT) + 1"), Value::Number(13.0));
    }

    #[test]
    fn test_loose_equality() {
        assert_eq!(eval_str("RESULT_CODE == 0"), Value::Bool(true));
        assert_eq!(eval_str("RESULT_CODE === 0"), Value::Bool(false));
        assert_eq!(eval_str("RESULT_CODE === '0'"), Value::Bool(true));
        assert_eq!(eval_str("null == undefined"), Value::Bool(true));
        assert_eq!(eval_str("'' == 0"), Value::Bool(true));
        assert_eq!(eval_str("true == 1"), Value::Bool(true));
    }

    #[test]
    fn test_relational() {
        assert_eq!(eval_str("COUNT > 9"), Value::Bool(true));
        // string vs string compares lexicographically
        assert_eq!(eval_str("COUNT > '9'"), Value::Bool(false));
        assert_eq!(eval_str("'abc' < 5"), Value::Bool(false));
    }

    #[test]
    fn test_logical_returns_operand() {
        assert_eq!(eval_str("'' || 'fallback'"), Value::Str("fallback".into()));
        assert_eq!(eval_str("SESSION_ID && RESULT_CODE"), Value::Str("0".into()));
        assert_eq!(eval_str("RESULT_CODE == 1 ? 'bad' : 'ok'"), Value::Str("ok".into()));
    }

    #[test]
    fn test_string_members() {
        assert_eq!(eval_str("SESSION_ID.length"), Value::Number(6.0));
        assert_eq!(eval_str("SESSION_ID.startsWith('abc')"), Value::Bool(true));
        assert_eq!(eval_str("SESSION_ID.toUpperCase()"), Value::Str("ABC123".into()));
        assert_eq!(eval_str("SESSION_ID.substring(3)"), Value::Str("123".into()));
        assert_eq!(eval_str("SESSION_ID.slice(-3)"), Value::Str("123".into()));
        assert_eq!(eval_str("SESSION_ID.indexOf('c')"), Value::Number(2.0));
        assert_eq!(eval_str("'7'.padStart(3, '0')"), Value::Str("007".into()));
        assert_eq!(eval_str("SESSION_ID[0]"), Value::Str("a".into()));
    }

    #[test]
    fn test_pad_start_length_is_capped() {
        assert_eq!(
            eval_str("'x'.padStart(1000000000000).length"),
            Value::Number(10_000.0)
        );
        assert_eq!(eval_str("'x'.padStart(1 / 0, '-').length"), Value::Number(10_000.0));
        assert_eq!(eval_str("'x'.padStart(-5)"), Value::Str("x".into()));
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval_str("Math.floor(2.7)"), Value::Number(2.0));
        assert_eq!(eval_str("Math.max(1, 5, 3)"), Value::Number(5.0));
        assert_eq!(eval_str("parseInt('42px')"), Value::Number(42.0));
        assert_eq!(eval_str("parseFloat('3.5e2x')"), Value::Number(350.0));
        assert_eq!(eval_str("isNaN(parseInt('x'))"), Value::Bool(true));
        assert_eq!(eval_str("String(12.0)"), Value::Str("12".into()));
        assert_eq!(eval_str("(1.005).toFixed(1)"), Value::Str("1.0".into()));
        assert!(matches!(eval_str("Date.now()"), Value::Number(n) if n > 1.0e12));
        let r = eval_str("Math.random()");
        assert!(matches!(r, Value::Number(n) if (0.0..1.0).contains(&n)));
    }

    #[test]
    fn test_unknown_identifier_is_reference_error() {
        let err = evaluate("MISSING == 1", &scope()).unwrap_err();
        assert_eq!(err, ExprError::Reference("MISSING".to_string()));
        assert_eq!(err.to_string(), "ReferenceError: MISSING is not defined");
        assert_eq!(eval_str("typeof MISSING"), Value::Str("undefined".into()));
    }

    #[test]
    fn test_no_host_access_by_default() {
        let err = evaluate("env.HOME", &scope()).unwrap_err();
        assert!(matches!(err, ExprError::Reference(_)));
        let err = evaluate("require('fs')", &scope()).unwrap_err();
        assert!(matches!(err, ExprError::Reference(_)));
    }

    #[test]
    fn test_member_on_undefined_is_type_error() {
        let err = evaluate("undefined.length", &scope()).unwrap_err();
        assert!(matches!(err, ExprError::Type(_)));
        let err = evaluate("SESSION_ID.nope()", &scope()).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: nope is not a function");
    }

    #[test]
    fn test_variables_namespace() {
        let mut vars = Vars::new();
        vars.insert("USER".to_string(), "alice".to_string());
        let scope = Scope::new().with_variables(vars);
        assert_eq!(
            evaluate("variables.USER + '!'", &scope).unwrap(),
            Value::Str("alice!".into())
        );
        assert_eq!(evaluate("variables.NOPE", &scope).unwrap(), Value::Undefined);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            Program::parse("1 +").unwrap_err(),
            ExprError::Syntax { .. }
        ));
        assert!(matches!(
            Program::parse("'open").unwrap_err(),
            ExprError::Syntax { .. }
        ));
        assert!(matches!(
            Program::parse("a = 1").unwrap_err(),
            ExprError::Syntax { .. }
        ));
        assert!(matches!(
            Program::parse("(1 + 2").unwrap_err(),
            ExprError::Syntax { .. }
        ));
    }

    #[test]
    fn test_logical_operands() {
        let program =
            Program::parse("RESULT_CODE == 0 && SESSION_ID.length > 0 && (COUNT > 1 || false)")
                .unwrap();
        let (op, operands) = program.logical_operands().unwrap();
        assert_eq!(op, LogicalOp::And);
        let texts: Vec<&str> = operands.iter().map(|n| program.text(n)).collect();
        assert_eq!(
            texts,
            vec!["RESULT_CODE == 0", "SESSION_ID.length > 0", "(COUNT > 1 || false)"]
        );
        assert!(Program::parse("1 == 1").unwrap().logical_operands().is_none());
    }

    #[test]
    fn test_identifiers() {
        let program = Program::parse("A == 1 && B.length > A && Math.abs(C) > 0").unwrap();
        assert_eq!(program.identifiers(), vec!["A", "B", "Math", "C"]);
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(1e15), "1000000000000000");
    }

    #[test]
    fn test_parse_float_prefix() {
        assert_eq!(parse_float_prefix("  12.5abc"), 12.5);
        assert_eq!(parse_float_prefix("-3"), -3.0);
        assert_eq!(parse_float_prefix(".5"), 0.5);
        assert_eq!(parse_float_prefix("1e"), 1.0);
        assert!(parse_float_prefix("abc").is_nan());
        assert!(parse_float_prefix("").is_nan());
    }
}
