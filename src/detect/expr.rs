// src/detect/expr.rs
//!
//! Sandboxed predicate language over the event document.
//!
//! Conditions are boolean expressions with equality, list membership,
//! string methods (`contains`, `startsWith`, `endsWith`, `matches`), a
//! collection quantifier (`exists(x, pred)`) and dotted field access rooted
//! at the free variable `event`:
//!
//! ```text
//! event.process.exe in ['/bin/bash', '/bin/sh'] && event.container.namespace == 'prod'
//! event.process.capabilities_added.exists(c, c == 'SYS_ADMIN')
//! ```
//!
//! Conditions are compiled once into an AST (regexes included) and then
//! evaluated directly against the typed `RuntimeEvent`, with no JSON
//! round-trip per event. Field access through an absent sub-document or to
//! an unknown field yields an `EvalError` the engine recovers from per rule.

use regex::Regex;
use std::fmt;

use crate::model::{ContainerInfo, NetworkInfo, ProcessInfo, RuntimeEvent};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
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
    BangEq,
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_none() {
                    return Err("expected '&&'".to_string());
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_none() {
                    return Err("expected '||'".to_string());
                }
                tokens.push(Token::OrOr);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::BangEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err("expected '=='".to_string());
                }
                tokens.push(Token::EqEq);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err("unterminated escape".to_string()),
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' | '-' => {
                let negative = c == '-';
                if negative {
                    chars.next();
                    if !matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
                        return Err("expected digits after '-'".to_string());
                    }
                }
                let mut digits = String::new();
                while let Some(d) = chars.next_if(|ch| ch.is_ascii_digit()) {
                    digits.push(d);
                }
                let n: i64 = digits
                    .parse()
                    .map_err(|_| format!("invalid integer literal '{}'", digits))?;
                tokens.push(Token::Int(if negative { -n } else { n }));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(ch) =
                    chars.next_if(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
                {
                    ident.push(ch);
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

/// Compiled predicate. Regexes are compiled here, once, not per event.
#[derive(Debug, Clone)]
pub enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Expr>),
    Path { root: String, segments: Vec<String> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    Contains(Box<Expr>, Box<Expr>),
    StartsWith(Box<Expr>, Box<Expr>),
    EndsWith(Box<Expr>, Box<Expr>),
    Matches(Box<Expr>, Regex),
    Exists {
        target: Box<Expr>,
        var: String,
        pred: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {:?}, found {:?}", expected, token)),
            None => Err(format!("expected {:?}, found end of input", expected)),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let left = self.parse_membership()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.advance();
                let right = self.parse_membership()?;
                Ok(Expr::Eq(Box::new(left), Box::new(right)))
            }
            Some(Token::BangEq) => {
                self.advance();
                let right = self.parse_membership()?;
                Ok(Expr::Ne(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_membership(&mut self) -> Result<Expr, String> {
        let left = self.parse_unary()?;
        if matches!(self.peek(), Some(Token::Ident(kw)) if kw == "in") {
            self.advance();
            let right = self.parse_unary()?;
            return Ok(Expr::In(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;
        while matches!(self.peek(), Some(Token::Dot)) {
            self.advance();
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => return Err(format!("expected identifier after '.', found {:?}", other)),
            };

            if matches!(self.peek(), Some(Token::LParen)) {
                self.advance();
                expr = self.parse_method(expr, &name)?;
            } else {
                match &mut expr {
                    Expr::Path { segments, .. } => segments.push(name),
                    _ => return Err(format!("field '{}' accessed on a non-field value", name)),
                }
            }
        }
        Ok(expr)
    }

    fn parse_method(&mut self, receiver: Expr, name: &str) -> Result<Expr, String> {
        let receiver = Box::new(receiver);
        let expr = match name {
            "contains" | "startsWith" | "endsWith" => {
                let arg = Box::new(self.parse_expr()?);
                match name {
                    "contains" => Expr::Contains(receiver, arg),
                    "startsWith" => Expr::StartsWith(receiver, arg),
                    _ => Expr::EndsWith(receiver, arg),
                }
            }
            "matches" => {
                let pattern = match self.advance() {
                    Some(Token::Str(pattern)) => pattern,
                    other => {
                        return Err(format!(
                            "matches() requires a string literal, found {:?}",
                            other
                        ))
                    }
                };
                let regex =
                    Regex::new(&pattern).map_err(|e| format!("invalid regex: {}", e))?;
                Expr::Matches(receiver, regex)
            }
            "exists" => {
                let var = match self.advance() {
                    Some(Token::Ident(var)) => var,
                    other => {
                        return Err(format!(
                            "exists() requires a variable name, found {:?}",
                            other
                        ))
                    }
                };
                self.expect(&Token::Comma)?;
                let pred = Box::new(self.parse_expr()?);
                Expr::Exists {
                    target: receiver,
                    var,
                    pred,
                }
            }
            other => return Err(format!("unknown method '{}'", other)),
        };
        self.expect(&Token::RParen)?;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                _ => Ok(Expr::Path {
                    root: name,
                    segments: Vec::new(),
                }),
            },
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if matches!(self.peek(), Some(Token::RBracket)) {
                    self.advance();
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => {
                            return Err(format!("expected ',' or ']', found {:?}", other))
                        }
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

fn check_scope(expr: &Expr, scope: &mut Vec<String>) -> Result<(), String> {
    match expr {
        Expr::Str(_) | Expr::Int(_) | Expr::Bool(_) => Ok(()),
        Expr::List(items) => items.iter().try_for_each(|e| check_scope(e, scope)),
        Expr::Path { root, .. } => {
            if scope.iter().any(|name| name == root) {
                Ok(())
            } else {
                Err(format!("unknown identifier '{}'", root))
            }
        }
        Expr::Not(inner) => check_scope(inner, scope),
        Expr::And(l, r) | Expr::Or(l, r) | Expr::Eq(l, r) | Expr::Ne(l, r)
        | Expr::In(l, r) | Expr::Contains(l, r) | Expr::StartsWith(l, r)
        | Expr::EndsWith(l, r) => {
            check_scope(l, scope)?;
            check_scope(r, scope)
        }
        Expr::Matches(recv, _) => check_scope(recv, scope),
        Expr::Exists { target, var, pred } => {
            check_scope(target, scope)?;
            scope.push(var.clone());
            let result = check_scope(pred, scope);
            scope.pop();
            result
        }
    }
}

/// Compile a condition string. The returned program is immutable and safe to
/// evaluate from many threads.
pub fn compile(condition: &str) -> Result<Expr, String> {
    let tokens = lex(condition)?;
    if tokens.is_empty() {
        return Err("empty condition".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "unexpected trailing input at token {:?}",
            parser.tokens[parser.pos]
        ));
    }
    let mut scope = vec!["event".to_string()];
    check_scope(&expr, &mut scope)?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    StrList(Vec<String>),
}

#[derive(Debug, Clone)]
pub enum EvalError {
    /// Access through an absent optional sub-document
    AbsentDocument(String),
    /// Unknown field on a present object
    UnknownField(String),
    TypeMismatch(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::AbsentDocument(path) => write!(f, "absent sub-document '{}'", path),
            EvalError::UnknownField(path) => write!(f, "unknown field '{}'", path),
            EvalError::TypeMismatch(msg) => write!(f, "type mismatch: {}", msg),
        }
    }
}

/// Evaluate a compiled predicate against one event. Pure: no side effects,
/// no allocation beyond transient comparison values.
pub fn evaluate(expr: &Expr, event: &RuntimeEvent) -> Result<bool, EvalError> {
    let mut bindings = Vec::new();
    match eval(expr, event, &mut bindings)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::TypeMismatch(format!(
            "predicate produced {:?}, expected bool",
            other
        ))),
    }
}

fn eval(
    expr: &Expr,
    event: &RuntimeEvent,
    bindings: &mut Vec<(String, Value)>,
) -> Result<Value, EvalError> {
    match expr {
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::List(_) => Err(EvalError::TypeMismatch(
            "list literal is only valid on the right of 'in'".to_string(),
        )),
        Expr::Path { root, segments } => resolve(event, bindings, root, segments),
        Expr::Not(inner) => match eval(inner, event, bindings)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EvalError::TypeMismatch(format!(
                "'!' applied to {:?}",
                other
            ))),
        },
        Expr::And(l, r) => {
            if !as_bool(eval(l, event, bindings)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(eval(r, event, bindings)?, "&&")?))
        }
        Expr::Or(l, r) => {
            if as_bool(eval(l, event, bindings)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(eval(r, event, bindings)?, "||")?))
        }
        Expr::Eq(l, r) => {
            let lv = eval(l, event, bindings)?;
            let rv = eval(r, event, bindings)?;
            Ok(Value::Bool(values_equal(&lv, &rv)))
        }
        Expr::Ne(l, r) => {
            let lv = eval(l, event, bindings)?;
            let rv = eval(r, event, bindings)?;
            Ok(Value::Bool(!values_equal(&lv, &rv)))
        }
        Expr::In(needle, haystack) => {
            let needle = eval(needle, event, bindings)?;
            match &**haystack {
                Expr::List(items) => {
                    for item in items {
                        let candidate = eval(item, event, bindings)?;
                        if values_equal(&needle, &candidate) {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                }
                _ => match eval(haystack, event, bindings)? {
                    Value::StrList(items) => match needle {
                        Value::Str(s) => Ok(Value::Bool(items.iter().any(|i| *i == s))),
                        other => Err(EvalError::TypeMismatch(format!(
                            "'in' over a string list needs a string, found {:?}",
                            other
                        ))),
                    },
                    other => Err(EvalError::TypeMismatch(format!(
                        "'in' needs a list, found {:?}",
                        other
                    ))),
                },
            }
        }
        Expr::Contains(recv, arg) => string_method(recv, arg, event, bindings, |s, a| {
            s.contains(a)
        }),
        Expr::StartsWith(recv, arg) => string_method(recv, arg, event, bindings, |s, a| {
            s.starts_with(a)
        }),
        Expr::EndsWith(recv, arg) => string_method(recv, arg, event, bindings, |s, a| {
            s.ends_with(a)
        }),
        Expr::Matches(recv, regex) => match eval(recv, event, bindings)? {
            Value::Str(s) => Ok(Value::Bool(regex.is_match(&s))),
            other => Err(EvalError::TypeMismatch(format!(
                "matches() on {:?}",
                other
            ))),
        },
        Expr::Exists { target, var, pred } => {
            let items = match eval(target, event, bindings)? {
                Value::StrList(items) => items,
                other => {
                    return Err(EvalError::TypeMismatch(format!(
                        "exists() over {:?}",
                        other
                    )))
                }
            };
            for item in items {
                bindings.push((var.clone(), Value::Str(item)));
                let holds = as_bool(eval(pred, event, bindings)?, "exists");
                bindings.pop();
                if holds? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
    }
}

fn as_bool(value: Value, context: &str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::TypeMismatch(format!(
            "'{}' operand is {:?}, expected bool",
            context, other
        ))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::StrList(a), Value::StrList(b)) => a == b,
        // Comparisons across types are well-formed and simply false.
        _ => false,
    }
}

fn string_method(
    recv: &Expr,
    arg: &Expr,
    event: &RuntimeEvent,
    bindings: &mut Vec<(String, Value)>,
    op: impl Fn(&str, &str) -> bool,
) -> Result<Value, EvalError> {
    let recv = eval(recv, event, bindings)?;
    let arg = eval(arg, event, bindings)?;
    match (recv, arg) {
        (Value::Str(s), Value::Str(a)) => Ok(Value::Bool(op(&s, &a))),
        (recv, arg) => Err(EvalError::TypeMismatch(format!(
            "string method on ({:?}, {:?})",
            recv, arg
        ))),
    }
}

fn resolve(
    event: &RuntimeEvent,
    bindings: &[(String, Value)],
    root: &str,
    segments: &[String],
) -> Result<Value, EvalError> {
    if root != "event" {
        let value = bindings
            .iter()
            .rev()
            .find(|(name, _)| name == root)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| EvalError::UnknownField(root.to_string()))?;
        if !segments.is_empty() {
            return Err(EvalError::TypeMismatch(format!(
                "field access on bound variable '{}'",
                root
            )));
        }
        return Ok(value);
    }

    let Some((head, rest)) = segments.split_first() else {
        return Err(EvalError::TypeMismatch(
            "'event' itself is not a value".to_string(),
        ));
    };

    match head.as_str() {
        "cluster_id" => leaf(rest, head, Value::Str(event.cluster_id.clone())),
        "node_id" => leaf(rest, head, Value::Str(event.node_id.clone())),
        "event_type" => leaf(rest, head, Value::Str(event.event_type.clone())),
        "event_id" => leaf(rest, head, Value::Str(event.event_id.clone())),
        "ts" | "timestamp" => leaf(rest, head, Value::Int(event.timestamp.timestamp())),
        "process" => {
            let process = event
                .process
                .as_ref()
                .ok_or_else(|| EvalError::AbsentDocument("process".to_string()))?;
            resolve_process(process, rest)
        }
        "container" => {
            let container = event
                .container
                .as_ref()
                .ok_or_else(|| EvalError::AbsentDocument("container".to_string()))?;
            resolve_container(container, rest)
        }
        "network" => {
            let network = event
                .network
                .as_ref()
                .ok_or_else(|| EvalError::AbsentDocument("network".to_string()))?;
            resolve_network(network, rest)
        }
        other => Err(EvalError::UnknownField(format!("event.{}", other))),
    }
}

fn leaf(rest: &[String], name: &str, value: Value) -> Result<Value, EvalError> {
    if rest.is_empty() {
        Ok(value)
    } else {
        Err(EvalError::UnknownField(format!("{}.{}", name, rest.join("."))))
    }
}

fn resolve_process(process: &ProcessInfo, segments: &[String]) -> Result<Value, EvalError> {
    let Some((field, rest)) = segments.split_first() else {
        return Err(EvalError::TypeMismatch(
            "event.process is not a scalar".to_string(),
        ));
    };
    let value = match field.as_str() {
        "pid" => Value::Int(process.pid),
        "ppid" => Value::Int(process.ppid),
        "uid" => Value::Int(process.uid),
        "gid" => Value::Int(process.gid),
        "exe" => Value::Str(process.exe.clone()),
        "cmdline" => Value::Str(process.cmdline.clone()),
        "cwd" => Value::Str(process.cwd.clone()),
        "has_tty" => Value::Bool(process.has_tty),
        "capabilities_added" => Value::StrList(process.capabilities_added.clone()),
        other => {
            return Err(EvalError::UnknownField(format!("event.process.{}", other)))
        }
    };
    leaf(rest, field, value)
}

fn resolve_container(container: &ContainerInfo, segments: &[String]) -> Result<Value, EvalError> {
    let Some((field, rest)) = segments.split_first() else {
        return Err(EvalError::TypeMismatch(
            "event.container is not a scalar".to_string(),
        ));
    };
    let value = match field.as_str() {
        "container_id" => Value::Str(container.container_id.clone()),
        "image" => Value::Str(container.image.clone()),
        "image_digest" => Value::Str(container.image_digest.clone()),
        "pod" => Value::Str(container.pod.clone()),
        "namespace" => Value::Str(container.namespace.clone()),
        "service_account" => Value::Str(container.service_account.clone()),
        other => {
            return Err(EvalError::UnknownField(format!(
                "event.container.{}",
                other
            )))
        }
    };
    leaf(rest, field, value)
}

fn resolve_network(network: &NetworkInfo, segments: &[String]) -> Result<Value, EvalError> {
    let Some((field, rest)) = segments.split_first() else {
        return Err(EvalError::TypeMismatch(
            "event.network is not a scalar".to_string(),
        ));
    };
    let value = match field.as_str() {
        "dst_ip" => Value::Str(network.dst_ip.clone()),
        "dst_port" => Value::Int(network.dst_port),
        "proto" => Value::Str(network.proto.clone()),
        "dst_domain" => Value::Str(network.dst_domain.clone()),
        other => {
            return Err(EvalError::UnknownField(format!("event.network.{}", other)))
        }
    };
    leaf(rest, field, value)
}

/// Extract a correlation group key by field path, e.g.
/// `container.container_id`. Returns None when the path cannot be resolved
/// or resolves to something without a useful string form.
pub fn resolve_group_key(event: &RuntimeEvent, path: &str) -> Option<String> {
    let mut segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.first().map(String::as_str) == Some("event") {
        segments.remove(0);
    }
    match resolve(event, &[], "event", &segments) {
        Ok(Value::Str(s)) if !s.is_empty() => Some(s),
        Ok(Value::Int(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn shell_event() -> RuntimeEvent {
        RuntimeEvent {
            timestamp: Utc::now(),
            cluster_id: "kind-local".to_string(),
            node_id: "kind-worker".to_string(),
            event_type: "process_exec".to_string(),
            event_id: "evt-1".to_string(),
            process: Some(ProcessInfo {
                pid: 4242,
                uid: 0,
                exe: "/bin/bash".to_string(),
                cmdline: "bash -i".to_string(),
                capabilities_added: vec!["SYS_ADMIN".to_string(), "NET_ADMIN".to_string()],
                ..Default::default()
            }),
            container: Some(ContainerInfo {
                container_id: "containerd://abc123".to_string(),
                namespace: "prod".to_string(),
                pod: "p1".to_string(),
                ..Default::default()
            }),
            network: None,
        }
    }

    fn holds(condition: &str, event: &RuntimeEvent) -> bool {
        let program = compile(condition).expect(condition);
        evaluate(&program, event).expect(condition)
    }

    #[test]
    fn equality_and_membership() {
        let event = shell_event();
        assert!(holds("event.container.namespace == 'prod'", &event));
        assert!(holds(
            "event.process.exe in ['/bin/bash', '/bin/sh']",
            &event
        ));
        assert!(!holds("event.process.exe in ['/usr/bin/apt']", &event));
        assert!(holds("event.process.uid == 0", &event));
        assert!(holds("event.process.pid != 1", &event));
    }

    #[test]
    fn boolean_operators_and_parentheses() {
        let event = shell_event();
        assert!(holds(
            "event.process.exe in ['/bin/bash'] && event.container.namespace == 'prod'",
            &event
        ));
        assert!(holds(
            "(event.event_type == 'file_open' || event.event_type == 'process_exec') && !false",
            &event
        ));
        assert!(!holds("!(event.process.uid == 0)", &event));
    }

    #[test]
    fn string_methods() {
        let event = shell_event();
        assert!(holds("event.process.cmdline.contains('-i')", &event));
        assert!(holds("event.process.exe.startsWith('/bin/')", &event));
        assert!(holds("event.process.exe.endsWith('bash')", &event));
        assert!(holds("event.process.exe.matches('^/bin/(ba)?sh$')", &event));
        assert!(!holds("event.process.exe.matches('zsh')", &event));
    }

    #[test]
    fn exists_quantifier() {
        let event = shell_event();
        assert!(holds(
            "event.process.capabilities_added.exists(c, c == 'SYS_ADMIN')",
            &event
        ));
        assert!(holds(
            "event.process.capabilities_added.exists(c, c == 'SYS_ADMIN' || c == 'SYS_PTRACE')",
            &event
        ));
        assert!(!holds(
            "event.process.capabilities_added.exists(c, c == 'SYS_CHROOT')",
            &event
        ));
    }

    #[test]
    fn absent_subdocument_is_a_recoverable_error() {
        let event = shell_event();
        let program = compile("event.network.dst_ip == '1.2.3.4'").unwrap();
        match evaluate(&program, &event) {
            Err(EvalError::AbsentDocument(doc)) => assert_eq!(doc, "network"),
            other => panic!("expected absent-document error, got {:?}", other),
        }
    }

    #[test]
    fn short_circuit_skips_absent_documents() {
        // Guarding on event_type keeps network access unevaluated.
        let event = shell_event();
        assert!(!holds(
            "event.event_type == 'network_connect' && event.network.dst_ip != ''",
            &event
        ));
    }

    #[test]
    fn unknown_field_is_a_recoverable_error() {
        let event = shell_event();
        let program = compile("event.process.argv == 'x'").unwrap();
        assert!(matches!(
            evaluate(&program, &event),
            Err(EvalError::UnknownField(_))
        ));
    }

    #[test]
    fn compile_rejects_garbage() {
        assert!(compile("").is_err());
        assert!(compile("event.process.exe ==").is_err());
        assert!(compile("event.process.exe == 'x' extra").is_err());
        assert!(compile("event.process.exe.frobnicate('x')").is_err());
        assert!(compile("pod.namespace == 'x'").is_err());
        assert!(compile("event.process.exe.matches('[')").is_err());
        assert!(compile("event.process.exe = 'x'").is_err());
    }

    #[test]
    fn exists_variable_scope_is_local() {
        assert!(compile("event.process.capabilities_added.exists(c, c == 'X') && c == 'Y'").is_err());
    }

    #[test]
    fn group_key_resolution() {
        let event = shell_event();
        assert_eq!(
            resolve_group_key(&event, "container.container_id"),
            Some("containerd://abc123".to_string())
        );
        assert_eq!(
            resolve_group_key(&event, "event.container.namespace"),
            Some("prod".to_string())
        );
        assert_eq!(resolve_group_key(&event, "network.dst_ip"), None);
        assert_eq!(resolve_group_key(&event, "container.labels"), None);
    }
}
