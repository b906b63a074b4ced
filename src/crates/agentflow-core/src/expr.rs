//! Condition expression evaluation and prompt templating.
//!
//! The DSL's full expression language lives with the external parser; the
//! runtime only needs the integration contract: evaluate a small comparison
//! expression against the merged evaluation scope (global context state,
//! inherited contexts, path-local overlay) and answer true or false.
//!
//! Supported grammar:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") unary )?
//! unary   := "!" unary | primary
//! primary := number | string | true | false | null | path | "(" expr ")"
//! path    := ident ( "." ident )*
//! ```
//!
//! Undefined fields resolve to `null`, and `null` is **falsy** - referencing
//! a field nobody wrote yet silently disables the edge instead of failing
//! the path. Only a malformed expression is an error
//! ([`FlowError::Expression`]). Truthiness follows JSON intuition: `null`,
//! `false`, `0`, and `""` are falsy; everything else (including empty arrays
//! and objects) is truthy.
//!
//! [`FlowError::Expression`]: crate::FlowError::Expression

use crate::error::{FlowError, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Evaluate a condition expression to a boolean.
pub fn eval_condition(expr: &str, scope: &Value) -> Result<bool> {
    Ok(is_truthy(&eval_expr(expr, scope)?))
}

/// Evaluate an expression to a JSON value.
pub fn eval_expr(expr: &str, scope: &Value) -> Result<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        scope,
    };
    let value = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(FlowError::Expression(format!(
            "unexpected trailing input in '{}'",
            expr
        )));
    }
    Ok(value)
}

/// Resolve a dotted path (`Counter.value`) against the scope. Undefined
/// segments yield `null`.
pub fn lookup_path(scope: &Value, path: &str) -> Value {
    let mut current = scope;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// JSON truthiness: `null`, `false`, `0`, and `""` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Replace `{{ path }}` placeholders with scope values.
///
/// String values substitute raw; other values substitute as JSON. Undefined
/// paths render as the empty string, consistent with the falsy policy.
pub fn render_template(text: &str, scope: &Value) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
            .expect("placeholder regex")
    });

    re.replace_all(text, |caps: &regex::Captures<'_>| {
        match lookup_path(scope, &caps[1]) {
            Value::Null => String::new(),
            Value::String(s) => s,
            other => other.to_string(),
        }
    })
    .into_owned()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j == chars.len() {
                    return Err(FlowError::Expression(format!(
                        "unterminated string in '{}'",
                        expr
                    )));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '0'..='9' | '-' => {
                let start = i;
                let mut j = i;
                if chars[j] == '-' {
                    j += 1;
                }
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                let text: String = chars[start..j].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    FlowError::Expression(format!("invalid number '{}' in '{}'", text, expr))
                })?;
                tokens.push(Token::Number(num));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_alphanumeric() || chars[j] == '_' || chars[j] == '.')
                {
                    j += 1;
                }
                let word: String = chars[start..j].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Path(word),
                });
                i = j;
            }
            other => {
                return Err(FlowError::Expression(format!(
                    "unexpected character '{}' in '{}'",
                    other, expr
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    scope: &'a Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let right = self.parse_and()?;
            left = Value::Bool(is_truthy(&left) || is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let right = self.parse_cmp()?;
            left = Value::Bool(is_truthy(&left) && is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Value> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let right = self.parse_unary()?;
            Ok(Value::Bool(compare(&left, &right, op)))
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let value = self.parse_unary()?;
            return Ok(Value::Bool(!is_truthy(&value)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(number_value(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Path(p)) => Ok(lookup_path(self.scope, &p)),
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(FlowError::Expression("missing ')'".to_string())),
                }
            }
            other => Err(FlowError::Expression(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

// Cross-type numeric equality (1 == 1.0), strict otherwise. Orderings on
// incomparable types are false, in line with the undefined-is-falsy policy.
fn compare(left: &Value, right: &Value, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let eq = match (as_f64(left), as_f64(right)) {
                (Some(l), Some(r)) => l == r,
                _ => left == right,
            };
            if op == CmpOp::Eq {
                eq
            } else {
                !eq
            }
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = match (left, right) {
                (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                _ => match (as_f64(left), as_f64(right)) {
                    (Some(l), Some(r)) => l.partial_cmp(&r),
                    _ => None,
                },
            };
            match ord {
                Some(ord) => match op {
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}
