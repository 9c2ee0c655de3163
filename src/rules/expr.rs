//! Predicate mini-DSL for stream rules
//!
//! Grammar:
//!
//! ```text
//! expr := cmp (('and' | 'or') cmp)*
//! cmp  := field '==' 'string' | field '!=' 'string'
//!       | field '<' number | field '<=' number
//!       | field '>' number | field '>=' number
//!       | field 'in' '(' 'string' (',' 'string')* ')'
//! ```
//!
//! `and`/`or` chain left-associatively with equal precedence; there is no
//! grouping. Field names are flat keys and may contain dots. Expressions
//! compile once at rule load; evaluation never fails: a missing field
//! reads as the empty string for equality forms and as "no match" for
//! numeric and membership forms.
//!
//! Examples:
//!
//! ```text
//! event.category == 'auth_fail'
//! severity != 'info' and source_ip == '10.0.0.1'
//! action in ('deny', 'drop') or bytes > 10000
//! ```

use crate::events::EventRecord;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("predicate parse error at position {pos}: {message}")]
pub struct ExprParseError {
    pub pos: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String equality / inequality against a field value.
    CmpStr {
        field: String,
        op: CmpOp,
        value: String,
    },
    /// Numeric comparison; a field that does not parse as a number is a
    /// non-match, never an error.
    CmpNum { field: String, op: CmpOp, value: f64 },
    /// Set membership over string literals.
    In { field: String, values: Vec<String> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    In,
    LParen,
    RParen,
    Comma,
}

fn tokenize(expr: &str) -> Result<Vec<(usize, Token)>, ExprParseError> {
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i] as char;

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        if expr[i..].starts_with("==") {
            tokens.push((i, Token::Op(CmpOp::Eq)));
            i += 2;
            continue;
        }
        if expr[i..].starts_with("!=") {
            tokens.push((i, Token::Op(CmpOp::Ne)));
            i += 2;
            continue;
        }
        if expr[i..].starts_with("<=") {
            tokens.push((i, Token::Op(CmpOp::Le)));
            i += 2;
            continue;
        }
        if expr[i..].starts_with(">=") {
            tokens.push((i, Token::Op(CmpOp::Ge)));
            i += 2;
            continue;
        }

        match ch {
            '<' => {
                tokens.push((i, Token::Op(CmpOp::Lt)));
                i += 1;
            }
            '>' => {
                tokens.push((i, Token::Op(CmpOp::Gt)));
                i += 1;
            }
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '\'' => {
                // Single-quoted string literal
                let start = i;
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] as char != '\'' {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(ExprParseError {
                        pos: start,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push((start, Token::Str(expr[start + 1..j].to_string())));
                i = j + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut j = i;
                while j < bytes.len()
                    && ((bytes[j] as char).is_ascii_digit() || bytes[j] as char == '.')
                {
                    j += 1;
                }
                let text = &expr[start..j];
                let value = text.parse::<f64>().map_err(|_| ExprParseError {
                    pos: start,
                    message: format!("invalid number {:?}", text),
                })?;
                tokens.push((start, Token::Num(value)));
                i = j;
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < bytes.len() {
                    let c = bytes[j] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let word = &expr[start..j];
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "in" => Token::In,
                    _ => Token::Name(word.to_string()),
                };
                tokens.push((start, token));
                i = j;
            }
            other => {
                return Err(ExprParseError {
                    pos: i,
                    message: format!("unexpected character {:?}", other),
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn err_here(&self, message: &str) -> ExprParseError {
        let pos = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(p, _)| *p)
            .unwrap_or(0);
        ExprParseError {
            pos,
            message: message.to_string(),
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprParseError> {
        let field = match self.next() {
            Some((_, Token::Name(name))) => name,
            _ => return Err(self.err_here("expected field name")),
        };

        match self.next() {
            Some((_, Token::Op(op @ (CmpOp::Eq | CmpOp::Ne)))) => match self.next() {
                Some((_, Token::Str(value))) => Ok(Expr::CmpStr { field, op, value }),
                _ => Err(self.err_here("expected string literal after ==/!=")),
            },
            Some((_, Token::Op(op))) => match self.next() {
                Some((_, Token::Num(value))) => Ok(Expr::CmpNum { field, op, value }),
                _ => Err(self.err_here("expected number after comparison operator")),
            },
            Some((_, Token::In)) => {
                match self.next() {
                    Some((_, Token::LParen)) => {}
                    _ => return Err(self.err_here("expected ( after in")),
                }
                let mut values = Vec::new();
                loop {
                    match self.next() {
                        Some((_, Token::Str(value))) => values.push(value),
                        _ => return Err(self.err_here("expected string literal in set")),
                    }
                    match self.next() {
                        Some((_, Token::Comma)) => continue,
                        Some((_, Token::RParen)) => break,
                        _ => return Err(self.err_here("expected , or ) in set")),
                    }
                }
                Ok(Expr::In { field, values })
            }
            _ => Err(self.err_here("expected comparison operator")),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprParseError> {
        let mut left = self.parse_cmp()?;

        while let Some(token) = self.peek() {
            match token {
                Token::And => {
                    self.pos += 1;
                    let right = self.parse_cmp()?;
                    left = Expr::And(Box::new(left), Box::new(right));
                }
                Token::Or => {
                    self.pos += 1;
                    let right = self.parse_cmp()?;
                    left = Expr::Or(Box::new(left), Box::new(right));
                }
                _ => break,
            }
        }

        Ok(left)
    }
}

/// Compile a predicate expression. Called once at rule load time.
pub fn parse(expr: &str) -> Result<Expr, ExprParseError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(ExprParseError {
            pos: 0,
            message: "empty expression".to_string(),
        });
    }

    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;

    if parser.pos != parser.tokens.len() {
        return Err(parser.err_here("unexpected trailing tokens"));
    }
    Ok(ast)
}

impl Expr {
    /// Evaluate against an event. Total: unknown fields and non-numeric
    /// values degrade to a non-match instead of failing the rule.
    pub fn matches(&self, event: &EventRecord) -> bool {
        match self {
            Expr::CmpStr { field, op, value } => {
                let actual = event.field(field).unwrap_or("");
                match op {
                    CmpOp::Eq => actual == value,
                    CmpOp::Ne => actual != value,
                    _ => false,
                }
            }
            Expr::CmpNum { field, op, value } => {
                let actual = match event.field(field).and_then(|v| v.parse::<f64>().ok()) {
                    Some(n) => n,
                    None => return false,
                };
                match op {
                    CmpOp::Lt => actual < *value,
                    CmpOp::Le => actual <= *value,
                    CmpOp::Gt => actual > *value,
                    CmpOp::Ge => actual >= *value,
                    CmpOp::Eq => actual == *value,
                    CmpOp::Ne => actual != *value,
                }
            }
            Expr::In { field, values } => match event.field(field) {
                Some(actual) => values.iter().any(|v| v == actual),
                None => false,
            },
            Expr::And(left, right) => left.matches(event) && right.matches(event),
            Expr::Or(left, right) => left.matches(event) || right.matches(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> EventRecord {
        EventRecord::new(100)
            .with_field("source_ip", "10.0.0.1")
            .with_field("event.category", "auth_fail")
            .with_field("bytes", "2048")
            .with_field("action", "deny")
    }

    #[test]
    fn test_equality() {
        let expr = parse("source_ip == '10.0.0.1'").unwrap();
        assert!(expr.matches(&event()));

        let expr = parse("source_ip != '10.0.0.1'").unwrap();
        assert!(!expr.matches(&event()));
    }

    #[test]
    fn test_dotted_field_name() {
        let expr = parse("event.category == 'auth_fail'").unwrap();
        assert!(expr.matches(&event()));
    }

    #[test]
    fn test_and_or_left_associative() {
        let expr =
            parse("source_ip == '10.0.0.1' and event.category == 'auth_fail'").unwrap();
        assert!(expr.matches(&event()));

        // (a and b) or c -- the false 'or' arm does not flip the result
        let expr = parse(
            "source_ip == '10.0.0.2' and action == 'deny' or action == 'deny'",
        )
        .unwrap();
        assert!(expr.matches(&event()));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(parse("bytes > 1000").unwrap().matches(&event()));
        assert!(parse("bytes >= 2048").unwrap().matches(&event()));
        assert!(!parse("bytes < 2048").unwrap().matches(&event()));
        assert!(parse("bytes <= 2048").unwrap().matches(&event()));
    }

    #[test]
    fn test_set_membership() {
        assert!(parse("action in ('deny', 'drop')").unwrap().matches(&event()));
        assert!(!parse("action in ('allow')").unwrap().matches(&event()));
    }

    #[test]
    fn test_missing_field_is_no_match_not_error() {
        // Equality reads missing as ""
        assert!(!parse("missing == 'x'").unwrap().matches(&event()));
        assert!(parse("missing != 'x'").unwrap().matches(&event()));

        // Numeric and membership forms fail closed
        assert!(!parse("missing > 1").unwrap().matches(&event()));
        assert!(!parse("missing in ('x')").unwrap().matches(&event()));

        // Non-numeric value in a numeric comparison fails closed
        assert!(!parse("action > 1").unwrap().matches(&event()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("source_ip ==").is_err());
        assert!(parse("source_ip == 'unterminated").is_err());
        assert!(parse("== 'x'").is_err());
        assert!(parse("action in ('a',)").is_err());
        assert!(parse("source_ip == 'x' garbage").is_err());
        assert!(parse("bytes > 'text'").is_err());
    }
}
