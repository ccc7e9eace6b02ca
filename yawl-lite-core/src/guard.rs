//! Flow predicates.
//!
//! The engine treats predicates as opaque strings handed to a
//! [`GuardEvaluator`]. [`DataGuardEvaluator`] is the built-in evaluator over
//! case data:
//!
//! ```text
//! true | false
//! path                  truthiness of the value at path
//! !path                 negated truthiness
//! path OP literal       OP in == != < > <= >=, literal is JSON or a bare word
//! ```
//!
//! `path` is a dot-separated walk into nested objects (numeric segments index
//! arrays). A malformed expression evaluates to `false`.

use crate::types::CaseData;
use serde_json::Value;
use std::cmp::Ordering;

pub trait GuardEvaluator: Send + Sync {
    /// Never fails: anything that cannot be evaluated is `false`.
    fn evaluate(&self, expression: &str, data: &CaseData) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Neq,
    Le,
    Ge,
    Lt,
    Gt,
}

// Two-character operators first so "<=" is not read as "<".
const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Neq),
    ("<=", CompareOp::Le),
    (">=", CompareOp::Ge),
    ("<", CompareOp::Lt),
    (">", CompareOp::Gt),
];

#[derive(Clone, Copy, Debug, Default)]
pub struct DataGuardEvaluator;

impl GuardEvaluator for DataGuardEvaluator {
    fn evaluate(&self, expression: &str, data: &CaseData) -> bool {
        let expr = expression.trim();
        match expr {
            "true" => return true,
            "false" => return false,
            "" => {
                tracing::warn!(expression, "Empty guard expression");
                return false;
            }
            _ => {}
        }

        for (symbol, op) in OPERATORS {
            if let Some((lhs, rhs)) = expr.split_once(symbol) {
                let path = lhs.trim();
                if !valid_path(path) {
                    tracing::warn!(expression, "Malformed guard expression");
                    return false;
                }
                let literal = parse_literal(rhs.trim());
                return match lookup(data, path) {
                    Some(value) => compare(value, op, &literal),
                    // A missing variable only satisfies inequality.
                    None => op == CompareOp::Neq,
                };
            }
        }

        let (negated, path) = match expr.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, expr),
        };
        if !valid_path(path) {
            tracing::warn!(expression, "Malformed guard expression");
            return false;
        }
        let truthy = lookup(data, path).is_some_and(is_truthy);
        truthy != negated
    }
}

fn valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        })
}

fn lookup<'a>(data: &'a CaseData, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn parse_literal(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(value: &Value, op: CompareOp, literal: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(value, literal),
        CompareOp::Neq => !values_equal(value, literal),
        _ => match ordering(value, literal) {
            Some(ord) => match op {
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Eq | CompareOp::Neq => false,
            },
            None => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
