//! Operator-aware expression evaluation.
//!
//! The rich resolver evaluates expressions with this module before falling
//! back to plain path lookup. Supported forms, in binding order:
//!
//! - `a || b`, `a && b` (truthiness of each operand)
//! - `!a` (any number of leading negations)
//! - `a == b`, `a != b` (loose equality: JSON equality, numeric equality, or equal display text)
//! - `a >= b`, `a <= b`, `a > b`, `a < b` (numeric; numeric strings are accepted)
//! - `a.includes(b)` (sequence membership, substring, or mapping key), only
//!   when the call's `)` ends the expression
//! - parenthesized sub-expressions
//! - literals: JSON scalars and containers, plus `'single quoted'` strings
//! - paths: anything [`resolve_path`] understands
//!
//! Operators are only recognized outside quotes, parentheses, and brackets,
//! so `steps['a==b'].output` is a path, not a comparison.

use serde_json::{Map as JsonMap, Value};
use stepflow_types::display_value;
use thiserror::Error;

use crate::resolve::{is_truthy, resolve_path};

/// Reason an expression could not be evaluated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("expression cannot be empty")]
    Empty,
    #[error("unknown reference '{0}'")]
    UnknownReference(String),
    #[error("operator '{0}' is missing an operand")]
    MissingOperand(&'static str),
    #[error("cannot compare '{left}' and '{right}' numerically")]
    NotComparable { left: String, right: String },
    #[error("unsupported expression '{0}'")]
    Unsupported(String),
}

const COMPARISON_OPERATORS: [&str; 6] = ["!=", "==", ">=", "<=", ">", "<"];
const INCLUDES: &str = ".includes(";

/// Evaluates `expression` against `root`.
///
/// A bare path that does not resolve is an error so the caller can decide
/// how to fall back; inside an operator the same miss evaluates to `null`.
pub fn evaluate_expression(expression: &str, root: &JsonMap<String, Value>) -> Result<Value, ExpressionError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(ExpressionError::Empty);
    }

    if let Some(inner) = strip_wrapping_parentheses(trimmed) {
        return evaluate_expression(inner, root);
    }

    if let Some(parts) = split_expression(trimmed, "||") {
        for part in parts {
            if is_truthy(&evaluate_operand(part, root)?) {
                return Ok(Value::Bool(true));
            }
        }
        return Ok(Value::Bool(false));
    }

    if let Some(parts) = split_expression(trimmed, "&&") {
        for part in parts {
            if !is_truthy(&evaluate_operand(part, root)?) {
                return Ok(Value::Bool(false));
            }
        }
        return Ok(Value::Bool(true));
    }

    let (negations, inner) = strip_leading_negations(trimmed);
    if negations > 0 {
        if inner.trim().is_empty() {
            return Err(ExpressionError::MissingOperand("!"));
        }
        let truthy = is_truthy(&evaluate_operand(inner, root)?);
        return Ok(Value::Bool(if negations % 2 == 1 { !truthy } else { truthy }));
    }

    for operator in COMPARISON_OPERATORS {
        if let Some(position) = find_top_level_operator(trimmed, operator) {
            let left = trimmed[..position].trim();
            let right = trimmed[position + operator.len()..].trim();
            if left.is_empty() || right.is_empty() {
                return Err(ExpressionError::MissingOperand(operator));
            }
            let left = evaluate_operand(left, root)?;
            let right = evaluate_operand(right, root)?;
            return compare(operator, &left, &right).map(Value::Bool);
        }
    }

    if let Some(position) = find_top_level_operator(trimmed, INCLUDES) {
        // The call must close at the end of the expression.
        let Some(argument) = trimmed[position + INCLUDES.len()..].strip_suffix(')') else {
            return Err(ExpressionError::Unsupported(trimmed.to_string()));
        };
        let haystack = trimmed[..position].trim();
        let argument = argument.trim();
        if haystack.is_empty() || argument.is_empty() {
            return Err(ExpressionError::MissingOperand(".includes"));
        }
        if strip_wrapping_parentheses(&format!("({argument})")).is_none() {
            return Err(ExpressionError::Unsupported(trimmed.to_string()));
        }
        let haystack = evaluate_operand(haystack, root)?;
        let needle = evaluate_operand(argument, root)?;
        return Ok(Value::Bool(includes(&haystack, &needle)));
    }

    if let Some(literal) = parse_literal(trimmed) {
        return Ok(literal);
    }

    if trimmed.contains(char::is_whitespace) {
        return Err(ExpressionError::Unsupported(trimmed.to_string()));
    }

    root.get(trimmed)
        .cloned()
        .or_else(|| resolve_path(trimmed, root))
        .ok_or_else(|| ExpressionError::UnknownReference(trimmed.to_string()))
}

/// Evaluates an operand, mapping unknown references to `null`.
fn evaluate_operand(expression: &str, root: &JsonMap<String, Value>) -> Result<Value, ExpressionError> {
    match evaluate_expression(expression, root) {
        Err(ExpressionError::UnknownReference(_)) => Ok(Value::Null),
        other => other,
    }
}

fn compare(operator: &str, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    match operator {
        "==" => Ok(loosely_equal(left, right)),
        "!=" => Ok(!loosely_equal(left, right)),
        _ => {
            let (Some(l), Some(r)) = (as_number(left), as_number(right)) else {
                return Err(ExpressionError::NotComparable {
                    left: display_value(left),
                    right: display_value(right),
                });
            };
            Ok(match operator {
                ">=" => l >= r,
                "<=" => l <= r,
                ">" => l > r,
                _ => l < r,
            })
        }
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if let (Value::Number(l), Value::Number(r)) = (left, right) {
        return l.as_f64() == r.as_f64();
    }
    match (left, right) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        _ => display_value(left) == display_value(right),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn includes(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::String(text) => text.contains(display_value(needle).as_str()),
        Value::Object(map) => map.contains_key(display_value(needle).as_str()),
        _ => false,
    }
}

fn parse_literal(expression: &str) -> Option<Value> {
    if expression.len() >= 2 && expression.starts_with('\'') && expression.ends_with('\'') {
        let inner = &expression[1..expression.len() - 1];
        if !inner.contains('\'') {
            return Some(Value::String(inner.to_string()));
        }
    }
    if looks_like_json_literal(expression) {
        return serde_json::from_str::<Value>(expression).ok();
    }
    None
}

fn looks_like_json_literal(expression: &str) -> bool {
    let starts_like_number = expression
        .chars()
        .next()
        .map(|character| character == '-' || character.is_ascii_digit())
        .unwrap_or(false);
    expression.starts_with('[')
        || expression.starts_with('{')
        || expression.starts_with('"')
        || expression == "null"
        || expression == "true"
        || expression == "false"
        || starts_like_number
}

/// Returns the inside of `( ... )` when the outer parentheses enclose the whole expression.
fn strip_wrapping_parentheses(expression: &str) -> Option<&str> {
    let inner = expression.strip_prefix('(')?.strip_suffix(')')?;
    // `(a) && (b)` starts and ends with parentheses without being wrapped.
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for character in inner.chars() {
        match (quote, character) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(character),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

fn split_expression<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let length = expression.len();

    while start < length {
        if let Some(relative_index) = find_top_level_operator(&expression[start..], operator) {
            let absolute_index = start + relative_index;
            parts.push(expression[start..absolute_index].trim());
            start = absolute_index + operator.len();
        } else {
            parts.push(expression[start..].trim());
            break;
        }
    }
    if start >= length {
        // Trailing operator leaves an empty right-hand side.
        parts.push("");
    }

    if parts.len() > 1 { Some(parts) } else { None }
}

fn strip_leading_negations(expression: &str) -> (usize, &str) {
    let mut count = 0usize;
    let mut remainder = expression.trim_start();
    while let Some(stripped) = remainder.strip_prefix('!') {
        if stripped.starts_with('=') {
            break;
        }
        count += 1;
        remainder = stripped.trim_start();
    }
    (count, remainder)
}

fn find_top_level_operator(expression: &str, operator: &str) -> Option<usize> {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut depth = 0i32;

    for (index, character) in expression.char_indices() {
        match character {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                continue;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                continue;
            }
            '(' | '[' | '{' if !in_single_quote && !in_double_quote => {
                depth += 1;
                continue;
            }
            ')' | ']' | '}' if !in_single_quote && !in_double_quote => {
                if depth > 0 {
                    depth -= 1;
                }
                continue;
            }
            _ => {}
        }

        if !in_single_quote && !in_double_quote && depth == 0 && expression[index..].starts_with(operator) {
            return Some(index);
        }
    }

    None
}
