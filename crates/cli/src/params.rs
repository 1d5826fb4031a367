//! Run parameter parsing for `stepflow run`.
//!
//! Parameters arrive two ways: repeated `-p key=value` options, and free-form
//! trailing arguments (`--key value`, `--key=value`, `--flag`, or `key=value`).
//! All values are passed to the workflow as strings. `-p` entries win over
//! trailing arguments with the same key.

use serde_json::{Map as JsonMap, Value};
use tracing::warn;

/// Builds the parameter map from `-p` pairs and trailing arguments.
pub fn parse_parameters(pairs: &[String], extra: &[String]) -> JsonMap<String, Value> {
    let mut parameters = parse_extra_arguments(extra);
    for pair in pairs {
        match split_pair(pair) {
            Some((key, value)) => {
                parameters.insert(key.to_string(), Value::String(value.to_string()));
            }
            None => warn!(parameter = %pair, "ignoring parameter without '='"),
        }
    }
    parameters
}

/// Parses trailing `--key value` / `--key=value` / `--flag` / `key=value` tokens.
///
/// A `--key` followed by another option (or nothing) is treated as a flag
/// with value `"true"`.
fn parse_extra_arguments(arguments: &[String]) -> JsonMap<String, Value> {
    let mut parameters = JsonMap::new();
    let mut index = 0usize;

    while index < arguments.len() {
        let token = arguments[index].as_str();
        if let Some(option) = token.strip_prefix("--") {
            if let Some((key, value)) = split_pair(option) {
                parameters.insert(key.to_string(), Value::String(value.to_string()));
            } else if !option.is_empty() {
                let value = match arguments.get(index + 1) {
                    Some(next) if !next.starts_with('-') => {
                        index += 1;
                        next.clone()
                    }
                    _ => "true".to_string(),
                };
                parameters.insert(option.to_string(), Value::String(value));
            }
        } else if let Some((key, value)) = split_pair(token) {
            parameters.insert(key.to_string(), Value::String(value.to_string()));
        } else {
            warn!(argument = %token, "ignoring unrecognized argument");
        }
        index += 1;
    }

    parameters
}

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (key, value) = pair.split_once('=')?;
    let key = key.trim();
    if key.is_empty() { None } else { Some((key, value)) }
}
