//! # Expression Resolution
//!
//! This module owns the execution context threaded through a workflow run and
//! the resolvers that turn expression strings into values against it.
//!
//! ## Resolution order
//!
//! Every resolver implements [`ExpressionResolver`]. Two variants exist and
//! are selected when the interpreter is constructed:
//!
//! - [`RichResolver`]: evaluates operators (`==`, `!=`, `<`, `&&`, `||`, `!`,
//!   `.includes(...)`) and literals first; any evaluation error falls through
//!   to the basic resolver.
//! - [`BasicResolver`]: returns a top-level context key when the raw expression
//!   names one, otherwise walks a dotted/bracketed path.
//!
//! Resolution never fails. An unresolvable expression yields `None`, which
//! templates render as the empty string and conditions treat as falsy.
//!
//! ## Path syntax
//!
//! - `text` - top-level lookup
//! - `steps.build.output` - nested mapping lookup
//! - `steps['Failing'].output` / `steps["Failing"].output` - quoted-key access
//! - `items.0.id` / `items[0].id` - sequence index
//!
//! ## Usage
//!
//! ```rust
//! use stepflow_engine::resolve::{BasicResolver, ExecutionContext, ExpressionResolver};
//! use stepflow_types::StepRecord;
//! use serde_json::json;
//!
//! let mut context = ExecutionContext::new();
//! context.insert("text", json!("hi"));
//! context.record_step("Failing", &StepRecord { output: json!("boom"), metadata: None, success: false });
//!
//! let resolver = BasicResolver;
//! assert_eq!(resolver.resolve("text", &context), Some(json!("hi")));
//! assert_eq!(resolver.resolve("steps['Failing'].output", &context), Some(json!("boom")));
//! assert_eq!(resolver.resolve("steps.missing.output", &context), None);
//! ```

use serde_json::{Map as JsonMap, Value};
use stepflow_types::StepRecord;
use tracing::{trace, warn};

use crate::workflow::condition_syntax::evaluate_expression;

/// Context key reserved for the step-record mapping.
pub const STEPS_KEY: &str = "steps";

/// Mutable state threaded through a single workflow run.
///
/// The context is seeded from run parameters and always holds a `steps`
/// mapping from step id to step record. Completed steps additionally bind
/// their raw output directly under their id.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    values: JsonMap<String, Value>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Creates an empty context holding only the reserved `steps` mapping.
    pub fn new() -> Self {
        let mut values = JsonMap::new();
        values.insert(STEPS_KEY.to_string(), Value::Object(JsonMap::new()));
        Self { values }
    }

    /// Creates a context seeded from run parameters.
    ///
    /// A parameter named `steps` is kept only when it is a mapping, so that
    /// callers can pre-seed step records; anything else is replaced.
    pub fn from_parameters(parameters: &JsonMap<String, Value>) -> Self {
        let mut values = parameters.clone();
        if !values.get(STEPS_KEY).is_some_and(Value::is_object) {
            if values.contains_key(STEPS_KEY) {
                warn!("parameter 'steps' is reserved for step records; ignoring the supplied value");
            }
            values.insert(STEPS_KEY.to_string(), Value::Object(JsonMap::new()));
        }
        Self { values }
    }

    /// Returns the value bound to a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns true when a top-level key is bound.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Binds a top-level key.
    ///
    /// The reserved `steps` key cannot be rebound; such writes are ignored
    /// with a warning and `false` is returned.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if key == STEPS_KEY {
            warn!("refusing to overwrite the reserved 'steps' context key");
            return false;
        }
        self.values.insert(key, value);
        true
    }

    /// Stores a step record under `steps[step_id]` and binds the raw output under `step_id`.
    pub fn record_step(&mut self, step_id: &str, record: &StepRecord) {
        let steps = self
            .values
            .entry(STEPS_KEY.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !steps.is_object() {
            *steps = Value::Object(JsonMap::new());
        }
        if let Value::Object(records) = steps {
            records.insert(step_id.to_string(), record.to_value());
        }
        self.insert(step_id, record.output.clone());
    }

    /// Returns the stored record for `step_id` as its JSON form.
    pub fn step_record(&self, step_id: &str) -> Option<&Value> {
        self.values.get(STEPS_KEY)?.get(step_id)
    }

    /// Borrows the underlying mapping.
    pub fn as_map(&self) -> &JsonMap<String, Value> {
        &self.values
    }

    /// Consumes the context and returns the underlying mapping.
    pub fn into_map(self) -> JsonMap<String, Value> {
        self.values
    }
}

/// Resolves expression strings against an [`ExecutionContext`].
///
/// Implementations must never fail: an expression that cannot be resolved
/// yields `None`.
pub trait ExpressionResolver: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Resolves `expression` (already stripped of `{{ }}` delimiters).
    fn resolve(&self, expression: &str, context: &ExecutionContext) -> Option<Value>;
}

/// Key and path lookup without operator support.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicResolver;

impl ExpressionResolver for BasicResolver {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn resolve(&self, expression: &str, context: &ExecutionContext) -> Option<Value> {
        let expression = expression.trim();
        if expression.is_empty() {
            return None;
        }
        if let Some(value) = context.get(expression) {
            return Some(value.clone());
        }
        resolve_path(expression, context.as_map())
    }
}

/// Operator-aware evaluation with a [`BasicResolver`] fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct RichResolver {
    fallback: BasicResolver,
}

impl ExpressionResolver for RichResolver {
    fn name(&self) -> &'static str {
        "rich"
    }

    fn resolve(&self, expression: &str, context: &ExecutionContext) -> Option<Value> {
        match evaluate_expression(expression, context.as_map()) {
            Ok(value) => Some(value),
            Err(error) => {
                trace!(expression = %expression, error = %error, "rich evaluation failed; falling back to path lookup");
                self.fallback.resolve(expression, context)
            }
        }
    }
}

/// Returns the truthiness of a resolved value.
///
/// `null`, `false`, zero, the empty string, and empty collections are falsy.
/// Any other string is truthy, including `"false"`. This is the rule inside
/// expressions (`&&`, `||`, `!`); a `when` condition that resolves to a
/// whole string is judged by [`is_truthy_text`] instead.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Returns the truthiness of a `when` condition that resolved to a string.
///
/// Besides the empty string, the literals `false`, `0`, `null`, and `none`
/// (case-insensitive) are falsy. Command-line parameters always arrive as
/// strings, so `when: "{{ deploy }}"` with `--deploy false` must not run.
/// This differs from [`is_truthy`], which only treats `""` as a falsy string.
pub fn is_truthy_text(text: &str) -> bool {
    let trimmed = text.trim();
    !(trimmed.is_empty()
        || trimmed == "0"
        || trimmed.eq_ignore_ascii_case("false")
        || trimmed.eq_ignore_ascii_case("null")
        || trimmed.eq_ignore_ascii_case("none"))
}

/// Builds a mapping with one entry per requested key.
///
/// Each key takes the top-level context value when bound, otherwise the
/// output of the step with that id, otherwise `null`.
pub fn select_context(context: &ExecutionContext, keys: &[&str]) -> JsonMap<String, Value> {
    keys.iter()
        .map(|key| {
            let value = context
                .get(key)
                .cloned()
                .or_else(|| context.step_record(key).and_then(|record| record.get("output")).cloned())
                .unwrap_or(Value::Null);
            (key.to_string(), value)
        })
        .collect()
}

/// One step of a bracketed accessor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Accessor {
    Key(String),
    Index(usize),
}

/// Walks a dotted/bracketed path from the root mapping.
///
/// Any missing segment, malformed bracket, or type mismatch yields `None`.
pub fn resolve_path(expression: &str, root: &JsonMap<String, Value>) -> Option<Value> {
    let mut current: Option<&Value> = None;

    for segment in split_path_segments(expression.trim())? {
        let (head, accessors) = parse_segment(segment)?;
        if !head.is_empty() {
            current = Some(match current {
                None => root.get(head)?,
                Some(value) => lookup_key(value, head)?,
            });
        }
        for accessor in accessors {
            current = Some(match (current, accessor) {
                (None, Accessor::Key(key)) => root.get(&key)?,
                (None, Accessor::Index(_)) => return None,
                (Some(value), Accessor::Key(key)) => lookup_key(value, &key)?,
                (Some(value), Accessor::Index(index)) => value.as_array()?.get(index)?,
            });
        }
    }

    current.cloned()
}

fn lookup_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    }
}

/// Splits on `.` characters that are outside brackets and quotes.
///
/// Returns `None` for empty segments (`a..b`, leading or trailing dots) and
/// unbalanced brackets.
fn split_path_segments(expression: &str) -> Option<Vec<&str>> {
    if expression.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;

    for (index, character) in expression.char_indices() {
        match (quote, character) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') if depth > 0 => quote = Some(character),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.checked_sub(1)?,
            (None, '.') if depth == 0 => {
                let segment = &expression[start..index];
                if segment.is_empty() {
                    return None;
                }
                segments.push(segment);
                start = index + 1;
            }
            _ => {}
        }
    }

    if depth != 0 || quote.is_some() {
        return None;
    }
    let last = &expression[start..];
    if last.is_empty() {
        return None;
    }
    segments.push(last);
    Some(segments)
}

/// Parses `name["key"][0]` into `("name", [Key("key"), Index(0)])`.
fn parse_segment(segment: &str) -> Option<(&str, Vec<Accessor>)> {
    let head_end = segment.find('[').unwrap_or(segment.len());
    let head = segment[..head_end].trim();
    let mut accessors = Vec::new();
    let mut rest = &segment[head_end..];

    while !rest.is_empty() {
        let inner_start = rest.strip_prefix('[')?;
        let close = find_closing_bracket(inner_start)?;
        let inner = inner_start[..close].trim();
        accessors.push(parse_accessor(inner)?);
        rest = &inner_start[close + 1..];
    }

    if head.is_empty() && accessors.is_empty() {
        return None;
    }
    Some((head, accessors))
}

fn find_closing_bracket(text: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (index, character) in text.char_indices() {
        match (quote, character) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(character),
            (None, ']') => return Some(index),
            _ => {}
        }
    }
    None
}

fn parse_accessor(inner: &str) -> Option<Accessor> {
    for delimiter in ['"', '\''] {
        if inner.len() >= 2 && inner.starts_with(delimiter) && inner.ends_with(delimiter) {
            return Some(Accessor::Key(inner[1..inner.len() - 1].to_string()));
        }
    }
    inner.parse::<usize>().ok().map(Accessor::Index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_context() -> ExecutionContext {
        let mut context = ExecutionContext::new();
        context.insert("text", json!("hi"));
        context.insert("user", json!({"profile": {"name": "Ada"}, "roles": ["admin", "dev"]}));
        context.insert("dotted.key", json!("literal"));
        context.record_step(
            "Failing",
            &StepRecord {
                output: json!("boom"),
                metadata: Some(JsonMap::from_iter([("allowed_failure".to_string(), json!(true))])),
                success: true,
            },
        );
        context
    }

    #[test]
    fn basic_resolver_prefers_top_level_keys() {
        let context = sample_context();
        assert_eq!(BasicResolver.resolve("text", &context), Some(json!("hi")));
        assert_eq!(BasicResolver.resolve("dotted.key", &context), Some(json!("literal")));
        assert_eq!(BasicResolver.resolve("  text  ", &context), Some(json!("hi")));
    }

    #[test]
    fn basic_resolver_walks_bracketed_step_references() {
        let context = sample_context();
        assert_eq!(BasicResolver.resolve("steps['Failing'].output", &context), Some(json!("boom")));
        assert_eq!(BasicResolver.resolve("steps[\"Failing\"].output", &context), Some(json!("boom")));
        assert_eq!(BasicResolver.resolve("steps.Failing.success", &context), Some(json!(true)));
        assert_eq!(
            BasicResolver.resolve("steps['Failing'].metadata.allowed_failure", &context),
            Some(json!(true))
        );
        assert_eq!(BasicResolver.resolve("Failing", &context), Some(json!("boom")));
    }

    #[test]
    fn basic_resolver_indexes_sequences() {
        let context = sample_context();
        assert_eq!(BasicResolver.resolve("user.roles.1", &context), Some(json!("dev")));
        assert_eq!(BasicResolver.resolve("user.roles[0]", &context), Some(json!("admin")));
        assert_eq!(BasicResolver.resolve("user['profile']['name']", &context), Some(json!("Ada")));
    }

    #[test]
    fn basic_resolver_returns_none_for_misses() {
        let context = sample_context();
        assert_eq!(BasicResolver.resolve("missing", &context), None);
        assert_eq!(BasicResolver.resolve("user.profile.email", &context), None);
        assert_eq!(BasicResolver.resolve("text.length", &context), None);
        assert_eq!(BasicResolver.resolve("user.roles[9]", &context), None);
        assert_eq!(BasicResolver.resolve("user..profile", &context), None);
        assert_eq!(BasicResolver.resolve("steps['unterminated", &context), None);
        assert_eq!(BasicResolver.resolve("", &context), None);
    }

    #[test]
    fn dots_inside_brackets_do_not_split() {
        let mut context = ExecutionContext::new();
        context.insert("files", json!({"a.txt": {"size": 3}}));
        assert_eq!(BasicResolver.resolve("files['a.txt'].size", &context), Some(json!(3)));
    }

    #[test]
    fn rich_resolver_evaluates_operators_and_falls_back() {
        let context = sample_context();
        let resolver = RichResolver::default();
        assert_eq!(resolver.resolve("text == 'hi'", &context), Some(json!(true)));
        assert_eq!(resolver.resolve("steps['Failing'].output", &context), Some(json!("boom")));
        assert_eq!(resolver.resolve("dotted.key", &context), Some(json!("literal")));
        assert_eq!(resolver.resolve("missing", &context), None);
    }

    #[test]
    fn context_guards_reserved_steps_key() {
        let mut context = ExecutionContext::new();
        assert!(!context.insert(STEPS_KEY, json!("clobbered")));
        assert!(context.get(STEPS_KEY).is_some_and(Value::is_object));

        let parameters = JsonMap::from_iter([("steps".to_string(), json!("nope")), ("a".to_string(), json!("1"))]);
        let seeded = ExecutionContext::from_parameters(&parameters);
        assert!(seeded.get(STEPS_KEY).is_some_and(Value::is_object));
        assert_eq!(seeded.get("a"), Some(&json!("1")));
    }

    #[test]
    fn record_step_overwrites_prior_record() {
        let mut context = ExecutionContext::new();
        context.record_step("s", &StepRecord { output: json!(1), metadata: None, success: true });
        context.record_step("s", &StepRecord { output: json!(2), metadata: None, success: true });
        assert_eq!(context.step_record("s"), Some(&json!({"output": 2, "metadata": null, "success": true})));
        assert_eq!(context.get("s"), Some(&json!(2)));
    }

    #[test]
    fn truthiness_follows_value_emptiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!([0])));
        assert!(!is_truthy_text(" False "));
        assert!(!is_truthy_text("0"));
        assert!(is_truthy_text("yes"));
    }

    #[test]
    fn select_context_reads_values_then_step_outputs() {
        let mut context = ExecutionContext::new();
        context.insert("foo", json!("bar"));
        context.record_step("X", &StepRecord { output: json!("baz"), metadata: None, success: true });
        // Drop the flat binding so the lookup has to go through the step record.
        let mut values = context.into_map();
        values.remove("X");
        let context = ExecutionContext::from_parameters(&values);

        let selected = select_context(&context, &["foo", "X", "missing"]);
        assert_eq!(selected["foo"], "bar");
        assert_eq!(selected["X"], "baz");
        assert_eq!(selected["missing"], Value::Null);
    }
}
