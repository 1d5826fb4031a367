//! Template rendering and diagnostics.
//!
//! Templates are strings containing `{{ expression }}` spans. Rendering
//! replaces every span with the display text of the resolved value; values
//! that do not resolve render as the empty string. Containers are rendered
//! recursively and keep their shape and key order.

use serde_json::{Map as JsonMap, Value};
use stepflow_types::display_value;

use crate::resolve::{ExecutionContext, ExpressionResolver};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Structured unresolved template reference diagnostic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnresolvedTemplateRef {
    /// Source path where the template was found.
    pub source_path: String,
    /// Raw template expression without delimiters.
    pub expression: String,
}

/// Extracts template expressions from a string value.
///
/// Returned expressions do not include `{{` or `}}` delimiters.
pub fn extract_template_expressions(value: &str) -> Vec<String> {
    let mut expressions = Vec::new();
    let mut remainder = value;

    while let Some(start) = remainder.find(OPEN) {
        let after_start = &remainder[start + OPEN.len()..];
        let Some(end) = after_start.find(CLOSE) else {
            break;
        };
        let expression = after_start[..end].trim();
        if !expression.is_empty() {
            expressions.push(expression.to_string());
        }
        remainder = &after_start[end + CLOSE.len()..];
    }

    expressions
}

/// Renders every template span inside `value`.
pub fn render_value(value: &Value, context: &ExecutionContext, resolver: &dyn ExpressionResolver) -> Value {
    match value {
        Value::String(text) => Value::String(render_string(text, context, resolver)),
        Value::Array(items) => Value::Array(items.iter().map(|item| render_value(item, context, resolver)).collect()),
        Value::Object(map) => Value::Object(render_map(map, context, resolver)),
        other => other.clone(),
    }
}

/// Renders each value of a mapping, preserving key order.
pub fn render_map(
    map: &JsonMap<String, Value>,
    context: &ExecutionContext,
    resolver: &dyn ExpressionResolver,
) -> JsonMap<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), render_value(value, context, resolver)))
        .collect()
}

/// Replaces each `{{ expression }}` span in `text`.
///
/// An opening `{{` without a matching `}}` is kept verbatim along with the
/// rest of the string.
pub fn render_string(text: &str, context: &ExecutionContext, resolver: &dyn ExpressionResolver) -> String {
    render_spans(text, context, resolver, |value| value.map(|value| display_value(&value)).unwrap_or_default())
}

/// Replaces each span with its resolved value written as an expression literal.
///
/// Strings become quoted JSON strings and unresolved spans become `null`, so
/// `{{ env }} == 'prod'` renders to `"dev" == 'prod'` rather than the bare
/// word `dev`.
pub fn render_expression(text: &str, context: &ExecutionContext, resolver: &dyn ExpressionResolver) -> String {
    render_spans(text, context, resolver, |value| value.unwrap_or(Value::Null).to_string())
}

fn render_spans(
    text: &str,
    context: &ExecutionContext,
    resolver: &dyn ExpressionResolver,
    write_value: impl Fn(Option<Value>) -> String,
) -> String {
    let mut rendered = String::with_capacity(text.len());
    let mut remainder = text;

    while let Some(start) = remainder.find(OPEN) {
        let after_start = &remainder[start + OPEN.len()..];
        let Some(end) = after_start.find(CLOSE) else {
            break;
        };
        rendered.push_str(&remainder[..start]);
        let expression = after_start[..end].trim();
        rendered.push_str(&write_value(resolver.resolve(expression, context)));
        remainder = &after_start[end + CLOSE.len()..];
    }

    rendered.push_str(remainder);
    rendered
}

/// Returns the inner expression when `text` is exactly one `{{ ... }}` span.
pub fn single_template_expression(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner.trim())
}

/// Resolves a string used as a condition or loop source.
///
/// - `{{ expr }}` on its own resolves `expr` and keeps the raw value.
/// - Text mixing literals and spans is rendered with spans as literals and
///   then evaluated; when that does not resolve, the plainly rendered string
///   is returned.
/// - Text without spans is treated as a bare expression.
pub fn resolve_embedded(text: &str, context: &ExecutionContext, resolver: &dyn ExpressionResolver) -> Option<Value> {
    if let Some(expression) = single_template_expression(text) {
        return resolver.resolve(expression, context);
    }
    if text.contains(OPEN) {
        let expression = render_expression(text, context, resolver);
        return resolver
            .resolve(&expression, context)
            .or_else(|| Some(Value::String(render_string(text, context, resolver))));
    }
    resolver.resolve(text, context)
}

/// Collect unresolved template references from an arbitrary JSON value tree.
pub fn collect_unresolved_templates_from_value(
    value: &Value,
    source_path: &str,
    context: &ExecutionContext,
    resolver: &dyn ExpressionResolver,
    unresolved: &mut Vec<UnresolvedTemplateRef>,
) {
    match value {
        Value::String(raw_text) => {
            for expression in extract_template_expressions(raw_text) {
                if resolver.resolve(expression.as_str(), context).is_none() {
                    unresolved.push(UnresolvedTemplateRef {
                        source_path: source_path.to_string(),
                        expression,
                    });
                }
            }
        }
        Value::Array(values) => {
            for (index, nested_value) in values.iter().enumerate() {
                collect_unresolved_templates_from_value(
                    nested_value,
                    format!("{source_path}[{index}]").as_str(),
                    context,
                    resolver,
                    unresolved,
                );
            }
        }
        Value::Object(map) => {
            for (key, nested_value) in map {
                collect_unresolved_templates_from_value(
                    nested_value,
                    format!("{source_path}.{key}").as_str(),
                    context,
                    resolver,
                    unresolved,
                );
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{BasicResolver, RichResolver};
    use serde_json::json;
    use stepflow_types::StepRecord;

    fn context() -> ExecutionContext {
        let mut context = ExecutionContext::new();
        context.insert("text", json!("hi"));
        context.insert("count", json!(2));
        context.insert("items", json!(["a", "b"]));
        context.record_step("X", &StepRecord { output: json!("boom"), metadata: None, success: false });
        context
    }

    #[test]
    fn renders_step_output_references() {
        let rendered = render_string("{{steps['X'].output}}", &context(), &BasicResolver);
        assert_eq!(rendered, "boom");
    }

    #[test]
    fn renders_mixed_text_and_non_string_values() {
        let context = context();
        assert_eq!(render_string("say {{ text }} x{{count}}", &context, &BasicResolver), "say hi x2");
        assert_eq!(render_string("{{ items }}", &context, &BasicResolver), r#"["a","b"]"#);
        assert_eq!(render_string("[{{ missing }}]", &context, &BasicResolver), "[]");
    }

    #[test]
    fn unterminated_span_is_left_verbatim() {
        assert_eq!(render_string("a {{ text } b", &context(), &BasicResolver), "a {{ text } b");
        assert_eq!(render_string("{{text}} and {{ rest", &context(), &BasicResolver), "hi and {{ rest");
    }

    #[test]
    fn render_value_preserves_shape_and_order() {
        let args = json!({"z": "{{text}}", "a": [1, "{{count}}", {"k": null}], "m": true});
        let rendered = render_value(&args, &context(), &BasicResolver);
        assert_eq!(rendered, json!({"z": "hi", "a": [1, "2", {"k": null}], "m": true}));
        let keys: Vec<_> = rendered.as_object().map(|map| map.keys().cloned().collect()).unwrap_or_default();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn resolve_embedded_keeps_raw_values_for_single_spans() {
        let context = context();
        let resolver = RichResolver::default();
        assert_eq!(resolve_embedded("{{ items }}", &context, &resolver), Some(json!(["a", "b"])));
        assert_eq!(resolve_embedded("{{ count > 1 }}", &context, &resolver), Some(json!(true)));
        assert_eq!(resolve_embedded("count == 2", &context, &resolver), Some(json!(true)));
        assert_eq!(resolve_embedded("n={{ count }}", &context, &resolver), Some(json!("n=2")));
        assert_eq!(resolve_embedded("{{ missing }}", &context, &resolver), None);
    }

    #[test]
    fn resolve_embedded_evaluates_mixed_text_with_spans_as_literals() {
        let context = context();
        let resolver = RichResolver::default();
        assert_eq!(render_expression("{{ text }} == 'hi'", &context, &resolver), r#""hi" == 'hi'"#);
        assert_eq!(render_expression("{{ missing }} == null", &context, &resolver), "null == null");
        assert_eq!(resolve_embedded("{{ text }} == 'hi'", &context, &resolver), Some(json!(true)));
        assert_eq!(resolve_embedded("{{ text }} == 'bye'", &context, &resolver), Some(json!(false)));
        assert_eq!(resolve_embedded("{{ count }} > 1 && {{ items }}.includes('b')", &context, &resolver), Some(json!(true)));
        assert_eq!(resolve_embedded("[{{ text }}, {{ count }}]", &context, &resolver), Some(json!(["hi", 2])));
    }

    #[test]
    fn collects_unresolved_references_with_paths() {
        let args = json!({"a": "{{ text }}", "b": ["{{ nope }}"], "c": {"d": "{{ steps.Y.output }}"}});
        let mut unresolved = Vec::new();
        collect_unresolved_templates_from_value(&args, "args", &context(), &BasicResolver, &mut unresolved);
        let paths: Vec<_> = unresolved.iter().map(|entry| entry.source_path.as_str()).collect();
        assert_eq!(paths, vec!["args.b[0]", "args.c.d"]);
        assert_eq!(unresolved[0].expression, "nope");
    }

    #[test]
    fn extracts_expressions_without_delimiters() {
        assert_eq!(extract_template_expressions("{{ a }}-{{b}}-{{ }}"), vec!["a", "b"]);
    }
}
