//! Strongly typed workflow step definitions.
//!
//! A workflow document is an ordered list of step descriptors under a
//! top-level `steps` key. The document shape itself is checked by
//! [`validation`]; the fields of an individual step are only interpreted at
//! execution time, so a malformed step surfaces as a step failure rather than
//! a load failure.

pub mod validation;

use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::CapabilityResult;

/// Identifier used for steps that omit `id`.
pub const UNKNOWN_STEP_ID: &str = "unknown";

/// Largest accepted `retries` value.
pub const MAX_RETRIES: u32 = 100;

/// Context key bound to the current item when `loop_var` is omitted.
pub const DEFAULT_LOOP_VARIABLE: &str = "item";

/// One entry of a workflow's `steps` sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDescriptor {
    /// Identifier used for transcript entries and context bindings.
    #[serde(default = "default_step_id")]
    pub id: String,
    /// Name of the capability to invoke.
    #[serde(default)]
    pub tool: Option<String>,
    /// Optional human-readable label, used only in logs.
    #[serde(default)]
    pub description: Option<String>,
    /// Arguments passed to the capability after template rendering.
    #[serde(default)]
    pub args: JsonMap<String, JsonValue>,
    /// Optional condition: a boolean literal or an expression string.
    #[serde(default)]
    pub when: Option<JsonValue>,
    /// Optional sequence (or expression resolving to one) to iterate over.
    #[serde(default, rename = "loop")]
    pub loop_over: Option<JsonValue>,
    /// Context key bound to the current loop item.
    #[serde(default = "default_loop_variable")]
    pub loop_var: String,
    /// Additional attempts after the first failed one.
    #[serde(default, deserialize_with = "deserialize_retry_count")]
    pub retries: u32,
    /// When true, an exhausted failure is tolerated and the run continues.
    #[serde(default)]
    pub allow_failure: bool,
    /// Optional context key receiving the step's final output.
    #[serde(default)]
    pub assign: Option<String>,
    /// Optional base delay between attempts (`"250ms"`, `"2s"`, `"1m"`).
    #[serde(default)]
    pub retry_delay: Option<String>,
}

impl StepDescriptor {
    /// Parses a single step entry from a loaded document.
    pub fn from_value(value: &JsonValue) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    /// Returns the identifier declared by a raw step entry without fully parsing it.
    pub fn raw_identifier(value: &JsonValue) -> String {
        value
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(default_step_id)
    }
}

fn default_step_id() -> String {
    UNKNOWN_STEP_ID.to_string()
}

fn default_loop_variable() -> String {
    DEFAULT_LOOP_VARIABLE.to_string()
}

/// Accepts a non-negative integer up to [`MAX_RETRIES`], or a string holding one.
fn deserialize_retry_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RetryCount {
        Number(i64),
        Text(String),
        Missing(()),
    }

    let raw = match RetryCount::deserialize(deserializer)? {
        RetryCount::Number(number) => number,
        RetryCount::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| de::Error::custom(format!("retries must be an integer, got '{text}'")))?,
        RetryCount::Missing(()) => 0,
    };
    let retries =
        u32::try_from(raw).map_err(|_| de::Error::custom(format!("retries must be a non-negative integer, got {raw}")))?;
    if retries > MAX_RETRIES {
        return Err(de::Error::custom(format!("retries must be at most {MAX_RETRIES}, got {retries}")));
    }
    Ok(retries)
}

/// Stored outcome of one step execution, addressable by later steps as
/// `steps.<id>` or `steps['<id>']`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    /// Output of the final attempt.
    pub output: JsonValue,
    /// Metadata of the final attempt, including tolerated-failure markers.
    pub metadata: Option<JsonMap<String, JsonValue>>,
    /// Whether the step completed successfully (tolerated failures count as success).
    pub success: bool,
}

impl StepRecord {
    /// Serializes the record into the JSON object stored in the execution context.
    pub fn to_value(&self) -> JsonValue {
        let mut object = JsonMap::new();
        object.insert("output".into(), self.output.clone());
        object.insert(
            "metadata".into(),
            self.metadata.clone().map(JsonValue::Object).unwrap_or(JsonValue::Null),
        );
        object.insert("success".into(), JsonValue::Bool(self.success));
        JsonValue::Object(object)
    }
}

impl From<&CapabilityResult> for StepRecord {
    fn from(result: &CapabilityResult) -> Self {
        Self {
            output: result.output.clone(),
            metadata: result.metadata.clone(),
            success: result.success,
        }
    }
}
