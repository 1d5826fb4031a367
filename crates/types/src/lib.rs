//! Shared type definitions for the Stepflow workspace.
//!
//! The engine, the CLI, and every capability implementation agree on the
//! records defined here: the uniform [`CapabilityResult`] returned by any
//! capability invocation, and the workflow document model in [`workflow`].

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

pub mod workflow;

pub use workflow::validation::{ValidatedWorkflow, ValidationFailure, validate_document, validation_result};
pub use workflow::{DEFAULT_LOOP_VARIABLE, MAX_RETRIES, StepDescriptor, StepRecord, UNKNOWN_STEP_ID};

/// Uniform outcome of a capability invocation.
///
/// Every capability, regardless of what it does, reports back through this
/// record. The interpreter only inspects `success` to drive retry and failure
/// policy; `output` and `metadata` are threaded into the execution context so
/// later steps can reference them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityResult {
    /// Primary value produced by the capability.
    pub output: Value,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Optional structured details about the invocation.
    #[serde(default)]
    pub metadata: Option<JsonMap<String, Value>>,
}

impl CapabilityResult {
    /// Successful result carrying `output` and no metadata.
    pub fn success(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            success: true,
            metadata: None,
        }
    }

    /// Unsuccessful result carrying `output` and no metadata.
    pub fn failure(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            success: false,
            metadata: None,
        }
    }

    /// Replaces the metadata mapping.
    pub fn with_metadata(mut self, metadata: JsonMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Inserts a single metadata entry, creating the mapping when absent.
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.get_or_insert_with(JsonMap::new).insert(key.into(), value.into());
        self
    }

    /// Returns the output rendered as display text.
    ///
    /// Strings are returned verbatim, `null` becomes the empty string, and
    /// every other value uses its compact JSON form.
    pub fn output_text(&self) -> String {
        display_value(&self.output)
    }

    /// Serializes the record as a `{ success, output, metadata }` JSON object.
    pub fn to_value(&self) -> Value {
        let mut object = JsonMap::new();
        object.insert("success".into(), Value::Bool(self.success));
        object.insert("output".into(), self.output.clone());
        object.insert(
            "metadata".into(),
            self.metadata.clone().map(Value::Object).unwrap_or(Value::Null),
        );
        Value::Object(object)
    }
}

/// Formats a JSON value as display text.
///
/// - Strings are returned as-is
/// - Numbers and booleans use their literal form
/// - `null` becomes the empty string
/// - Arrays and objects use compact JSON
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
