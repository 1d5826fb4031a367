//! Structural validation of loaded workflow documents.
//!
//! Validation is load-time only: it confirms the document is a mapping with
//! a `steps` sequence. Individual step fields and capability names are left
//! to the interpreter.

use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

use crate::CapabilityResult;

/// Constraint violated by a workflow document.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    /// No document was supplied.
    #[error("workflow document is missing")]
    MissingDocument,
    /// The document is not a mapping or has no `steps` key.
    #[error("workflow missing 'steps'")]
    MissingSteps,
    /// The `steps` key holds something other than a sequence.
    #[error("'steps' must be a list")]
    StepsNotSequence,
}

/// Summary of a document that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedWorkflow {
    /// Number of entries in the `steps` sequence.
    pub step_count: usize,
}

/// Checks that `document` is a mapping whose `steps` value is a sequence.
pub fn validate_document(document: Option<&Value>) -> Result<ValidatedWorkflow, ValidationFailure> {
    let document = document.ok_or(ValidationFailure::MissingDocument)?;
    let steps = document
        .as_object()
        .and_then(|object| object.get("steps"))
        .ok_or(ValidationFailure::MissingSteps)?;
    let steps = steps.as_array().ok_or(ValidationFailure::StepsNotSequence)?;
    Ok(ValidatedWorkflow { step_count: steps.len() })
}

/// Validates `document` and reports the outcome as a capability result.
///
/// Success carries `output = "valid"` and `metadata = { step_count }`;
/// failure carries the violated constraint as output and no metadata.
pub fn validation_result(document: Option<&Value>) -> CapabilityResult {
    match validate_document(document) {
        Ok(validated) => {
            let mut metadata = JsonMap::new();
            metadata.insert("step_count".into(), Value::from(validated.step_count));
            CapabilityResult::success("valid").with_metadata(metadata)
        }
        Err(failure) => CapabilityResult::failure(failure.to_string()),
    }
}
