//! Core executor data types.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use stepflow_types::CapabilityResult;

/// Final disposition of one step (or one loop iteration of a step).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepDisposition {
    /// `when` evaluated falsy; the capability was not invoked.
    ConditionSkipped,
    /// An attempt succeeded.
    Succeeded,
    /// Every attempt failed but `allow_failure` let the run continue.
    FailedTolerated,
    /// Every attempt failed and the run was aborted.
    FailedFatal,
}

impl StepDisposition {
    /// Returns true when this disposition aborts the run.
    pub fn aborts_run(self) -> bool {
        matches!(self, Self::FailedFatal)
    }
}

/// Per-step summary reported alongside the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepReport {
    /// Step identifier.
    pub id: String,
    /// Final disposition of this execution.
    pub disposition: StepDisposition,
    /// Number of capability invocations (0 when skipped or unresolvable).
    pub attempts: u32,
    /// Zero-based loop iteration, when the step iterates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
}

/// Shared flag checked between steps and loop iterations.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the run stop at the next safe point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs applied to every run of an interpreter.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Checked before each step and each loop iteration.
    pub cancellation: Option<CancellationFlag>,
    /// Base retry delay for steps with `retries` but no `retry_delay`.
    pub default_retry_delay: Option<Duration>,
}

/// Result of executing a whole workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutcome {
    /// True when every step completed, skipped, or was tolerated.
    pub success: bool,
    /// `"workflow completed"` on success, otherwise the failure message.
    pub output: Value,
    /// One entry per attempt (`id:tool:output`) or skip (`id:skipped`).
    pub transcript: Vec<String>,
    /// Run parameters as supplied by the caller.
    pub params: JsonMap<String, Value>,
    /// Final execution context.
    pub context: JsonMap<String, Value>,
    /// Identifier of the step that aborted the run.
    pub failed_step: Option<String>,
    /// Per-step dispositions in execution order.
    pub steps: Vec<StepReport>,
}

impl WorkflowOutcome {
    /// Outcome for a run that never started, such as an unloadable document.
    pub fn rejected(output: impl Into<Value>, params: &JsonMap<String, Value>) -> Self {
        Self {
            success: false,
            output: output.into(),
            transcript: Vec::new(),
            params: params.clone(),
            context: JsonMap::new(),
            failed_step: None,
            steps: Vec::new(),
        }
    }

    /// Converts the outcome into the uniform result record.
    ///
    /// Success carries `metadata = { transcript, params, context }`; failure
    /// carries `metadata = { step, transcript }`.
    pub fn to_result(&self) -> CapabilityResult {
        let transcript = Value::Array(self.transcript.iter().cloned().map(Value::String).collect());
        let mut metadata = JsonMap::new();
        if self.success {
            metadata.insert("transcript".into(), transcript);
            metadata.insert("params".into(), Value::Object(self.params.clone()));
            metadata.insert("context".into(), Value::Object(self.context.clone()));
            CapabilityResult::success(self.output.clone()).with_metadata(metadata)
        } else {
            if let Some(step) = &self.failed_step {
                metadata.insert("step".into(), Value::String(step.clone()));
            }
            metadata.insert("transcript".into(), transcript);
            CapabilityResult::failure(self.output.clone()).with_metadata(metadata)
        }
    }

    /// Returns the final step record for `step_id`, if any.
    pub fn step_record(&self, step_id: &str) -> Option<&Value> {
        self.context.get("steps")?.get(step_id)
    }
}
