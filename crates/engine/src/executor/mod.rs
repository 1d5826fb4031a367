//! Execution engine: interprets a workflow document step by step against a
//! capability registry, threading one execution context through the run.
//!
//! - `runner::Capability` abstracts how a named capability is invoked
//! - `retry` applies the per-step retry policy and records transcript entries
//! - [`Interpreter`] owns condition checks, loop expansion, failure policy,
//!   and context updates
//!
//! Steps and loop iterations run strictly in order on the calling thread.
//! Every failure crosses the interpreter boundary as data in the returned
//! [`WorkflowOutcome`]; nothing here panics or returns `Err`.

use std::collections::HashSet;

use serde_json::{Map as JsonMap, Value};
use stepflow_types::{CapabilityResult, StepDescriptor, StepRecord, validate_document};
use tracing::{debug, info, warn};

use crate::{
    resolve::{ExecutionContext, ExpressionResolver, RichResolver, is_truthy, is_truthy_text},
    templates::{UnresolvedTemplateRef, collect_unresolved_templates_from_value, render_map, render_value, resolve_embedded},
};

pub mod retry;
pub mod runner;
pub mod types;

pub use retry::parse_delay;
pub use runner::{Capability, CapabilityRegistry, FnCapability};
pub use types::{CancellationFlag, ExecutionOptions, StepDisposition, StepReport, WorkflowOutcome};

/// Output reported when every step completes.
pub const COMPLETED_OUTPUT: &str = "workflow completed";
/// Output reported when a cancellation flag stops the run.
pub const CANCELLED_OUTPUT: &str = "workflow cancelled";

/// A step failure that aborts the run.
#[derive(Debug)]
struct StepAbort {
    step_id: String,
    message: String,
}

/// Mutable state owned by one `execute` call.
struct RunState {
    params: JsonMap<String, Value>,
    context: ExecutionContext,
    transcript: Vec<String>,
    reports: Vec<StepReport>,
}

impl RunState {
    fn new(params: &JsonMap<String, Value>) -> Self {
        Self {
            params: params.clone(),
            context: ExecutionContext::from_parameters(params),
            transcript: Vec::new(),
            reports: Vec::new(),
        }
    }

    fn report(&mut self, step_id: &str, disposition: StepDisposition, attempts: u32, iteration: Option<usize>) {
        self.reports.push(StepReport {
            id: step_id.to_string(),
            disposition,
            attempts,
            iteration,
        });
    }

    fn finish(self, success: bool, output: impl Into<Value>, failed_step: Option<String>) -> WorkflowOutcome {
        WorkflowOutcome {
            success,
            output: output.into(),
            transcript: self.transcript,
            params: self.params,
            context: self.context.into_map(),
            failed_step,
            steps: self.reports,
        }
    }
}

/// Executes workflow documents against a capability registry.
///
/// The interpreter itself is stateless between runs; each call to
/// [`Interpreter::execute`] builds and owns a fresh execution context.
pub struct Interpreter<'r> {
    registry: &'r CapabilityRegistry,
    resolver: Box<dyn ExpressionResolver>,
    options: ExecutionOptions,
}

impl<'r> Interpreter<'r> {
    /// Creates an interpreter using the rich resolver and default options.
    pub fn new(registry: &'r CapabilityRegistry) -> Self {
        Self {
            registry,
            resolver: Box::new(RichResolver::default()),
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn ExpressionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.registry
    }

    pub fn resolver(&self) -> &dyn ExpressionResolver {
        self.resolver.as_ref()
    }

    /// Runs every step of `document` in order, seeded with `parameters`.
    ///
    /// A document that fails validation produces an unsuccessful outcome
    /// without running anything.
    pub fn execute(&self, document: &Value, parameters: &JsonMap<String, Value>) -> WorkflowOutcome {
        let mut run = RunState::new(parameters);

        let validated = match validate_document(Some(document)) {
            Ok(validated) => validated,
            Err(failure) => {
                warn!(error = %failure, "workflow document rejected");
                return run.finish(false, failure.to_string(), None);
            }
        };
        let steps = document
            .get("steps")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        info!(
            step_count = validated.step_count,
            resolver = self.resolver.name(),
            "workflow started"
        );

        let mut seen_ids = HashSet::new();
        for raw_step in steps {
            if self.is_cancelled() {
                info!(completed = run.reports.len(), "workflow cancelled");
                return run.finish(false, CANCELLED_OUTPUT, None);
            }

            let step = match StepDescriptor::from_value(raw_step) {
                Ok(step) => step,
                Err(error) => {
                    let step_id = StepDescriptor::raw_identifier(raw_step);
                    warn!(step_id = %step_id, error = %error, "step descriptor is malformed");
                    run.report(&step_id, StepDisposition::FailedFatal, 0, None);
                    return run.finish(false, format!("step {step_id} is malformed: {error}"), Some(step_id));
                }
            };
            if !seen_ids.insert(step.id.clone()) {
                warn!(step_id = %step.id, "step id reused; later records overwrite earlier ones");
            }

            if !self.condition_holds(&step, &run.context) {
                info!(step_id = %step.id, "step skipped by condition");
                run.transcript.push(format!("{}:skipped", step.id));
                run.report(&step.id, StepDisposition::ConditionSkipped, 0, None);
                continue;
            }

            let result = match self.loop_items(&step, &run.context) {
                Some(items) => self.run_loop(&step, items, &mut run),
                None => self.run_step(&step, None, &mut run).map(|_| true),
            };
            match result {
                Ok(true) => {}
                Ok(false) => {
                    info!(completed = run.reports.len(), "workflow cancelled");
                    return run.finish(false, CANCELLED_OUTPUT, None);
                }
                Err(abort) => {
                    warn!(step_id = %abort.step_id, "workflow aborted");
                    return run.finish(false, abort.message, Some(abort.step_id));
                }
            }
        }

        info!(transcript_entries = run.transcript.len(), "workflow completed");
        run.finish(true, COMPLETED_OUTPUT, None)
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancellation
            .as_ref()
            .is_some_and(CancellationFlag::is_cancelled)
    }

    /// Evaluates `when` against the current context; an absent condition holds.
    fn condition_holds(&self, step: &StepDescriptor, context: &ExecutionContext) -> bool {
        let resolved = match &step.when {
            None => return true,
            Some(Value::String(text)) => resolve_embedded(text, context, self.resolver.as_ref()),
            Some(other) => Some(render_value(other, context, self.resolver.as_ref())),
        };
        match resolved {
            Some(Value::String(text)) => is_truthy_text(&text),
            Some(value) => is_truthy(&value),
            None => false,
        }
    }

    /// Returns the items to iterate, or `None` when the step runs once.
    fn loop_items(&self, step: &StepDescriptor, context: &ExecutionContext) -> Option<Vec<Value>> {
        let source = step.loop_over.as_ref()?;
        let resolved = match source {
            Value::Array(_) => Some(render_value(source, context, self.resolver.as_ref())),
            Value::String(text) => resolve_embedded(text, context, self.resolver.as_ref()),
            other => Some(other.clone()),
        };
        match resolved.map(parse_sequence) {
            Some(Ok(items)) => Some(items),
            Some(Err(value)) => {
                warn!(step_id = %step.id, source = %value, "loop source is not a sequence; running the step once");
                None
            }
            None => {
                warn!(step_id = %step.id, "loop source did not resolve; running the step once");
                None
            }
        }
    }

    /// Runs one step body per item. Returns `Ok(false)` when cancelled.
    fn run_loop(&self, step: &StepDescriptor, items: Vec<Value>, run: &mut RunState) -> Result<bool, StepAbort> {
        debug!(step_id = %step.id, iterations = items.len(), loop_var = %step.loop_var, "loop started");
        for (iteration, item) in items.into_iter().enumerate() {
            if self.is_cancelled() {
                return Ok(false);
            }
            run.context.insert(step.loop_var.clone(), item);
            self.run_step(step, Some(iteration), run)?;
        }
        Ok(true)
    }

    /// Resolves the capability, renders arguments, and applies retry and failure policy.
    fn run_step(&self, step: &StepDescriptor, iteration: Option<usize>, run: &mut RunState) -> Result<(), StepAbort> {
        let resolved = step
            .tool
            .as_deref()
            .and_then(|tool| self.registry.get(tool).map(|capability| (tool, capability)));
        let Some((tool, capability)) = resolved else {
            let tool = step.tool.as_deref().unwrap_or_default();
            let message = format!("step {} references unknown tool '{}'", step.id, tool);
            warn!(step_id = %step.id, tool = %tool, "step references unknown tool");
            let failure = CapabilityResult::failure(message.clone()).with_metadata_entry("step", step.id.clone());
            return self.settle(step, iteration, failure, 0, run, || message);
        };

        debug!(
            step_id = %step.id,
            tool = %tool,
            description = step.description.as_deref().unwrap_or_default(),
            iteration = ?iteration,
            "step started"
        );
        self.log_unresolved_arguments(step, &run.context);
        let args = render_map(&step.args, &run.context, self.resolver.as_ref());
        let delay = self.retry_delay(step);
        let invocation =
            retry::run_with_retries(&step.id, tool, capability.as_ref(), &args, step.retries, delay, &mut run.transcript);
        let output_text = invocation.result.output_text();
        self.settle(step, iteration, invocation.result, invocation.attempts, run, || {
            format!("step {} failed: {}", step.id, output_text)
        })
    }

    /// Records the final result of a step, tolerating or aborting on failure.
    fn settle(
        &self,
        step: &StepDescriptor,
        iteration: Option<usize>,
        result: CapabilityResult,
        attempts: u32,
        run: &mut RunState,
        abort_message: impl FnOnce() -> String,
    ) -> Result<(), StepAbort> {
        let disposition = match (result.success, step.allow_failure) {
            (true, _) => StepDisposition::Succeeded,
            (false, true) => StepDisposition::FailedTolerated,
            (false, false) => StepDisposition::FailedFatal,
        };
        if disposition.aborts_run() {
            warn!(step_id = %step.id, attempts, "step failed");
            run.report(&step.id, disposition, attempts, iteration);
            return Err(StepAbort {
                step_id: step.id.clone(),
                message: abort_message(),
            });
        }
        let result = if disposition == StepDisposition::FailedTolerated {
            warn!(step_id = %step.id, attempts, "step failed; continuing because allow_failure is set");
            tolerate(result, &step.id)
        } else {
            result
        };

        if let Some(assign) = step.assign.as_deref() {
            run.context.insert(assign, result.output.clone());
        }
        run.context.record_step(&step.id, &StepRecord::from(&result));
        run.report(&step.id, disposition, attempts, iteration);
        Ok(())
    }

    fn retry_delay(&self, step: &StepDescriptor) -> Option<std::time::Duration> {
        let explicit = step.retry_delay.as_deref().and_then(|raw| {
            let parsed = parse_delay(raw);
            if parsed.is_none() {
                warn!(step_id = %step.id, retry_delay = %raw, "ignoring unparsable retry_delay");
            }
            parsed
        });
        explicit.or(self.options.default_retry_delay)
    }

    fn log_unresolved_arguments(&self, step: &StepDescriptor, context: &ExecutionContext) {
        let mut unresolved: Vec<UnresolvedTemplateRef> = Vec::new();
        for (key, value) in &step.args {
            collect_unresolved_templates_from_value(
                value,
                format!("args.{key}").as_str(),
                context,
                self.resolver.as_ref(),
                &mut unresolved,
            );
        }
        for reference in unresolved {
            debug!(
                step_id = %step.id,
                source_path = %reference.source_path,
                expression = %reference.expression,
                "template reference did not resolve; rendering as empty"
            );
        }
    }
}

/// Executes `document` with the default rich resolver and options.
pub fn execute(document: &Value, parameters: &JsonMap<String, Value>, registry: &CapabilityRegistry) -> WorkflowOutcome {
    Interpreter::new(registry).execute(document, parameters)
}

/// Marks a failed result as tolerated so the run can continue.
fn tolerate(result: CapabilityResult, step_id: &str) -> CapabilityResult {
    CapabilityResult {
        success: true,
        ..result
    }
    .with_metadata_entry("allowed_failure", true)
    .with_metadata_entry("step", step_id)
}

/// Accepts a sequence, or a string holding a JSON sequence.
fn parse_sequence(value: Value) -> Result<Vec<Value>, Value> {
    match value {
        Value::Array(items) => Ok(items),
        Value::String(text) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(Value::String(text)),
        },
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> StepDescriptor {
        StepDescriptor::from_value(&value).expect("valid step")
    }

    #[test]
    fn condition_accepts_literals_expressions_and_templates() {
        let registry = CapabilityRegistry::new();
        let interpreter = Interpreter::new(&registry);
        let mut context = ExecutionContext::new();
        context.insert("flag", json!(false));
        context.insert("mode", json!("fast"));
        context.insert("raw", json!("false"));

        let holds = |when: Value| interpreter.condition_holds(&step(json!({"id": "s", "when": when})), &context);
        assert!(holds(json!(true)));
        assert!(!holds(json!(false)));
        assert!(!holds(json!("flag")));
        assert!(!holds(json!("{{ flag }}")));
        assert!(holds(json!("mode == 'fast'")));
        assert!(holds(json!("{{ mode }}")));
        assert!(!holds(json!("{{ raw }}")));
        assert!(!holds(json!("{{ missing }}")));
        assert!(interpreter.condition_holds(&step(json!({"id": "s"})), &context));
    }

    #[test]
    fn loop_items_accept_sequences_and_resolved_strings() {
        let registry = CapabilityRegistry::new();
        let interpreter = Interpreter::new(&registry);
        let mut context = ExecutionContext::new();
        context.insert("names", json!(["a", "b"]));
        context.insert("encoded", json!("[1, 2]"));
        context.insert("prefix", json!("x"));

        let items = |source: Value| interpreter.loop_items(&step(json!({"id": "s", "loop": source})), &context);
        assert_eq!(items(json!([1, 2, 3])), Some(vec![json!(1), json!(2), json!(3)]));
        assert_eq!(items(json!(["{{ prefix }}-1"])), Some(vec![json!("x-1")]));
        assert_eq!(items(json!("{{ names }}")), Some(vec![json!("a"), json!("b")]));
        assert_eq!(items(json!("names")), Some(vec![json!("a"), json!("b")]));
        assert_eq!(items(json!("{{ encoded }}")), Some(vec![json!(1), json!(2)]));
        assert_eq!(items(json!({"not": "a list"})), None);
        assert_eq!(items(json!("{{ missing }}")), None);
    }

    #[test]
    fn tolerated_results_keep_output_and_existing_metadata() {
        let failure = CapabilityResult::failure("boom").with_metadata_entry("exit_code", 2);
        let tolerated = tolerate(failure, "Failing");
        assert!(tolerated.success);
        assert_eq!(tolerated.output, json!("boom"));
        let metadata = tolerated.metadata.expect("metadata");
        assert_eq!(metadata["exit_code"], 2);
        assert_eq!(metadata["allowed_failure"], true);
        assert_eq!(metadata["step"], "Failing");
    }

    #[test]
    fn invalid_documents_fail_without_running() {
        let registry = CapabilityRegistry::new();
        let outcome = execute(&json!({"name": "nothing"}), &JsonMap::new(), &registry);
        assert!(!outcome.success);
        assert_eq!(outcome.output, json!("workflow missing 'steps'"));
        assert!(outcome.transcript.is_empty());
    }
}
