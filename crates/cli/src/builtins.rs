//! Built-in capabilities registered by the CLI.
//!
//! None of these touch the network or mutate the filesystem; they exist so
//! workflows can be exercised end to end from the command line.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Result, anyhow};
use serde_json::{Map as JsonMap, Value};
use stepflow_engine::{
    BasicResolver, Capability, CapabilityRegistry, ExecutionOptions, ExpressionResolver, Interpreter, RichResolver,
    SessionHandle, SessionStore, run_workflow_file, validate_workflow_file,
};
use stepflow_types::{CapabilityResult, display_value};
use stepflow_util::{ExpressionEngine, is_within_root};
use tracing::info;

/// Words per minute used for reading-time estimates.
const READING_WORDS_PER_MINUTE: f64 = 200.0;
/// Lower bound on the number of words a summary keeps.
const MIN_SUMMARY_WORDS: usize = 20;
/// Default `max_tokens` for `summarize`.
const DEFAULT_SUMMARY_WORDS: usize = 512;
/// How deeply `workflow_run` may nest inside itself.
const MAX_NESTED_RUNS: usize = 8;

/// How the CLI runs workflows, shared with `workflow_run`.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workspace_root: PathBuf,
    pub expression_engine: ExpressionEngine,
    pub options: ExecutionOptions,
}

impl RunSettings {
    /// Builds an interpreter over `registry` with the configured resolver and options.
    pub fn interpreter<'r>(&self, registry: &'r CapabilityRegistry) -> Interpreter<'r> {
        Interpreter::new(registry)
            .with_resolver(resolver_for(self.expression_engine))
            .with_options(self.options.clone())
    }
}

pub fn resolver_for(engine: ExpressionEngine) -> Box<dyn ExpressionResolver> {
    match engine {
        ExpressionEngine::Rich => Box::new(RichResolver::default()),
        ExpressionEngine::Basic => Box::new(BasicResolver),
    }
}

/// Builds the registry of built-in capabilities.
///
/// `workflow_run` holds a weak reference back to the returned registry so
/// nested workflows see the same capabilities and sessions.
pub fn builtin_registry(settings: &RunSettings, sessions: Arc<SessionStore>) -> Arc<CapabilityRegistry> {
    Arc::new_cyclic(|registry_ref| {
        let mut registry = CapabilityRegistry::new();
        registry
            .register("echo", Arc::new(Echo))
            .register("analyze", Arc::new(Analyze))
            .register("summarize", Arc::new(Summarize))
            .register("fail", Arc::new(Fail))
            .register("session_open", Arc::new(SessionOpen(sessions.clone())))
            .register("session_write", Arc::new(SessionWrite(sessions.clone())))
            .register("session_read", Arc::new(SessionRead(sessions.clone())))
            .register("session_close", Arc::new(SessionClose(sessions)))
            .register(
                "workflow_validate",
                Arc::new(WorkflowValidate {
                    workspace_root: settings.workspace_root.clone(),
                }),
            )
            .register(
                "workflow_run",
                Arc::new(WorkflowRun {
                    settings: settings.clone(),
                    registry: registry_ref.clone(),
                    depth: AtomicUsize::new(0),
                }),
            );
        registry
    })
}

fn required_text(args: &JsonMap<String, Value>, name: &str) -> Result<String> {
    match args.get(name) {
        Some(Value::Null) | None => Err(anyhow!("missing required argument '{name}'")),
        Some(value) => Ok(display_value(value)),
    }
}

fn optional_count(args: &JsonMap<String, Value>, name: &str) -> Result<Option<usize>> {
    match args.get(name) {
        Some(Value::Null) | None => Ok(None),
        Some(Value::Number(number)) => number
            .as_u64()
            .map(|count| Some(count as usize))
            .ok_or_else(|| anyhow!("argument '{name}' must be a non-negative integer")),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => text
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| anyhow!("argument '{name}' must be a non-negative integer, got '{text}'")),
        Some(other) => Err(anyhow!("argument '{name}' must be a non-negative integer, got {other}")),
    }
}

fn session_handle(args: &JsonMap<String, Value>) -> Result<SessionHandle> {
    let raw = required_text(args, "session")?;
    Ok(raw.parse::<SessionHandle>()?)
}

/// Returns the `text` argument unchanged.
struct Echo;

impl Capability for Echo {
    fn description(&self) -> &str {
        "Return the 'text' argument as output."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        Ok(CapabilityResult::success(args.get("text").cloned().unwrap_or(Value::Null)))
    }
}

/// Word, character, and reading-time statistics.
struct Analyze;

impl Capability for Analyze {
    fn description(&self) -> &str {
        "Return simple text statistics."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let text = required_text(args, "text")?;
        let word_count = text.split_whitespace().count();
        let character_count = text.chars().count();
        let reading_time_minutes = (word_count as f64 / READING_WORDS_PER_MINUTE * 100.0).round() / 100.0;

        let summary = format!(
            "words={word_count}, characters={character_count}, reading_time_minutes={reading_time_minutes:.2}"
        );
        Ok(CapabilityResult::success(summary)
            .with_metadata_entry("word_count", word_count)
            .with_metadata_entry("character_count", character_count)
            .with_metadata_entry("reading_time_minutes", reading_time_minutes))
    }
}

/// Keeps the first `max(20, max_tokens)` words.
struct Summarize;

impl Capability for Summarize {
    fn description(&self) -> &str {
        "Summarize text by keeping its leading words."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let text = required_text(args, "text")?;
        let limit = optional_count(args, "max_tokens")?
            .unwrap_or(DEFAULT_SUMMARY_WORDS)
            .max(MIN_SUMMARY_WORDS);
        let words: Vec<&str> = text.split_whitespace().collect();
        let kept = &words[..words.len().min(limit)];
        let mut summary = kept.join(" ");
        if words.len() > limit {
            summary.push_str("...");
        }

        Ok(CapabilityResult::success(summary)
            .with_metadata_entry("original_words", words.len())
            .with_metadata_entry("summary_words", kept.len())
            .with_metadata_entry("style", args.get("style").cloned().unwrap_or(Value::Null)))
    }
}

/// Always unsuccessful; useful for exercising retries and `allow_failure`.
struct Fail;

impl Capability for Fail {
    fn description(&self) -> &str {
        "Always fail, reporting the 'message' argument."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let message = args
            .get("message")
            .map(display_value)
            .unwrap_or_else(|| "failed".to_string());
        Ok(CapabilityResult::failure(message))
    }
}

struct SessionOpen(Arc<SessionStore>);

impl Capability for SessionOpen {
    fn description(&self) -> &str {
        "Open a session and return its handle."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let label = args.get("label").filter(|value| !value.is_null()).map(display_value);
        let handle = self.0.open(label)?;
        if let Some(initial) = args.get("text").filter(|value| !value.is_null()) {
            self.0.append(handle, display_value(initial))?;
        }
        Ok(CapabilityResult::success(handle.to_string()).with_metadata_entry("session", handle.to_string()))
    }
}

struct SessionWrite(Arc<SessionStore>);

impl Capability for SessionWrite {
    fn description(&self) -> &str {
        "Append 'text' to an open session."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let handle = session_handle(args)?;
        let text = required_text(args, "text")?;
        match self.0.append(handle, text) {
            Ok(count) => Ok(CapabilityResult::success(self.0.read(handle)?.entries.join("\n"))
                .with_metadata_entry("session", handle.to_string())
                .with_metadata_entry("entries", count)),
            Err(error) => Ok(CapabilityResult::failure(error.to_string())),
        }
    }
}

struct SessionRead(Arc<SessionStore>);

impl Capability for SessionRead {
    fn description(&self) -> &str {
        "Return every entry of an open session."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let handle = session_handle(args)?;
        match self.0.read(handle) {
            Ok(snapshot) => Ok(CapabilityResult::success(snapshot.entries.join("\n"))
                .with_metadata_entry("session", handle.to_string())
                .with_metadata_entry("entries", snapshot.entries.len())
                .with_metadata_entry("opened_at", snapshot.opened_at.to_rfc3339())),
            Err(error) => Ok(CapabilityResult::failure(error.to_string())),
        }
    }
}

struct SessionClose(Arc<SessionStore>);

impl Capability for SessionClose {
    fn description(&self) -> &str {
        "Close a session and return its final contents."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let handle = session_handle(args)?;
        match self.0.close(handle) {
            Ok(entries) => Ok(CapabilityResult::success(entries.join("\n"))
                .with_metadata_entry("session", handle.to_string())
                .with_metadata_entry("entries", entries.len())),
            Err(error) => Ok(CapabilityResult::failure(error.to_string())),
        }
    }
}

/// Validates a workflow file that lives inside the workspace.
struct WorkflowValidate {
    workspace_root: PathBuf,
}

impl Capability for WorkflowValidate {
    fn description(&self) -> &str {
        "Validate a workflow file inside the workspace."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let path = required_text(args, "path")?;
        let Some(target) = is_within_root(Path::new(&path), &self.workspace_root) else {
            return Ok(CapabilityResult::failure(format!("path escapes workspace: {path}")));
        };
        Ok(validate_workflow_file(target))
    }
}

/// Runs a nested workflow inside the workspace with the shared registry.
struct WorkflowRun {
    settings: RunSettings,
    registry: Weak<CapabilityRegistry>,
    depth: AtomicUsize,
}

/// Decrements the nesting depth when a nested run finishes.
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Capability for WorkflowRun {
    fn description(&self) -> &str {
        "Execute a workflow file inside the workspace using the tool registry."
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        let path = required_text(args, "path")?;
        let parameters = match args.get("params") {
            Some(Value::Null) | None => JsonMap::new(),
            Some(Value::Object(parameters)) => parameters.clone(),
            Some(other) => return Err(anyhow!("argument 'params' must be a mapping, got {other}")),
        };
        let Some(target) = is_within_root(Path::new(&path), &self.settings.workspace_root) else {
            return Ok(CapabilityResult::failure(format!("path escapes workspace: {path}")));
        };
        let Some(registry) = self.registry.upgrade() else {
            return Ok(CapabilityResult::failure("registry is required to execute workflow"));
        };

        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = DepthGuard(&self.depth);
        if depth > MAX_NESTED_RUNS {
            return Ok(CapabilityResult::failure(format!(
                "workflow nesting exceeds {MAX_NESTED_RUNS} levels: {path}"
            )));
        }

        info!(path = %target.display(), depth, "running nested workflow");
        let outcome = run_workflow_file(&self.settings.interpreter(&registry), &target, &parameters);
        Ok(outcome.to_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> JsonMap<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn run_settings(root: &Path) -> RunSettings {
        RunSettings {
            workspace_root: root.to_path_buf(),
            expression_engine: ExpressionEngine::Rich,
            options: ExecutionOptions::default(),
        }
    }

    fn registry(root: &Path) -> Arc<CapabilityRegistry> {
        builtin_registry(&run_settings(root), Arc::new(SessionStore::new()))
    }

    fn invoke(registry: &CapabilityRegistry, name: &str, arguments: Value) -> Result<CapabilityResult> {
        registry.get(name).expect("registered").invoke(&args(arguments))
    }

    #[test]
    fn analyze_reports_counts() {
        let registry = registry(Path::new("/work"));
        let result = invoke(&registry, "analyze", json!({"text": "one two three four"})).expect("analyze");
        assert_eq!(result.output, json!("words=4, characters=18, reading_time_minutes=0.02"));
        let metadata = result.metadata.expect("metadata");
        assert_eq!(metadata["word_count"], 4);
        assert_eq!(metadata["character_count"], 18);
        assert_eq!(metadata["reading_time_minutes"], 0.02);
    }

    #[test]
    fn analyze_requires_text() {
        let registry = registry(Path::new("/work"));
        let error = invoke(&registry, "analyze", json!({})).expect_err("missing text");
        assert!(error.to_string().contains("'text'"));
    }

    #[test]
    fn summarize_truncates_after_the_word_floor() {
        let registry = registry(Path::new("/work"));
        let text = (1..=25).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let result = invoke(&registry, "summarize", json!({"text": text, "max_tokens": "5"})).expect("summarize");
        let expected = (1..=20).map(|n| n.to_string()).collect::<Vec<_>>().join(" ") + "...";
        assert_eq!(result.output, json!(expected));
        assert_eq!(result.metadata.expect("metadata")["summary_words"], 20);

        let short = invoke(&registry, "summarize", json!({"text": "brief note"})).expect("summarize");
        assert_eq!(short.output, json!("brief note"));
    }

    #[test]
    fn fail_is_always_unsuccessful() {
        let registry = registry(Path::new("/work"));
        let result = invoke(&registry, "fail", json!({"message": "nope"})).expect("fail");
        assert!(!result.success);
        assert_eq!(result.output, json!("nope"));
    }

    #[test]
    fn session_capabilities_share_one_store() {
        let registry = registry(Path::new("/work"));
        let opened = invoke(&registry, "session_open", json!({"text": "hello"})).expect("open");
        let handle = opened.output_text();
        assert_eq!(handle, "session-1");

        let written = invoke(&registry, "session_write", json!({"session": handle, "text": "world"})).expect("write");
        assert_eq!(written.output, json!("hello\nworld"));

        let read = invoke(&registry, "session_read", json!({"session": "session-1"})).expect("read");
        assert_eq!(read.metadata.expect("metadata")["entries"], 2);

        let closed = invoke(&registry, "session_close", json!({"session": "1"})).expect("close");
        assert_eq!(closed.output, json!("hello\nworld"));

        let after = invoke(&registry, "session_read", json!({"session": "session-1"})).expect("read");
        assert!(!after.success);
        assert_eq!(after.output, json!("session-1 is not open"));
    }

    #[test]
    fn workflow_validate_stays_inside_workspace() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp_dir.path().join("flow.json"), r#"{"steps": [{"id": "a"}]}"#).expect("write");
        let registry = registry(temp_dir.path());

        let valid = invoke(&registry, "workflow_validate", json!({"path": "flow.json"})).expect("validate");
        assert!(valid.success);
        assert_eq!(valid.metadata.expect("metadata")["step_count"], 1);

        let escaped = invoke(&registry, "workflow_validate", json!({"path": "../outside.json"})).expect("validate");
        assert!(!escaped.success);
        assert!(escaped.output_text().starts_with("path escapes workspace"));

        let missing = invoke(&registry, "workflow_validate", json!({"path": "absent.yaml"})).expect("validate");
        assert_eq!(missing.output, json!("workflow file not found"));
    }

    #[test]
    fn workflow_run_executes_nested_workflows_with_the_shared_registry() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            temp_dir.path().join("child.yaml"),
            "steps:\n  - id: open\n    tool: session_open\n    args:\n      text: \"{{ greeting }}\"\n",
        )
        .expect("write");
        let registry = registry(temp_dir.path());

        let result = invoke(
            &registry,
            "workflow_run",
            json!({"path": "child.yaml", "params": {"greeting": "hello"}}),
        )
        .expect("run");
        assert!(result.success, "nested run failed: {}", result.output_text());
        let metadata = result.metadata.expect("metadata");
        assert_eq!(metadata["transcript"], json!(["open:session_open:session-1"]));
        assert_eq!(metadata["params"], json!({"greeting": "hello"}));

        let read = invoke(&registry, "session_read", json!({"session": "session-1"})).expect("read");
        assert_eq!(read.output, json!("hello"));
    }

    #[test]
    fn workflow_run_rejects_escapes_and_bad_params() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp_dir.path());

        let escaped = invoke(&registry, "workflow_run", json!({"path": "../other.yaml"})).expect("run");
        assert!(!escaped.success);
        assert!(escaped.output_text().starts_with("path escapes workspace"));

        let missing = invoke(&registry, "workflow_run", json!({"path": "absent.yaml"})).expect("run");
        assert_eq!(missing.output, json!("workflow file not found"));

        let error = invoke(&registry, "workflow_run", json!({"path": "x.yaml", "params": [1]})).expect_err("params");
        assert!(error.to_string().contains("'params'"));
    }

    #[test]
    fn workflow_run_stops_runaway_recursion() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            temp_dir.path().join("loop.json"),
            r#"{"steps": [{"id": "again", "tool": "workflow_run", "args": {"path": "loop.json"}}]}"#,
        )
        .expect("write");
        let registry = registry(temp_dir.path());

        let result = invoke(&registry, "workflow_run", json!({"path": "loop.json"})).expect("run");
        assert!(!result.success);
        assert!(result.output_text().contains("workflow nesting exceeds 8 levels"));
    }
}
