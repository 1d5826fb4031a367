//! Loading workflow documents from disk.
//!
//! Files ending in `.yaml` or `.yml` are parsed as YAML; everything else is
//! parsed as JSON. Both produce the same JSON value tree, so the interpreter
//! never needs to know which format a workflow was authored in.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map as JsonMap, Value};
use stepflow_types::{CapabilityResult, validation_result};
use tracing::debug;

use crate::executor::{Interpreter, WorkflowOutcome};

/// Output reported when a workflow path does not exist.
pub const FILE_NOT_FOUND_OUTPUT: &str = "workflow file not found";

/// A loaded workflow document together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowFile {
    /// Path the document was read from.
    pub source: PathBuf,
    /// Parsed document.
    pub document: Value,
}

impl WorkflowFile {
    /// Number of entries under `steps`, when it is a sequence.
    pub fn step_count(&self) -> Option<usize> {
        self.document.get("steps").and_then(Value::as_array).map(Vec::len)
    }
}

/// Returns true when `path` should be parsed as YAML.
fn is_yaml_path(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("yaml") || extension.eq_ignore_ascii_case("yml"))
}

/// Reads and parses a workflow file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or is not valid YAML/JSON.
///
/// # Examples
///
/// ```rust
/// use stepflow_engine::load_workflow_file;
///
/// let temp_dir = tempfile::tempdir()?;
/// let workflow_path = temp_dir.path().join("greet.yaml");
/// std::fs::write(&workflow_path, "steps:\n  - id: a\n    tool: echo\n")?;
///
/// let workflow = load_workflow_file(&workflow_path)?;
/// assert_eq!(workflow.step_count(), Some(1));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn load_workflow_file(file_path: impl AsRef<Path>) -> Result<WorkflowFile> {
    let file_path = file_path.as_ref();
    let content =
        fs::read_to_string(file_path).with_context(|| format!("Failed to read workflow file: {}", file_path.display()))?;

    let document = if is_yaml_path(file_path) {
        serde_yaml::from_str::<Value>(&content)
            .with_context(|| format!("Failed to parse YAML workflow: {}", file_path.display()))?
    } else {
        serde_json::from_str::<Value>(&content)
            .with_context(|| format!("Failed to parse JSON workflow: {}", file_path.display()))?
    };
    debug!(path = %file_path.display(), "workflow file loaded");

    Ok(WorkflowFile {
        source: file_path.to_path_buf(),
        document,
    })
}

/// Validates the workflow stored at `file_path`.
///
/// Missing files and unparsable content are reported as unsuccessful results
/// rather than errors.
pub fn validate_workflow_file(file_path: impl AsRef<Path>) -> CapabilityResult {
    match load_checked(file_path.as_ref()) {
        Ok(workflow) => validation_result(Some(&workflow.document)),
        Err(rejection) => rejection,
    }
}

/// Validates and then executes the workflow stored at `file_path`.
///
/// The file is read once. When validation fails its message becomes the
/// run's output and no step runs.
pub fn run_workflow_file(
    interpreter: &Interpreter<'_>,
    file_path: impl AsRef<Path>,
    parameters: &JsonMap<String, Value>,
) -> WorkflowOutcome {
    let workflow = match load_checked(file_path.as_ref()) {
        Ok(workflow) => workflow,
        Err(rejection) => return WorkflowOutcome::rejected(rejection.output, parameters),
    };
    let validation = validation_result(Some(&workflow.document));
    if !validation.success {
        return WorkflowOutcome::rejected(validation.output, parameters);
    }
    interpreter.execute(&workflow.document, parameters)
}

/// Loads `file_path`, mapping a missing or unreadable file to a failed result.
fn load_checked(file_path: &Path) -> Result<WorkflowFile, CapabilityResult> {
    if !file_path.exists() {
        return Err(CapabilityResult::failure(FILE_NOT_FOUND_OUTPUT));
    }
    load_workflow_file(file_path).map_err(|error| CapabilityResult::failure(format!("{error:#}")))
}
