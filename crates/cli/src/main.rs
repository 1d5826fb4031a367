use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map as JsonMap, Value};
use stepflow_engine::{ExecutionOptions, SessionStore, parse_delay, run_workflow_file, validate_workflow_file};
use stepflow_types::CapabilityResult;
use stepflow_util::{LoadedSettings, Settings, redact_sensitive};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::builtins::RunSettings;

mod builtins;
mod params;

/// Run declarative step workflows.
#[derive(Parser, Debug)]
#[command(name = "stepflow", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a workflow definition
    Run {
        /// Path to a YAML or JSON workflow definition
        path: PathBuf,

        /// key=value parameters (repeatable)
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Print the full result record as JSON
        #[arg(long)]
        json: bool,

        /// Extra parameters as `--key value`, `--key=value`, or `key=value`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PARAMS")]
        extra: Vec<String>,
    },
    /// Check that a workflow file is well formed
    Validate {
        /// Path to a YAML or JSON workflow definition
        path: PathBuf,
    },
    /// List available capabilities
    Tools,
    /// Invoke one capability directly with a JSON object of arguments
    ToolRun {
        /// Capability name
        name: String,

        /// JSON object with the capability arguments
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Print the resolved settings
    Config,
}

/// CLI entry point
fn main() -> Result<ExitCode> {
    let Args { command } = Args::parse();
    let loaded = Settings::load().context("failed to load settings")?;
    init_tracing(&loaded.settings.log_level);
    report_ignored_settings(&loaded);
    let settings = loaded.settings;

    let mut stdout = io::stdout().lock();
    let success = match command {
        Command::Run {
            path,
            params,
            json,
            extra,
        } => run_command(&settings, &path, &params, &extra, json, &mut stdout)?,
        Command::Validate { path } => validate_command(&path, &mut stdout)?,
        Command::Tools => tools_command(&settings, &mut stdout)?,
        Command::ToolRun { name, args } => tool_run_command(&settings, &name, &args, &mut stdout)?,
        Command::Config => config_command(&settings, &mut stdout)?,
    };
    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Logs a settings file that was skipped while loading, once tracing is up.
fn report_ignored_settings(loaded: &LoadedSettings) {
    if let Some(error) = &loaded.ignored_error {
        warn!(
            path = %loaded.path.display(),
            error = %error,
            "Failed to parse settings file; using defaults"
        );
    }
}

fn run_command(
    settings: &Settings,
    path: &Path,
    pairs: &[String],
    extra: &[String],
    json: bool,
    out: &mut impl Write,
) -> Result<bool> {
    let path = absolute_path(path)?;
    let run_settings = run_settings(settings, settings.workspace_root.clone().unwrap_or_else(|| detect_workspace_root(&path)));
    info!(path = %path.display(), workspace_root = %run_settings.workspace_root.display(), "running workflow");

    let parameters = params::parse_parameters(pairs, extra);
    let sessions = Arc::new(SessionStore::new());
    let registry = builtins::builtin_registry(&run_settings, sessions.clone());

    let outcome = run_workflow_file(&run_settings.interpreter(&registry), &path, &parameters);
    if !sessions.is_empty() {
        warn!(open_sessions = sessions.len(), "workflow finished with sessions still open");
    }

    writeln!(out, "workflow success={}", outcome.success)?;
    if json {
        let rendered = serde_json::to_string_pretty(&outcome.to_result().to_value())?;
        writeln!(out, "{}", redact_sensitive(&rendered))?;
    } else {
        for entry in &outcome.transcript {
            writeln!(out, "{}", redact_sensitive(entry))?;
        }
        if !outcome.success {
            writeln!(out, "{}", redact_sensitive(&outcome.to_result().output_text()))?;
        }
    }

    Ok(outcome.success)
}

fn validate_command(path: &Path, out: &mut impl Write) -> Result<bool> {
    let result = validate_workflow_file(path);
    if result.success {
        let step_count = result
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("step_count"))
            .and_then(Value::as_u64)
            .unwrap_or_default();
        writeln!(out, "{}: valid ({step_count} steps)", path.display())?;
    } else {
        writeln!(out, "{}: {}", path.display(), redact_sensitive(&result.output_text()))?;
    }
    Ok(result.success)
}

fn tools_command(settings: &Settings, out: &mut impl Write) -> Result<bool> {
    let run_settings = run_settings(settings, default_workspace_root(settings)?);
    let registry = builtins::builtin_registry(&run_settings, Arc::new(SessionStore::new()));
    let mut entries: Vec<_> = registry.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    writeln!(out, "Available tools:")?;
    for (name, capability) in entries {
        writeln!(out, "- {}: {}", name, capability.description())?;
    }
    Ok(true)
}

/// Invokes a single capability, bypassing any workflow.
fn tool_run_command(settings: &Settings, name: &str, raw_args: &str, out: &mut impl Write) -> Result<bool> {
    let run_settings = run_settings(settings, default_workspace_root(settings)?);
    let registry = builtins::builtin_registry(&run_settings, Arc::new(SessionStore::new()));
    let Some(capability) = registry.get(name) else {
        writeln!(out, "unknown tool '{name}'")?;
        return Ok(false);
    };
    let args = match parse_tool_arguments(raw_args) {
        Ok(args) => args,
        Err(error) => {
            writeln!(out, "{error:#}")?;
            return Ok(false);
        }
    };

    let result = capability
        .invoke(&args)
        .unwrap_or_else(|error| CapabilityResult::failure(format!("{error:#}")));
    let rendered = serde_json::to_string_pretty(&result.to_value())?;
    writeln!(out, "{}", redact_sensitive(&rendered))?;
    Ok(result.success)
}

fn parse_tool_arguments(raw_args: &str) -> Result<JsonMap<String, Value>> {
    match serde_json::from_str::<Value>(raw_args).context("invalid JSON args")? {
        Value::Object(args) => Ok(args),
        other => bail!("tool arguments must be a JSON object, got {other}"),
    }
}

fn config_command(settings: &Settings, out: &mut impl Write) -> Result<bool> {
    writeln!(out, "{}", settings.to_pretty_json()?)?;
    Ok(true)
}

fn run_settings(settings: &Settings, workspace_root: PathBuf) -> RunSettings {
    RunSettings {
        workspace_root,
        expression_engine: settings.expression_engine,
        options: execution_options(settings),
    }
}

fn execution_options(settings: &Settings) -> ExecutionOptions {
    let default_retry_delay = settings.default_retry_delay.as_deref().and_then(|raw| {
        let parsed = parse_delay(raw);
        if parsed.is_none() {
            warn!(default_retry_delay = %raw, "ignoring unparsable default_retry_delay setting");
        }
        parsed
    });
    ExecutionOptions {
        cancellation: None,
        default_retry_delay,
    }
}

fn default_workspace_root(settings: &Settings) -> Result<PathBuf> {
    match &settings.workspace_root {
        Some(root) => Ok(root.clone()),
        None => std::env::current_dir().context("failed to read the current directory"),
    }
}

fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let current = std::env::current_dir().context("failed to read the current directory")?;
    Ok(current.join(path))
}

/// Nearest ancestor of the workflow file containing `.git`, else its directory.
fn detect_workspace_root(workflow_path: &Path) -> PathBuf {
    let parent = workflow_path.parent().unwrap_or_else(|| Path::new("."));
    parent
        .ancestors()
        .find(|candidate| candidate.join(".git").exists())
        .unwrap_or(parent)
        .to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_util::ExpressionEngine;

    fn settings_for(root: &Path) -> Settings {
        Settings {
            workspace_root: Some(root.to_path_buf()),
            ..Settings::default()
        }
    }

    fn captured(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).expect("utf-8 output")
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn workspace_root_prefers_git_ancestor() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let nested = temp_dir.path().join("flows").join("ci");
        std::fs::create_dir_all(&nested).expect("mkdir");
        assert_eq!(detect_workspace_root(&nested.join("build.yaml")), nested);

        std::fs::create_dir(temp_dir.path().join(".git")).expect("mkdir .git");
        assert_eq!(detect_workspace_root(&nested.join("build.yaml")), temp_dir.path());
    }

    #[test]
    fn run_arguments_capture_trailing_parameters() {
        let Args { command } =
            Args::try_parse_from(["stepflow", "run", "flow.yaml", "-p", "a=1", "--name", "ada", "mode=fast"]).expect("parse");
        let Command::Run { path, params, extra, json } = command else {
            panic!("expected run command");
        };
        assert_eq!(path, PathBuf::from("flow.yaml"));
        assert_eq!(params, vec!["a=1"]);
        assert_eq!(extra, vec!["--name", "ada", "mode=fast"]);
        assert!(!json);
    }

    #[test]
    fn tool_run_arguments_default_to_an_empty_object() {
        let Args { command } = Args::try_parse_from(["stepflow", "tool-run", "echo"]).expect("parse");
        let Command::ToolRun { name, args } = command else {
            panic!("expected tool-run command");
        };
        assert_eq!(name, "echo");
        assert_eq!(args, "{}");
    }

    #[test]
    fn run_prints_success_line_and_redacted_transcript() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("flow.yaml");
        std::fs::write(&path, "steps:\n  - id: a\n    tool: echo\n    args:\n      text: \"API_TOKEN={{ token }}\"\n")
            .expect("write");

        let mut out = Vec::new();
        let success = run_command(&settings_for(temp_dir.path()), &path, &strings(&["token=s3cr3t"]), &[], false, &mut out)
            .expect("run");

        assert!(success);
        assert_eq!(captured(out), "workflow success=true\na:echo:API_TOKEN=[REDACTED]\n");
    }

    #[test]
    fn failed_run_exits_non_zero_and_reports_the_failure() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("flow.json");
        std::fs::write(
            &path,
            r#"{"steps": [{"id": "broken", "tool": "fail", "args": {"message": "nope"}}, {"id": "after", "tool": "echo"}]}"#,
        )
        .expect("write");

        let mut out = Vec::new();
        let success = run_command(&settings_for(temp_dir.path()), &path, &[], &[], false, &mut out).expect("run");

        assert!(!success);
        assert_eq!(captured(out), "workflow success=false\nbroken:fail:nope\nstep broken failed: nope\n");
    }

    #[test]
    fn json_run_prints_the_result_record() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("flow.json");
        std::fs::write(&path, r#"{"steps": [{"id": "a", "tool": "echo", "args": {"text": "{{ name }}"}}]}"#).expect("write");

        let mut out = Vec::new();
        let success = run_command(&settings_for(temp_dir.path()), &path, &[], &strings(&["--name", "ada"]), true, &mut out)
            .expect("run");

        assert!(success);
        let output = captured(out);
        let json_text = output.strip_prefix("workflow success=true\n").expect("success line");
        let record: Value = serde_json::from_str(json_text).expect("json record");
        assert_eq!(record["success"], true);
        assert_eq!(record["output"], "workflow completed");
        assert_eq!(record["metadata"]["transcript"], serde_json::json!(["a:echo:ada"]));
        assert_eq!(record["metadata"]["params"]["name"], "ada");
        assert_eq!(record["metadata"]["context"]["steps"]["a"]["output"], "ada");
    }

    #[test]
    fn validate_reports_step_count() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("flow.json");
        std::fs::write(&path, r#"{"steps": [{"id": "a"}, {"id": "b"}]}"#).expect("write");

        let mut out = Vec::new();
        assert!(validate_command(&path, &mut out).expect("validate"));
        assert_eq!(captured(out), format!("{}: valid (2 steps)\n", path.display()));
    }

    #[test]
    fn tool_run_invokes_one_capability() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let settings = settings_for(temp_dir.path());

        let mut out = Vec::new();
        assert!(tool_run_command(&settings, "echo", r#"{"text": "hi"}"#, &mut out).expect("tool-run"));
        let record: Value = serde_json::from_str(&captured(out)).expect("json record");
        assert_eq!(record["output"], "hi");
        assert_eq!(record["success"], true);

        let mut out = Vec::new();
        assert!(!tool_run_command(&settings, "analyze", "{}", &mut out).expect("tool-run"));
        let record: Value = serde_json::from_str(&captured(out)).expect("json record");
        assert!(record["output"].as_str().is_some_and(|text| text.contains("'text'")));
    }

    #[test]
    fn tool_run_rejects_unknown_tools_and_bad_arguments() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let settings = settings_for(temp_dir.path());

        let mut out = Vec::new();
        assert!(!tool_run_command(&settings, "nope", "{}", &mut out).expect("tool-run"));
        assert_eq!(captured(out), "unknown tool 'nope'\n");

        let mut out = Vec::new();
        assert!(!tool_run_command(&settings, "echo", "{broken", &mut out).expect("tool-run"));
        assert!(captured(out).starts_with("invalid JSON args"));

        let mut out = Vec::new();
        assert!(!tool_run_command(&settings, "echo", "[1]", &mut out).expect("tool-run"));
        assert!(captured(out).contains("must be a JSON object"));
    }

    #[test]
    fn config_prints_resolved_settings() {
        let settings = Settings {
            expression_engine: ExpressionEngine::Basic,
            default_retry_delay: Some("250ms".into()),
            ..Settings::default()
        };

        let mut out = Vec::new();
        assert!(config_command(&settings, &mut out).expect("config"));
        let printed: Value = serde_json::from_str(&captured(out)).expect("json settings");
        assert_eq!(printed["expression_engine"], "basic");
        assert_eq!(printed["log_level"], "info");
        assert_eq!(printed["default_retry_delay"], "250ms");
    }

    #[test]
    fn run_settings_follow_configuration() {
        let settings = Settings {
            expression_engine: ExpressionEngine::Basic,
            default_retry_delay: Some("2s".into()),
            ..Settings::default()
        };
        let run_settings = run_settings(&settings, PathBuf::from("/work"));
        assert_eq!(run_settings.options.default_retry_delay, Some(std::time::Duration::from_secs(2)));
        assert_eq!(builtins::resolver_for(run_settings.expression_engine).name(), "basic");
        assert_eq!(builtins::resolver_for(ExpressionEngine::Rich).name(), "rich");
    }
}
