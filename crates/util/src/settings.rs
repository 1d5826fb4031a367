//! Runtime settings for the Stepflow CLI.
//!
//! Settings live in a small JSON file under the standard configuration
//! directory (`~/.config/stepflow/settings.json` on most platforms). A missing
//! file yields defaults; an unreadable one is reported, while an unparsable one
//! is replaced by defaults and the parse error is handed back to the caller,
//! which usually has not set up logging yet. Selected fields can be overridden
//! from the environment.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expand_tilde;

/// Environment variable allowing callers to override the settings file path.
pub const SETTINGS_PATH_ENV: &str = "STEPFLOW_SETTINGS_PATH";
/// Environment variable overriding [`Settings::expression_engine`].
pub const EXPRESSION_ENGINE_ENV: &str = "STEPFLOW_EXPRESSION_ENGINE";
/// Environment variable overriding [`Settings::log_level`].
pub const LOG_LEVEL_ENV: &str = "STEPFLOW_LOG_LEVEL";

/// Default filename for the JSON payload.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Error surfaced when reading or writing settings fails.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// I/O failure (for example, permissions or missing directory).
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure while rendering settings.
    #[error("settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A field or override holds an unsupported value.
    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
}

/// Which expression resolver the interpreter is constructed with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionEngine {
    /// Operator-aware evaluation with path fallback.
    #[default]
    Rich,
    /// Plain key and dotted/bracketed path lookup.
    Basic,
}

impl FromStr for ExpressionEngine {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rich" => Ok(Self::Rich),
            "basic" => Ok(Self::Basic),
            _ => Err(SettingsError::InvalidValue {
                field: "expression_engine",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for ExpressionEngine {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rich => formatter.write_str("rich"),
            Self::Basic => formatter.write_str("basic"),
        }
    }
}

/// Persisted settings values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Expression resolver used for templates, conditions, and loop sources.
    pub expression_engine: ExpressionEngine,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Root directory for workspace-relative capabilities. Defaults to the
    /// directory holding the workflow file.
    pub workspace_root: Option<PathBuf>,
    /// Delay applied between attempts when a step sets `retries` without `retry_delay`.
    pub default_retry_delay: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            expression_engine: ExpressionEngine::default(),
            log_level: "info".to_string(),
            workspace_root: None,
            default_retry_delay: None,
        }
    }
}

/// Settings together with where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSettings {
    pub settings: Settings,
    /// File that was consulted, whether or not it existed.
    pub path: PathBuf,
    /// Parse error of a settings file that was ignored in favor of defaults.
    pub ignored_error: Option<String>,
}

impl Settings {
    /// Loads settings from the default path and applies environment overrides.
    pub fn load() -> Result<LoadedSettings, SettingsError> {
        let mut loaded = Self::load_from_path(&default_settings_path())?;
        loaded.settings.apply_environment_overrides()?;
        Ok(loaded)
    }

    /// Loads settings from `path` without consulting the environment.
    pub fn load_from_path(path: &Path) -> Result<LoadedSettings, SettingsError> {
        let (mut settings, ignored_error) = match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<Settings>(&data) {
                Ok(settings) => (settings, None),
                Err(error) => (Settings::default(), Some(error.to_string())),
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => (Settings::default(), None),
            Err(error) => return Err(SettingsError::Io(error)),
        };
        if let Some(root) = settings.workspace_root.take() {
            settings.workspace_root = Some(expand_tilde(&root.to_string_lossy()));
        }
        Ok(LoadedSettings {
            settings,
            path: path.to_path_buf(),
            ignored_error,
        })
    }

    /// Applies `STEPFLOW_EXPRESSION_ENGINE` and `STEPFLOW_LOG_LEVEL` when set.
    pub fn apply_environment_overrides(&mut self) -> Result<(), SettingsError> {
        if let Ok(engine) = env::var(EXPRESSION_ENGINE_ENV)
            && !engine.trim().is_empty()
        {
            self.expression_engine = engine.parse()?;
        }
        if let Ok(level) = env::var(LOG_LEVEL_ENV)
            && !level.trim().is_empty()
        {
            self.log_level = level.trim().to_string();
        }
        Ok(())
    }

    /// Renders the settings as pretty JSON.
    pub fn to_pretty_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Returns the settings file path, honoring [`SETTINGS_PATH_ENV`].
pub fn default_settings_path() -> PathBuf {
    if let Ok(path) = env::var(SETTINGS_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stepflow")
        .join(SETTINGS_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("absent.json");
        let loaded = Settings::load_from_path(&path).expect("load");
        assert_eq!(loaded.settings, Settings::default());
        assert_eq!(loaded.settings.expression_engine, ExpressionEngine::Rich);
        assert_eq!(loaded.path, path);
        assert_eq!(loaded.ignored_error, None);
    }

    #[test]
    fn rendered_settings_load_back() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join(SETTINGS_FILE_NAME);
        let settings = Settings {
            expression_engine: ExpressionEngine::Basic,
            log_level: "debug".into(),
            workspace_root: Some(PathBuf::from("/srv/work")),
            default_retry_delay: Some("250ms".into()),
        };
        let rendered = settings.to_pretty_json().expect("render");
        assert!(rendered.contains(r#""expression_engine": "basic""#));
        fs::write(&path, rendered).expect("write");
        assert_eq!(Settings::load_from_path(&path).expect("load").settings, settings);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults_and_reports_why() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, "{ not json").expect("write");
        let loaded = Settings::load_from_path(&path).expect("load");
        assert_eq!(loaded.settings, Settings::default());
        assert!(loaded.ignored_error.is_some_and(|error| error.contains("line 1")));
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, r#"{"expression_engine": "basic"}"#).expect("write");
        let settings = Settings::load_from_path(&path).expect("load").settings;
        assert_eq!(settings.expression_engine, ExpressionEngine::Basic);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn environment_overrides_apply() {
        temp_env::with_vars(
            [(EXPRESSION_ENGINE_ENV, Some("BASIC")), (LOG_LEVEL_ENV, Some("trace"))],
            || {
                let mut settings = Settings::default();
                settings.apply_environment_overrides().expect("overrides");
                assert_eq!(settings.expression_engine, ExpressionEngine::Basic);
                assert_eq!(settings.log_level, "trace");
            },
        );
    }

    #[test]
    fn invalid_engine_override_is_rejected() {
        temp_env::with_var(EXPRESSION_ENGINE_ENV, Some("cel"), || {
            let mut settings = Settings::default();
            let error = settings.apply_environment_overrides().expect_err("invalid engine");
            assert!(error.to_string().contains("expression_engine"));
        });
    }

    #[test]
    fn default_path_honors_environment_override() {
        temp_env::with_var(SETTINGS_PATH_ENV, Some("/tmp/stepflow/custom.json"), || {
            assert_eq!(default_settings_path(), PathBuf::from("/tmp/stepflow/custom.json"));
        });
    }
}
