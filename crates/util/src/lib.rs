//! Utility helpers shared by the Stepflow engine and CLI.

pub mod path_processing;
pub mod settings;
pub mod text_processing;

pub use path_processing::{expand_tilde, is_within_root, normalize_lexically};
pub use settings::{ExpressionEngine, LoadedSettings, Settings, SettingsError, default_settings_path};
pub use text_processing::{redact_sensitive, redact_sensitive_with};
