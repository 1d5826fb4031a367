//! # Text Processing Utilities
//!
//! Redaction of secret-looking values before text is echoed to a terminal or
//! a log sink. Workflow transcripts routinely embed capability output, which
//! can carry credentials pulled from the environment.

use once_cell::sync::Lazy;
use regex::Regex;

/// Redacts values that look like secrets in a string.
///
/// This function scans input text for patterns that commonly indicate
/// sensitive information like API keys, tokens, passwords, and database URLs.
/// When found, these values are replaced with `[REDACTED]` while preserving
/// the key names for debugging purposes.
///
/// # Example
/// ```rust
/// use stepflow_util::text_processing::redact_sensitive;
///
/// let input = "API_KEY=abc123 TOKEN=xyz789";
/// let redacted = redact_sensitive(input);
/// assert_eq!(redacted, "API_KEY=[REDACTED] TOKEN=[REDACTED]");
///
/// let input = "Authorization: Bearer secret123";
/// let redacted = redact_sensitive(input);
/// assert_eq!(redacted, "Authorization: [REDACTED]");
/// ```
pub fn redact_sensitive(input: &str) -> String {
    redact_sensitive_with(input, "[REDACTED]")
}

/// Redacts sensitive-looking values, using a custom replacement token.
pub fn redact_sensitive_with(input: &str, replacement: &str) -> String {
    let mut redacted = input.to_string();

    for pattern in redact_patterns().iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| {
                let prefix = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{}{}", prefix, replacement)
            })
            .to_string();
    }

    redacted
}

/// Returns the compiled redaction patterns, most specific first.
///
/// Each pattern captures the part to keep in group 1 and the secret in group 2.
fn redact_patterns() -> &'static Vec<Regex> {
    static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(build_redact_patterns);

    &REDACT_PATTERNS
}

fn build_redact_patterns() -> Vec<Regex> {
    const PATTERNS: &[&str] = &[
        r"(?i)(authorization:\s+)([^\s]+(?:\s+[^\s,;]+)?)",
        r"(?i)((?:^|\b)Bearer\s+)([A-Za-z0-9\-._~+/]+=*)",
        r"(?i)(\b[A-Z0-9_]*(?:KEY|TOKEN|SECRET|PASSWORD|PASSWD)\s*[=:]\s*)([^\s,;]+)",
        r"(?i)(\b(?:DATABASE_URL|REDIS_URL|MONGODB_URI)\s*[=:]\s*)([^\s,;]+)",
    ];

    PATTERNS.iter().filter_map(|pattern| Regex::new(pattern).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_environment_style_assignments() {
        assert_eq!(redact_sensitive("GITHUB_TOKEN=ghp_abc123 done"), "GITHUB_TOKEN=[REDACTED] done");
        assert_eq!(redact_sensitive("password: hunter2"), "password: [REDACTED]");
    }

    #[test]
    fn redacts_database_urls() {
        assert_eq!(
            redact_sensitive("DATABASE_URL=postgres://u:p@h/db"),
            "DATABASE_URL=[REDACTED]"
        );
    }

    #[test]
    fn leaves_plain_text_alone() {
        let text = "a:echo:hello world";
        assert_eq!(redact_sensitive(text), text);
    }

    #[test]
    fn custom_replacement_is_used() {
        assert_eq!(redact_sensitive_with("API_KEY=xyz", "***"), "API_KEY=***");
    }
}
