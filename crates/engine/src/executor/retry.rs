//! Bounded retry of a single capability invocation.
//!
//! A step runs once plus `retries` additional times while attempts keep
//! failing. Every attempt, successful or not, appends one transcript entry.
//! When a base delay is configured the wait doubles after each failure.

use std::{thread, time::Duration};

use serde_json::{Map as JsonMap, Value};
use stepflow_types::CapabilityResult;
use tracing::{debug, warn};

use super::runner::Capability;

/// Upper bound on the backoff multiplier (`2^MAX_BACKOFF_EXPONENT`).
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Outcome of running a capability under a retry policy.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RetriedInvocation {
    /// Result of the last attempt.
    pub result: CapabilityResult,
    /// Number of invocations performed (at least 1).
    pub attempts: u32,
}

/// Invokes `capability` until it succeeds or `retries + 1` attempts have been made.
pub(crate) fn run_with_retries(
    step_id: &str,
    tool: &str,
    capability: &dyn Capability,
    args: &JsonMap<String, Value>,
    retries: u32,
    base_delay: Option<Duration>,
    transcript: &mut Vec<String>,
) -> RetriedInvocation {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = invoke_capability(capability, args);
        transcript.push(format!("{step_id}:{tool}:{}", result.output_text()));

        if result.success {
            debug!(step_id = %step_id, tool = %tool, attempt, "attempt succeeded");
            return RetriedInvocation { result, attempts: attempt };
        }
        if attempt > retries {
            return RetriedInvocation { result, attempts: attempt };
        }

        let delay = base_delay.map(|base| backoff_delay(base, attempt)).unwrap_or_default();
        warn!(
            step_id = %step_id,
            tool = %tool,
            attempt,
            remaining = retries - attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "attempt failed; retrying"
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Invokes a capability, folding a raised error into an unsuccessful result.
fn invoke_capability(capability: &dyn Capability, args: &JsonMap<String, Value>) -> CapabilityResult {
    match capability.invoke(args) {
        Ok(result) => result,
        Err(error) => CapabilityResult::failure(format!("{error:#}")),
    }
}

/// Delay before the attempt following `failed_attempt` (1-based).
pub(crate) fn backoff_delay(base: Duration, failed_attempt: u32) -> Duration {
    let exponent = failed_attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent)
}

/// Parses a delay such as `"250ms"`, `"2s"`, `"1m"`, or a bare number of seconds.
pub fn parse_delay(raw_delay: &str) -> Option<Duration> {
    let trimmed = raw_delay.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(millis) = trimmed.strip_suffix("ms") {
        return millis.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    let last_character = trimmed.chars().last()?;
    if last_character.is_ascii_alphabetic() {
        let number = trimmed[..trimmed.len() - 1].trim();
        let value: u64 = number.parse().ok()?;
        return match last_character {
            's' | 'S' => Some(Duration::from_secs(value)),
            'm' | 'M' => Some(Duration::from_secs(value.saturating_mul(60))),
            _ => None,
        };
    }
    let value: u64 = trimmed.parse().ok()?;
    Some(Duration::from_secs(value))
}
