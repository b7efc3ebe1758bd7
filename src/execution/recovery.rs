//! Failure classification, output sanity checks and retry backoff.

use super::monitor::MonitorFlags;
use crate::plan::{AdaptationTrigger, Step, ToolCategory};
use crate::tools::ToolErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// What went wrong with a step attempt
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    ResourceConstraint,
    ToolError,
    NetworkError,
    PermissionError,
    UnexpectedResult,
    PerformanceIssue,
    /// No recovery strategy applies
    Unknown,
}

impl ErrorCategory {
    /// Adaptation trigger recorded for this category
    pub fn trigger(&self) -> AdaptationTrigger {
        match self {
            ErrorCategory::Timeout => AdaptationTrigger::Timeout,
            ErrorCategory::ResourceConstraint => AdaptationTrigger::ResourceConstraint,
            ErrorCategory::UnexpectedResult => AdaptationTrigger::UnexpectedResult,
            ErrorCategory::PerformanceIssue => AdaptationTrigger::PerformanceIssue,
            ErrorCategory::ToolError
            | ErrorCategory::NetworkError
            | ErrorCategory::PermissionError
            | ErrorCategory::Unknown => AdaptationTrigger::Error,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ResourceConstraint => "resource_constraint",
            ErrorCategory::ToolError => "tool_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::PermissionError => "permission_error",
            ErrorCategory::UnexpectedResult => "unexpected_result",
            ErrorCategory::PerformanceIssue => "performance_issue",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A failed attempt, classified
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub flags: MonitorFlags,
}

const MESSAGE_RULES: &[(&[&str], ErrorCategory)] = &[
    (&["timeout", "timed out", "deadline"], ErrorCategory::Timeout),
    (
        &["resource", "memory", "quota", "capacity"],
        ErrorCategory::ResourceConstraint,
    ),
    (
        &["not found", "unsupported", "unknown tool", "no such"],
        ErrorCategory::ToolError,
    ),
    (
        &[
            "network",
            "connection",
            "unreachable",
            "rate limit",
            "502",
            "503",
        ],
        ErrorCategory::NetworkError,
    ),
    (
        &[
            "permission",
            "denied",
            "forbidden",
            "unauthorized",
            "read-only",
        ],
        ErrorCategory::PermissionError,
    ),
    (
        &["unexpected result", "invalid output"],
        ErrorCategory::UnexpectedResult,
    ),
];

/// First match wins: the structured tool error kind, then message
/// substrings, then the monitor's flags
pub fn classify_error(
    kind: Option<ToolErrorKind>,
    message: &str,
    flags: &MonitorFlags,
) -> ErrorCategory {
    match kind {
        Some(ToolErrorKind::Timeout) => return ErrorCategory::Timeout,
        Some(ToolErrorKind::ResourceExhausted) => return ErrorCategory::ResourceConstraint,
        Some(
            ToolErrorKind::NotFound | ToolErrorKind::Unsupported | ToolErrorKind::InvalidParameters,
        ) => return ErrorCategory::ToolError,
        Some(ToolErrorKind::Network) => return ErrorCategory::NetworkError,
        Some(ToolErrorKind::Permission) => return ErrorCategory::PermissionError,
        Some(ToolErrorKind::Failed) | None => {}
    }

    let message = message.to_lowercase();
    for (needles, category) in MESSAGE_RULES {
        if needles.iter().any(|needle| message.contains(needle)) {
            return *category;
        }
    }

    if flags.timeout {
        ErrorCategory::Timeout
    } else if flags.resource_constraint {
        ErrorCategory::ResourceConstraint
    } else if flags.performance_issue {
        ErrorCategory::PerformanceIssue
    } else {
        ErrorCategory::Unknown
    }
}

/// Shape check of a tool result; `Err` carries the reason it looks wrong.
/// Only the fields needed for a sanity check are inspected.
pub fn validate_output(step: &Step, output: &Value) -> Result<(), String> {
    let Some(object) = output.as_object() else {
        return Err(format!("unexpected result from {}: not a JSON object", step.tool));
    };

    if object.get("success").and_then(Value::as_bool) == Some(false) {
        let detail = object
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("no detail");
        return Err(format!(
            "unexpected result from {}: success=false ({})",
            step.tool, detail
        ));
    }

    if let Some(code) = object.get("exit_code").and_then(Value::as_i64)
        && code != 0
    {
        return Err(format!(
            "unexpected result from {}: exit_code {}",
            step.tool, code
        ));
    }

    let missing = match step.category() {
        ToolCategory::Search => (!object.get("results").is_some_and(Value::is_array))
            .then_some("results[]"),
        ToolCategory::FileRead | ToolCategory::FileWrite => {
            (!object.contains_key("path")).then_some("path")
        }
        ToolCategory::Shell => (!object.contains_key("stdout") && !object.contains_key("stderr"))
            .then_some("stdout/stderr"),
        _ => None,
    };
    match missing {
        Some(field) => Err(format!(
            "unexpected result from {}: missing {}",
            step.tool, field
        )),
        None => Ok(()),
    }
}

/// Exponential backoff for network retries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Random spread as a share of the delay (0.1 = ±10%)
    pub jitter: f64,
}

impl RetryPolicy {
    /// `min(delay * 2, max_delay)`
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }

    /// Delay with jitter applied, never above `max_delay`
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay.min(self.max_delay);
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 - spread + 2.0 * spread * rand::random::<f64>();
        delay.mul_f64(factor.max(0.0)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_flags() -> MonitorFlags {
        MonitorFlags::default()
    }

    #[test]
    fn test_structured_kind_wins_over_message() {
        let category = classify_error(
            Some(ToolErrorKind::Permission),
            "connection timed out",
            &no_flags(),
        );
        assert_eq!(category, ErrorCategory::PermissionError);
    }

    #[test]
    fn test_message_substrings_in_order() {
        let classify = |m: &str| classify_error(Some(ToolErrorKind::Failed), m, &no_flags());
        assert_eq!(classify("Request Timeout after 30s"), ErrorCategory::Timeout);
        assert_eq!(classify("out of memory"), ErrorCategory::ResourceConstraint);
        assert_eq!(classify("tool 'grep' not found"), ErrorCategory::ToolError);
        assert_eq!(classify("upstream returned 503"), ErrorCategory::NetworkError);
        assert_eq!(classify("Permission denied"), ErrorCategory::PermissionError);
        // timeout is checked before network
        assert_eq!(classify("connection timeout"), ErrorCategory::Timeout);
        assert_eq!(classify("invalid output shape"), ErrorCategory::UnexpectedResult);
        assert_eq!(classify("segfault"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_monitor_flags_are_the_last_resort() {
        let flags = MonitorFlags {
            timeout: false,
            resource_constraint: true,
            performance_issue: true,
        };
        assert_eq!(
            classify_error(None, "exit 1", &flags),
            ErrorCategory::ResourceConstraint
        );
        let slow = MonitorFlags {
            performance_issue: true,
            ..MonitorFlags::default()
        };
        assert_eq!(
            classify_error(None, "exit 1", &slow),
            ErrorCategory::PerformanceIssue
        );
    }

    #[test]
    fn test_output_validation_by_tool_shape() {
        let search = Step::new("s", "web_search");
        assert!(validate_output(&search, &json!({"success": true, "results": []})).is_ok());
        assert!(validate_output(&search, &json!({"success": true})).is_err());

        let shell = Step::new("sh", "shell");
        assert!(validate_output(&shell, &json!({"stdout": "ok", "exit_code": 0})).is_ok());
        let failed = validate_output(&shell, &json!({"stdout": "", "exit_code": 2})).unwrap_err();
        assert!(failed.contains("exit_code 2"));

        let write = Step::new("w", "file_write");
        assert!(validate_output(&write, &json!({"path": "a.txt"})).is_ok());
        assert!(validate_output(&write, &json!({"success": false, "error": "disk"})).is_err());

        let other = Step::new("o", "custom");
        assert!(validate_output(&other, &json!("plain text")).is_err());
        assert!(validate_output(&other, &json!({})).is_ok());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        let mut delay = policy.initial_delay;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = policy.next_delay(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        };
        for _ in 0..50 {
            let delay = policy.jittered(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(9) && delay <= Duration::from_secs(11));
        }
    }
}
