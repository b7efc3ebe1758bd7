use crate::plan::ParameterMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Structured failure category reported by a tool backend
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Timeout,
    ResourceExhausted,
    NotFound,
    Unsupported,
    Network,
    Permission,
    InvalidParameters,
    /// Anything the backend could not categorize
    Failed,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::ResourceExhausted => "resource_exhausted",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::Unsupported => "unsupported",
            ToolErrorKind::Network => "network",
            ToolErrorKind::Permission => "permission",
            ToolErrorKind::InvalidParameters => "invalid_parameters",
            ToolErrorKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error returned by a tool call
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Uncategorized failure; classification falls back to the message
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Failed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Network, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Permission, message)
    }
}

/// Shared progress/memory gauge a tool can update while it runs.
///
/// Values are stored as `f64` bits in atomics so the tool and the step
/// monitor never contend on a lock.
#[derive(Clone, Debug, Default)]
pub struct ProgressReporter {
    progress: Arc<AtomicU64>,
    memory: Arc<AtomicU64>,
    reported: Arc<AtomicBool>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record completion as a fraction, clamped to 0.0..=1.0
    pub fn report(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.progress.store(fraction.to_bits(), Ordering::Relaxed);
        self.reported.store(true, Ordering::Relaxed);
    }

    /// Whether the tool reported progress at least once
    pub fn has_reported(&self) -> bool {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    /// Record the tool's current memory use in resource units
    pub fn report_memory(&self, units: f64) {
        self.memory.store(units.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Last reported memory use, if the tool reports any
    pub fn memory(&self) -> Option<f64> {
        let value = f64::from_bits(self.memory.load(Ordering::Relaxed));
        (value > 0.0).then_some(value)
    }
}

/// Per-call options passed to the tool backend
#[derive(Clone, Debug)]
pub struct ToolOptions {
    pub timeout: Duration,
    pub task_id: String,
    pub step_id: String,
    pub progress: ProgressReporter,
}

impl ToolOptions {
    pub fn new(task_id: impl Into<String>, step_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            timeout,
            task_id: task_id.into(),
            step_id: step_id.into(),
            progress: ProgressReporter::new(),
        }
    }
}

/// Backend that runs named tools. Results are JSON maps that should carry a
/// `success` flag plus shape-specific fields.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool: &str,
        parameters: &ParameterMap,
        options: ToolOptions,
    ) -> Result<Value, ToolError>;

    /// Names of the tools this backend can run
    fn available_tools(&self) -> Vec<String>;
}
