//! Error taxonomy shared across the orchestration core.
//!
//! Component-local failures (`ResourceError`, `ToolError`, ...) live next to
//! the component that raises them and convert into [`OrchestraError`] at the
//! orchestrator boundary.

use crate::execution::ErrorCategory;
use crate::plan::StepId;
use crate::resources::ResourceError;

/// Top-level error type surfaced by the orchestration core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestraError {
    /// Bad request or plan shape. Fatal, surfaced immediately.
    #[error("Validation failed: {0}")]
    Validation(String),
    /// Cycle or missing dependency. Recovered by the resolver and reported
    /// in the result's issues.
    #[error("Dependency error: {0}")]
    Dependency(String),
    /// Capacity unavailable and the request's own timeout elapsed.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[from] ResourceError),
    /// A step failed after classification.
    #[error("Step {step_id} failed ({category}): {message}")]
    Execution {
        step_id: StepId,
        category: ErrorCategory,
        message: String,
    },
    /// The per-step adaptation bound was reached.
    #[error("Adaptation exhausted for step {step_id} after {attempts} attempts: {last_error}")]
    AdaptationExhausted {
        step_id: StepId,
        attempts: u32,
        last_error: String,
    },
    /// Task-level admission control rejected the request.
    #[error("Admission rejected: {active} active orchestrations (limit {limit})")]
    AdmissionRejected { active: usize, limit: usize },
    /// The orchestration was cancelled before any step started.
    #[error("Orchestration {0} was cancelled")]
    Cancelled(String),
    /// Catch-all at the top level, e.g. a task id that is already running.
    #[error("Orchestration failed: {0}")]
    Orchestration(String),
}

impl OrchestraError {
    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestraError::Validation(_) => "validation_error",
            OrchestraError::Dependency(_) => "dependency_error",
            OrchestraError::ResourceExhausted(_) => "resource_exhaustion_error",
            OrchestraError::Execution { .. } => "execution_error",
            OrchestraError::AdaptationExhausted { .. } => "adaptation_exhausted_error",
            OrchestraError::AdmissionRejected { .. } => "admission_rejected",
            OrchestraError::Cancelled(_) => "cancelled",
            OrchestraError::Orchestration(_) => "orchestration_error",
        }
    }

    /// Whether the caller can reasonably resubmit the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestraError::AdmissionRejected { .. } | OrchestraError::ResourceExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceType;

    #[test]
    fn test_resource_errors_convert_to_exhaustion() {
        let error = OrchestraError::from(ResourceError::Timeout {
            step_key: "t1/a".to_string(),
            resource_type: ResourceType::Cpu,
            waited_ms: 10,
        });
        assert_eq!(error.kind(), "resource_exhaustion_error");
        assert!(error.is_transient());
        assert!(error.to_string().starts_with("Resource exhausted"));
    }

    #[test]
    fn test_cancellation_is_not_transient() {
        let error = OrchestraError::Cancelled("t1".to_string());
        assert_eq!(error.kind(), "cancelled");
        assert!(!error.is_transient());
        assert_eq!(error.to_string(), "Orchestration t1 was cancelled");
    }
}
