//! Adaptive step execution.
//!
//! The [`AdaptiveExecutionEngine`] walks a resolved schedule level by level.
//! Each step attempt races the tool call against a hard deadline while a
//! [`StepMonitor`] watches progress and memory. Failures are classified into
//! an [`ErrorCategory`] and handed to a step adapter, which may derive a
//! modified step for the next attempt.

pub mod engine;
pub mod monitor;
pub mod recovery;

pub use engine::{
    AdaptiveExecutionEngine, CancellationFlag, EngineConfig, ExecutionContext, HaltReason,
    PlanExecution, StepReservations, describe_levels,
};
pub use monitor::{MonitorFlags, StepMonitor};
pub use recovery::{ErrorCategory, RetryPolicy, StepFailure, classify_error, validate_output};
