//! Task orchestration: admission control, planning, resource reservation,
//! adaptive execution and result aggregation for one task at a time, many
//! tasks concurrently.

pub mod engine;
pub mod types;

pub use engine::TaskOrchestrator;
pub use types::{ActiveTask, OrchestrationMetrics, OrchestrationResult, OrchestratorConfig};

#[cfg(test)]
mod tests;
