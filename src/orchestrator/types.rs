use crate::execution::HaltReason;
use crate::plan::types::duration_ms;
use crate::plan::{AdaptationEvent, ExecutionResult, ExecutionStrategy, StepId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Task-level admission and resource request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
    /// How long one step waits for its resource grant before running ungranted
    pub resource_request_timeout_ms: u64,
    /// Admission stays halved this long after a critical resource alert
    pub throttle_cooldown_ms: u64,
    /// Multiplier on the per-step cpu and memory estimates
    pub resource_scale: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            resource_request_timeout_ms: 5_000,
            throttle_cooldown_ms: 30_000,
            resource_scale: 1.0,
        }
    }
}

impl OrchestratorConfig {
    pub fn resource_request_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_request_timeout_ms)
    }

    pub fn throttle_cooldown(&self) -> Duration {
        Duration::from_millis(self.throttle_cooldown_ms)
    }
}

/// Everything an orchestration produced. Partial results survive early
/// stops and cancellation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrchestrationResult {
    pub task_id: TaskId,
    pub plan_id: String,
    pub strategy: ExecutionStrategy,
    /// The plan is the minimal fallback plan
    pub fallback: bool,
    pub success: bool,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    /// Steps interrupted by cancellation or the deadline while running
    pub steps_cancelled: usize,
    pub steps_not_started: usize,
    pub adaptations_made: usize,
    pub adaptations: Vec<AdaptationEvent>,
    /// In completion order
    pub results: Vec<ExecutionResult>,
    /// Output of every completed step
    pub outputs: HashMap<StepId, Value>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub cancelled: bool,
    pub halted: Option<HaltReason>,
    pub deadline_exceeded: bool,
    /// Levels the plan was scheduled in
    pub execution_order: Vec<Vec<StepId>>,
    /// Resolver findings, plan validation warnings and steps that ran
    /// without their resource grant
    pub issues: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

/// Aggregate counters over every orchestration this instance ran
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OrchestrationMetrics {
    pub total_orchestrations: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub success_rate: f64,
    /// Cumulative moving averages over finished orchestrations
    pub average_duration_ms: f64,
    pub average_adaptations: f64,
    pub total_adaptations: u64,
    pub total_steps_completed: u64,
    pub total_steps_failed: u64,
    /// Usage over allocation of released resource grants
    pub resource_efficiency: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl OrchestrationMetrics {
    pub(crate) fn record(&mut self, result: &OrchestrationResult) {
        self.total_orchestrations += 1;
        if result.cancelled {
            self.cancelled += 1;
        } else if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.total_adaptations += result.adaptations_made as u64;
        self.total_steps_completed += result.steps_completed as u64;
        self.total_steps_failed += result.steps_failed as u64;

        let n = self.total_orchestrations as f64;
        self.success_rate = self.successful as f64 / n;
        self.average_duration_ms +=
            (result.duration.as_secs_f64() * 1000.0 - self.average_duration_ms) / n;
        self.average_adaptations += (result.adaptations_made as f64 - self.average_adaptations) / n;
        self.last_updated = Some(Utc::now());
    }

    /// An orchestration that ended with an error before producing a result
    /// A run cancelled before any step started
    pub(crate) fn record_cancelled(&mut self) {
        self.total_orchestrations += 1;
        self.cancelled += 1;
        self.success_rate = self.successful as f64 / self.total_orchestrations as f64;
        self.last_updated = Some(Utc::now());
    }

    pub(crate) fn record_error(&mut self) {
        self.total_orchestrations += 1;
        self.failed += 1;
        self.success_rate = self.successful as f64 / self.total_orchestrations as f64;
        self.last_updated = Some(Utc::now());
    }
}

/// Snapshot of a running orchestration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub description: String,
    pub plan_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}
