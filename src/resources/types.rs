use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Identifier of a granted allocation (equal to the request ticket)
pub type AllocationId = u64;

/// Allocation owner key of a step, scoped by task so equal step ids in
/// concurrent plans never collide
pub fn step_key(task_id: &str, step_id: &str) -> String {
    format!("{}/{}", task_id, step_id)
}

/// Shared capacity kinds, measured in abstract units
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Disk,
        ResourceType::Network,
    ];
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Disk => "disk",
            ResourceType::Network => "network",
        };
        f.write_str(name)
    }
}

/// Resource manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Capacity per type; a non-positive value leaves the type unconfigured
    pub cpu_max: f64,
    pub memory_max: f64,
    pub disk_max: f64,
    pub network_max: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    /// Allocations with a priority below this may be shrunk under pressure
    pub low_priority_threshold: i32,
    pub monitor_interval_ms: u64,
    /// Bounded length of the usage history
    pub history_size: usize,
    /// Usage below this share of the allocation counts as low
    pub low_usage_ratio: f64,
    /// Consecutive low readings before an allocation is shrunk
    pub low_usage_samples: u32,
    pub default_request_timeout_ms: u64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            cpu_max: 100.0,
            memory_max: 100.0,
            disk_max: 100.0,
            network_max: 100.0,
            warning_threshold: 0.8,
            critical_threshold: 0.9,
            low_priority_threshold: 5,
            monitor_interval_ms: 5_000,
            history_size: 120,
            low_usage_ratio: 0.5,
            low_usage_samples: 3,
            default_request_timeout_ms: 30_000,
        }
    }
}

impl ResourceManagerConfig {
    /// Configured capacity of `resource_type`, if any
    pub fn max_for(&self, resource_type: ResourceType) -> Option<f64> {
        let max = match resource_type {
            ResourceType::Cpu => self.cpu_max,
            ResourceType::Memory => self.memory_max,
            ResourceType::Disk => self.disk_max,
            ResourceType::Network => self.network_max,
        };
        (max > 0.0).then_some(max)
    }

    pub fn with_limit(mut self, resource_type: ResourceType, max: f64) -> Self {
        match resource_type {
            ResourceType::Cpu => self.cpu_max = max,
            ResourceType::Memory => self.memory_max = max,
            ResourceType::Disk => self.disk_max = max,
            ResourceType::Network => self.network_max = max,
        }
        self
    }

    pub fn configured_types(&self) -> Vec<ResourceType> {
        ResourceType::ALL
            .into_iter()
            .filter(|rt| self.max_for(*rt).is_some())
            .collect()
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

/// A request for capacity on behalf of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Owner key, usually `<task_id>/<step_id>`
    pub step_key: String,
    pub resource_type: ResourceType,
    pub amount: f64,
    pub priority: i32,
    #[serde(rename = "timeout_ms", with = "crate::plan::types::duration_ms")]
    pub timeout: Duration,
    /// After this the allocation counts as expired
    #[serde(rename = "expected_duration_ms", with = "crate::plan::types::duration_ms")]
    pub expected_duration: Duration,
}

impl ResourceRequest {
    pub fn new(step_key: impl Into<String>, resource_type: ResourceType, amount: f64) -> Self {
        Self {
            step_key: step_key.into(),
            resource_type,
            amount,
            priority: 5,
            timeout: Duration::from_secs(30),
            expected_duration: Duration::from_secs(300),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expected_duration(mut self, expected_duration: Duration) -> Self {
        self.expected_duration = expected_duration;
        self
    }
}

/// Granted capacity
#[derive(Debug, Clone)]
pub struct ResourceAllocation {
    pub id: AllocationId,
    pub step_key: String,
    pub resource_type: ResourceType,
    pub allocated_amount: f64,
    pub requested_amount: f64,
    pub priority: i32,
    pub start_time: Instant,
    pub granted_at: DateTime<Utc>,
    pub expected_duration: Duration,
    pub actual_usage: f64,
    pub peak_usage: f64,
    pub usage_samples: u32,
    /// Consecutive readings below the low-usage ratio
    pub low_usage_streak: u32,
}

impl ResourceAllocation {
    pub(crate) fn grant(id: AllocationId, request: &ResourceRequest) -> Self {
        Self {
            id,
            step_key: request.step_key.clone(),
            resource_type: request.resource_type,
            allocated_amount: request.amount,
            requested_amount: request.amount,
            priority: request.priority,
            start_time: Instant::now(),
            granted_at: Utc::now(),
            expected_duration: request.expected_duration,
            actual_usage: 0.0,
            peak_usage: 0.0,
            usage_samples: 0,
            low_usage_streak: 0,
        }
    }

    /// An expected duration past the clock's range never expires
    pub fn is_expired(&self, now: Instant) -> bool {
        self.start_time
            .checked_add(self.expected_duration)
            .is_some_and(|expires_at| now >= expires_at)
    }

    /// Amount the allocation may not be shrunk below
    pub fn usage_floor(&self) -> f64 {
        self.actual_usage.max(self.peak_usage)
    }
}

/// Result of a non-blocking request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    Granted(AllocationId),
    /// Waiting in the FIFO queue; `position` is 0-based
    Queued { ticket: AllocationId, position: usize },
}

impl AllocationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AllocationOutcome::Granted(_))
    }
}

/// Resource manager failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceError {
    #[error("Resource request for {step_key} ({resource_type}) timed out after {waited_ms}ms")]
    Timeout {
        step_key: String,
        resource_type: ResourceType,
        waited_ms: u64,
    },
    #[error("Requested {requested} {resource_type} units exceeds capacity {max}")]
    ExceedsCapacity {
        resource_type: ResourceType,
        requested: f64,
        max: f64,
    },
    #[error("Resource type {0} is not configured")]
    UnknownResource(ResourceType),
    #[error("Invalid resource amount {0}")]
    InvalidAmount(f64),
    #[error("Queued request for {0} was withdrawn")]
    Withdrawn(String),
}

/// Alert severity
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Published by the monitor when utilization crosses a threshold
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceAlert {
    pub resource_type: ResourceType,
    pub level: AlertLevel,
    pub utilization: f64,
    pub timestamp: DateTime<Utc>,
}

/// One monitor reading, utilization as 0.0..=1.0 per type
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UsageSample {
    pub timestamp: DateTime<Utc>,
    pub utilization: HashMap<ResourceType, f64>,
}

/// Per-type utilization snapshot
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceStatus {
    pub resource_type: ResourceType,
    pub max_value: f64,
    pub allocated: f64,
    pub utilization: f64,
    /// Latest system-wide reading, when a sampler provides one
    pub sampled_utilization: Option<f64>,
    pub active_allocations: usize,
    pub queued_requests: usize,
}

/// Manager counters
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResourceMetrics {
    pub granted: u64,
    pub queued: u64,
    pub denied: u64,
    pub released: u64,
    pub timeout_allocation: u64,
    /// Queued requests expired by maintenance
    pub timeout_request: u64,
    pub shrunk: u64,
    pub optimized: u64,
    pub abandoned: u64,
    pub peak_queue_length: usize,
    /// Sum of allocated amounts of released allocations that reported usage
    pub released_allocated_total: f64,
    /// Sum of peak usage of the same allocations
    pub released_usage_total: f64,
}

impl ResourceMetrics {
    /// Usage divided by allocation over released allocations
    pub fn resource_efficiency(&self) -> Option<f64> {
        (self.released_allocated_total > 0.0)
            .then(|| (self.released_usage_total / self.released_allocated_total).min(1.0))
    }
}

/// Work done by one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    /// Queued requests dropped after waiting past their own timeout
    pub expired_requests: usize,
    pub optimized: usize,
    pub granted_from_queue: usize,
}
