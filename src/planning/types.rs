use super::adaptation::AdaptationConfig;
use crate::plan::ExecutionStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Broad family of a task, derived from its description
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Research,
    Analysis,
    Development,
    Automation,
    General,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Research => "research",
            TaskType::Analysis => "analysis",
            TaskType::Development => "development",
            TaskType::Automation => "automation",
            TaskType::General => "general",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

impl ComplexityLevel {
    /// Step complexity used by templates at this level
    pub fn step_complexity(&self) -> f64 {
        match self {
            ComplexityLevel::Low => 0.3,
            ComplexityLevel::Medium => 0.5,
            ComplexityLevel::High => 0.8,
        }
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComplexityLevel::Low => "low",
            ComplexityLevel::Medium => "medium",
            ComplexityLevel::High => "high",
        };
        f.write_str(name)
    }
}

/// Output of the task classifier
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskClassification {
    pub task_type: TaskType,
    pub complexity: ComplexityLevel,
    /// Distinct information source families mentioned
    pub independent_sources: usize,
    pub matched_keywords: Vec<String>,
}

impl TaskClassification {
    /// Strategy for this kind of task; the first matching rule wins
    pub fn strategy(&self) -> ExecutionStrategy {
        if self.independent_sources >= 2 {
            ExecutionStrategy::Parallel
        } else if self.complexity == ComplexityLevel::High {
            ExecutionStrategy::Hierarchical
        } else if matches!(self.task_type, TaskType::Automation | TaskType::Analysis) {
            ExecutionStrategy::Adaptive
        } else if self.complexity == ComplexityLevel::Low {
            ExecutionStrategy::Sequential
        } else {
            ExecutionStrategy::GoalOriented
        }
    }
}

/// Planning engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    /// Number of steps reported on the critical path
    pub critical_path_size: usize,
    /// A tool used by more than this share of steps gets rebalanced
    pub tool_dominance_ratio: f64,
    /// Scale step durations by `0.5 + complexity`
    pub rescale_durations: bool,
    pub adaptation: AdaptationConfig,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: 3600,
            critical_path_size: 3,
            tool_dominance_ratio: 0.6,
            rescale_durations: true,
            adaptation: AdaptationConfig::default(),
        }
    }
}

impl PlanningConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
