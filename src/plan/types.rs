use crate::error::OrchestraError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a step, unique within one plan
pub type StepId = String;

/// Externally supplied identifier of an orchestration request
pub type TaskId = String;

/// Opaque tool parameters; shape validation belongs to the tool backend
pub type ParameterMap = serde_json::Map<String, Value>;

/// Parameter keys that name a file path
const PATH_PARAMETER_KEYS: &[&str] = &["path", "file_path", "file", "filename", "target_path"];

/// Serialize `Duration` as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serialize `Option<Duration>` as optional whole milliseconds
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Lifecycle state of a single step
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet
    #[default]
    Pending,
    /// A tool call is in flight
    Running,
    /// A failed attempt is being turned into a modified step
    Adapting,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully, no further attempts
    Failed,
}

/// Coarse tool family, derived from the tool name
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Search,
    FileRead,
    FileWrite,
    Shell,
    Browser,
    Analysis,
    Report,
    Other,
}

impl ToolCategory {
    /// Derive the category from a tool name
    pub fn of(tool: &str) -> Self {
        let tool = tool.to_ascii_lowercase();
        if tool.contains("search") {
            ToolCategory::Search
        } else if tool.contains("write") || tool.contains("save") || tool.contains("edit") {
            ToolCategory::FileWrite
        } else if tool.contains("read") || tool.starts_with("file") || tool.contains("list_dir") {
            ToolCategory::FileRead
        } else if tool.contains("shell")
            || tool.contains("command")
            || tool.contains("exec")
            || tool.contains("terminal")
        {
            ToolCategory::Shell
        } else if tool.contains("browser") || tool.contains("navigate") || tool.contains("scrape")
        {
            ToolCategory::Browser
        } else if tool.contains("analy") || tool.contains("summar") || tool.contains("reason") {
            ToolCategory::Analysis
        } else if tool.contains("report") || tool.contains("notify") || tool.contains("final") {
            ToolCategory::Report
        } else {
            ToolCategory::Other
        }
    }

    /// Whether tools of this category only observe state
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ToolCategory::Search | ToolCategory::FileRead | ToolCategory::Analysis
        )
    }
}

/// A unit of work inside an execution plan
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub title: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: ParameterMap,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(rename = "estimated_duration_ms", with = "duration_ms")]
    pub estimated_duration: Duration,
    /// 0.0 (trivial) to 1.0 (hardest)
    pub complexity: f64,
    /// Higher is more critical
    pub priority: i32,
    pub can_parallelize: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub status: StepStatus,
    /// Explicit resource-conflict tags; steps sharing a tag never overlap
    #[serde(default)]
    pub resource_tags: Vec<String>,
    /// Names of data items this step consumes
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Names of data items this step produces
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Step {
    /// Create a pending step with default estimates
    pub fn new(id: impl Into<StepId>, tool: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            tool: tool.into(),
            parameters: ParameterMap::new(),
            dependencies: Vec::new(),
            estimated_duration: Duration::from_secs(30),
            complexity: 0.5,
            priority: 5,
            can_parallelize: false,
            retry_count: 0,
            max_retries: 3,
            status: StepStatus::Pending,
            resource_tags: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterMap) -> Self {
        self.parameters = parameters;
        self
    }

    /// Add a dependency, ignoring duplicates
    pub fn depends_on(mut self, step_id: impl Into<StepId>) -> Self {
        let step_id = step_id.into();
        if !self.dependencies.contains(&step_id) {
            self.dependencies.push(step_id);
        }
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        for dependency in dependencies {
            self = self.depends_on(dependency);
        }
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    /// Set complexity, clamped to 0.0..=1.0
    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity.clamp(0.0, 1.0);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn parallelizable(mut self, can_parallelize: bool) -> Self {
        self.can_parallelize = can_parallelize;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_resource_tag(mut self, tag: impl Into<String>) -> Self {
        self.resource_tags.push(tag.into());
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Tool family of this step
    pub fn category(&self) -> ToolCategory {
        ToolCategory::of(&self.tool)
    }

    /// File path named by the parameters, if any
    pub fn path_parameter(&self) -> Option<&str> {
        PATH_PARAMETER_KEYS
            .iter()
            .find_map(|key| self.parameters.get(*key).and_then(Value::as_str))
            .filter(|path| !path.is_empty())
    }

    /// Explicit tags plus a `path:` tag for the file this step touches
    pub fn effective_resource_tags(&self) -> HashSet<String> {
        let mut tags: HashSet<String> = self.resource_tags.iter().cloned().collect();
        if let Some(path) = self.path_parameter() {
            tags.insert(format!("path:{}", path));
        }
        tags
    }

    /// Whether any string parameter mentions `needle`
    pub fn references(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return false;
        }
        self.parameters.values().any(|value| value_mentions(value, needle))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Failed)
    }

    /// Effective adaptation bound for this step
    pub fn attempt_limit(&self, engine_limit: u32) -> u32 {
        engine_limit.min(self.max_retries)
    }
}

fn value_mentions(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.contains(needle),
        Value::Array(items) => items.iter().any(|item| value_mentions(item, needle)),
        Value::Object(map) => map.values().any(|item| value_mentions(item, needle)),
        _ => false,
    }
}

/// How a plan is meant to be executed
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
    Hierarchical,
    Adaptive,
    GoalOriented,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Hierarchical => "hierarchical",
            ExecutionStrategy::Adaptive => "adaptive",
            ExecutionStrategy::GoalOriented => "goal-oriented",
        };
        f.write_str(name)
    }
}

/// Hierarchy position of one step
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StepHierarchy {
    /// 0 for roots, otherwise 1 + max level of dependencies
    pub level: u32,
    pub parents: Vec<StepId>,
    pub children: Vec<StepId>,
    /// Blend of fan-out, complexity and duration share, 0.0..=1.0
    pub criticality: f64,
}

/// Plan-wide hierarchy metadata
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PlanHierarchy {
    pub nodes: BTreeMap<StepId, StepHierarchy>,
    pub critical_path: Vec<StepId>,
    pub parallel_branches: Vec<Vec<StepId>>,
    pub max_depth: u32,
}

/// Where the plan's steps came from
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionSource {
    #[default]
    Template,
    Assisted,
    Fallback,
}

/// Descriptive plan metadata
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    pub task_type: Option<String>,
    pub complexity_level: Option<String>,
    pub source: DecompositionSource,
    /// Set when decomposition failed and the minimal plan was used
    pub fallback: bool,
    pub validation_warnings: Vec<String>,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            task_type: None,
            complexity_level: None,
            source: DecompositionSource::default(),
            fallback: false,
            validation_warnings: Vec::new(),
        }
    }
}

/// An ordered, scored set of steps.
///
/// `steps` is private so that the derived scores can never drift from the step
/// set: every mutator recomputes them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    pub id: String,
    pub title: String,
    pub description: String,
    steps: Vec<Step>,
    #[serde(rename = "total_estimated_duration_ms", with = "duration_ms")]
    total_estimated_duration: Duration,
    complexity_score: f64,
    success_probability: f64,
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub hierarchy: PlanHierarchy,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

impl ExecutionPlan {
    /// Create a plan and compute its derived scores
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        strategy: ExecutionStrategy,
        steps: Vec<Step>,
    ) -> Self {
        let mut plan = Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            steps,
            total_estimated_duration: Duration::ZERO,
            complexity_score: 0.0,
            success_probability: 1.0,
            strategy,
            hierarchy: PlanHierarchy::default(),
            metadata: PlanMetadata::default(),
        };
        plan.recompute_metrics();
        plan
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|step| step.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_estimated_duration(&self) -> Duration {
        self.total_estimated_duration
    }

    pub fn complexity_score(&self) -> f64 {
        self.complexity_score
    }

    pub fn success_probability(&self) -> f64 {
        self.success_probability
    }

    /// Replace the whole step set
    pub fn replace_steps(&mut self, steps: Vec<Step>) {
        self.steps = steps;
        self.recompute_metrics();
    }

    pub fn push_step(&mut self, step: Step) {
        self.steps.push(step);
        self.recompute_metrics();
    }

    /// Mutate one step in place; returns false when the id is unknown
    pub fn update_step<F>(&mut self, step_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut Step),
    {
        let Some(step) = self.steps.iter_mut().find(|step| step.id == step_id) else {
            return false;
        };
        update(step);
        self.recompute_metrics();
        true
    }

    pub fn remove_step(&mut self, step_id: &str) -> Option<Step> {
        let index = self.steps.iter().position(|step| step.id == step_id)?;
        let removed = self.steps.remove(index);
        self.recompute_metrics();
        Some(removed)
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    fn recompute_metrics(&mut self) {
        self.total_estimated_duration = self
            .steps
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.estimated_duration));
        self.complexity_score = complexity_score(&self.steps);
        self.success_probability = success_probability(&self.steps);
    }
}

/// Plan complexity in 0.0..=1.0 from mean step complexity, size and
/// dependency density
pub fn complexity_score(steps: &[Step]) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let n = steps.len() as f64;
    let mean = steps.iter().map(|s| s.complexity).sum::<f64>() / n;
    let size_factor = (n / 20.0).min(1.0);
    let edges = steps.iter().map(|s| s.dependencies.len()).sum::<usize>() as f64;
    let density = if steps.len() > 1 {
        (edges / (n * (n - 1.0) / 2.0)).min(1.0)
    } else {
        0.0
    };
    (0.6 * mean + 0.2 * size_factor + 0.2 * density).clamp(0.0, 1.0)
}

/// Probability that every step eventually succeeds, counting retries
pub fn success_probability(steps: &[Step]) -> f64 {
    if steps.is_empty() {
        return 1.0;
    }
    let probability: f64 = steps
        .iter()
        .map(|step| {
            let failure_per_attempt = 0.2 * step.complexity.clamp(0.0, 1.0);
            1.0 - failure_per_attempt.powi(step.max_retries as i32 + 1)
        })
        .product();
    probability.clamp(0.01, 0.99)
}

/// Terminal state of an attempted step
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Why a step was re-issued
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AdaptationTrigger {
    Error,
    Timeout,
    ResourceConstraint,
    UnexpectedResult,
    PerformanceIssue,
    ContextChange,
}

impl fmt::Display for AdaptationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdaptationTrigger::Error => "error",
            AdaptationTrigger::Timeout => "timeout",
            AdaptationTrigger::ResourceConstraint => "resource-constraint",
            AdaptationTrigger::UnexpectedResult => "unexpected-result",
            AdaptationTrigger::PerformanceIssue => "performance-issue",
            AdaptationTrigger::ContextChange => "context-change",
        };
        f.write_str(name)
    }
}

/// Record of one re-issue of a failed step
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AdaptationEvent {
    pub id: Uuid,
    pub step_id: StepId,
    pub trigger: AdaptationTrigger,
    pub original_step: Step,
    pub adapted_step: Step,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// 1-based adaptation number for this step
    pub attempt: u32,
    /// Whether the adapted attempt ultimately succeeded
    pub succeeded: bool,
}

impl AdaptationEvent {
    pub fn new(
        trigger: AdaptationTrigger,
        original_step: Step,
        adapted_step: Step,
        reason: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: original_step.id.clone(),
            trigger,
            original_step,
            adapted_step,
            reason: reason.into(),
            timestamp: Utc::now(),
            attempt,
            succeeded: false,
        }
    }
}

/// Outcome of one attempted step
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub step_id: StepId,
    pub status: ResultStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(rename = "execution_time_ms", with = "duration_ms")]
    pub execution_time: Duration,
    /// Number of tool calls made, adaptations included
    pub attempts: u32,
    pub adaptations: Vec<AdaptationEvent>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn completed(step_id: impl Into<StepId>, result: Value, execution_time: Duration) -> Self {
        Self::terminal(step_id, ResultStatus::Completed, Some(result), None, execution_time)
    }

    pub fn failed(
        step_id: impl Into<StepId>,
        error: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self::terminal(step_id, ResultStatus::Failed, None, Some(error.into()), execution_time)
    }

    pub fn cancelled(step_id: impl Into<StepId>, reason: impl Into<String>) -> Self {
        Self::terminal(
            step_id,
            ResultStatus::Cancelled,
            None,
            Some(reason.into()),
            Duration::ZERO,
        )
    }

    fn terminal(
        step_id: impl Into<StepId>,
        status: ResultStatus,
        result: Option<Value>,
        error: Option<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            result,
            error,
            execution_time,
            attempts: 1,
            adaptations: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    pub fn with_adaptations(mut self, adaptations: Vec<AdaptationEvent>) -> Self {
        self.attempts = adaptations.len() as u32 + 1;
        self.adaptations = adaptations;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Completed
    }
}

/// Externally supplied orchestration request. Immutable once orchestration
/// starts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrchestrationContext {
    pub task_id: TaskId,
    pub user_id: String,
    pub session_id: String,
    pub task_description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, rename = "timeout_ms", with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    #[serde(default)]
    pub preferences: HashMap<String, Value>,
}

impl OrchestrationContext {
    pub fn new(
        task_id: impl Into<TaskId>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        task_description: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            task_description: task_description.into(),
            priority: 5,
            timeout: None,
            constraints: HashMap::new(),
            preferences: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    pub fn with_preference(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.preferences.insert(key.into(), value.into());
        self
    }

    /// Tool names allowed by the `allowed_tools` constraint, if present
    pub fn allowed_tools(&self) -> Option<Vec<String>> {
        self.constraints
            .get("allowed_tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
    }

    /// Reject requests with empty identifiers or description
    pub fn validate(&self) -> Result<(), OrchestraError> {
        let required = [
            ("task_id", &self.task_id),
            ("user_id", &self.user_id),
            ("session_id", &self.session_id),
            ("task_description", &self.task_description),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OrchestraError::Validation(format!("{} must not be empty", field)));
            }
        }
        if matches!(self.timeout, Some(timeout) if timeout.is_zero()) {
            return Err(OrchestraError::Validation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
