//! Step adapters: derive a modified step from a classified failure.

use crate::execution::ErrorCategory;
use crate::llm::{PlanningAssistant, extract_json_value};
use crate::plan::{AdaptationTrigger, Step};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Parameter keys that bound the size of a result
const RESULT_SIZE_KEYS: &[&str] = &[
    "max_results",
    "limit",
    "num_results",
    "top_k",
    "count",
    "max_items",
    "page_size",
];

const BATCH_KEYS: &[&str] = &["batch_size", "chunk_size"];

/// Everything an adapter may look at when re-issuing a step
#[derive(Debug, Clone)]
pub struct AdaptationRequest {
    pub task_id: String,
    /// The step as it was last attempted
    pub step: Step,
    pub category: ErrorCategory,
    pub error: String,
    /// 1-based number of the adaptation being requested
    pub attempt: u32,
    /// Backoff delay to use if the adapter decides to simply retry
    pub retry_delay: Duration,
    pub available_tools: Vec<String>,
}

/// A modified step ready for the next attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Adaptation {
    pub step: Step,
    pub trigger: AdaptationTrigger,
    pub reason: String,
    /// Wait this long before the next attempt
    pub delay: Option<Duration>,
}

/// Strategy for re-issuing failed steps. `None` means no strategy applies
/// and the step fails terminally.
#[async_trait]
pub trait StepAdapter: Send + Sync {
    async fn adapt(&self, request: AdaptationRequest) -> Option<Adaptation>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Substitutes tried in order for a failing tool
    pub alternative_tools: HashMap<String, Vec<String>>,
    /// Parameter renames applied when switching to the keyed tool
    pub parameter_renames: HashMap<String, HashMap<String, String>>,
    /// Read-only variant of a tool, used on permission errors
    pub read_only_variants: HashMap<String, String>,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        let alternative_tools = HashMap::from([
            (
                "web_search".to_string(),
                vec!["deep_research".to_string(), "browser".to_string()],
            ),
            ("deep_research".to_string(), vec!["web_search".to_string()]),
        ]);
        let parameter_renames = HashMap::from([
            (
                "deep_research".to_string(),
                HashMap::from([("query".to_string(), "research_query".to_string())]),
            ),
            (
                "web_search".to_string(),
                HashMap::from([("research_query".to_string(), "query".to_string())]),
            ),
        ]);
        let read_only_variants = HashMap::from([
            ("file_write".to_string(), "file_read".to_string()),
            ("file_edit".to_string(), "file_read".to_string()),
        ]);
        Self {
            alternative_tools,
            parameter_renames,
            read_only_variants,
        }
    }
}

impl AdaptationConfig {
    /// Switch `step` to `tool`, renaming parameters the new tool expects
    /// under another name
    pub fn switch_tool(&self, step: &mut Step, tool: &str) {
        if let Some(renames) = self.parameter_renames.get(tool) {
            for (from, to) in renames {
                if let Some(value) = step.parameters.remove(from) {
                    step.parameters.insert(to.clone(), value);
                }
            }
        }
        step.tool = tool.to_string();
    }

    /// First configured substitute for `tool` that is available
    pub fn alternative_for(&self, tool: &str, available: &[String]) -> Option<String> {
        self.alternative_tools
            .get(tool)?
            .iter()
            .find(|candidate| available.iter().any(|t| t == *candidate))
            .cloned()
    }
}

/// Deterministic recovery strategies keyed by error category
#[derive(Debug, Clone, Default)]
pub struct RuleBasedAdapter {
    config: AdaptationConfig,
}

fn halve_parameters(step: &mut Step, keys: &[&str]) -> Vec<String> {
    let mut changed = Vec::new();
    for key in keys {
        if let Some(value) = step.parameters.get_mut(*key)
            && let Some(current) = value.as_u64()
        {
            *value = Value::from((current / 2).max(1));
            changed.push((*key).to_string());
        }
    }
    changed
}

fn double_timeouts(step: &mut Step) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in step.parameters.iter_mut() {
        if !key.contains("timeout") {
            continue;
        }
        if let Some(current) = value.as_u64() {
            *value = Value::from(current.saturating_mul(2));
            changed.push(key.clone());
        } else if let Some(current) = value.as_f64() {
            *value = Value::from(current * 2.0);
            changed.push(key.clone());
        }
    }
    changed
}

impl RuleBasedAdapter {
    pub fn new(config: AdaptationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    fn slow_down(&self, request: &AdaptationRequest) -> Adaptation {
        let mut step = request.step.clone();
        step.estimated_duration = step.estimated_duration.saturating_mul(2);
        let mut changed = double_timeouts(&mut step);
        changed.extend(halve_parameters(&mut step, RESULT_SIZE_KEYS));
        step.can_parallelize = false;
        Adaptation {
            trigger: request.category.trigger(),
            reason: format!(
                "{}: doubled duration to {}ms, adjusted [{}], parallelism disabled",
                request.category,
                step.estimated_duration.as_millis(),
                changed.join(", ")
            ),
            step,
            delay: None,
        }
    }

    fn shrink(&self, request: &AdaptationRequest) -> Adaptation {
        let mut step = request.step.clone();
        let mut changed = halve_parameters(&mut step, BATCH_KEYS);
        changed.extend(halve_parameters(&mut step, RESULT_SIZE_KEYS));
        step.can_parallelize = false;
        Adaptation {
            trigger: AdaptationTrigger::ResourceConstraint,
            reason: format!(
                "resource constraint: halved [{}], parallelism disabled",
                changed.join(", ")
            ),
            step,
            delay: None,
        }
    }

    fn substitute(&self, request: &AdaptationRequest) -> Option<Adaptation> {
        let alternative = self
            .config
            .alternative_for(&request.step.tool, &request.available_tools)?;
        let mut step = request.step.clone();
        self.config.switch_tool(&mut step, &alternative);
        Some(Adaptation {
            trigger: request.category.trigger(),
            reason: format!(
                "{}: switched {} to {}",
                request.category, request.step.tool, alternative
            ),
            step,
            delay: None,
        })
    }

    fn read_only(&self, request: &AdaptationRequest) -> Option<Adaptation> {
        let mut step = request.step.clone();
        if let Some(variant) = self.config.read_only_variants.get(&step.tool)
            && request.available_tools.iter().any(|t| t == variant)
        {
            let from = step.tool.clone();
            self.config.switch_tool(&mut step, variant);
            step.parameters.insert("read_only".to_string(), Value::Bool(true));
            return Some(Adaptation {
                trigger: AdaptationTrigger::Error,
                reason: format!("permission error: downgraded {} to {}", from, variant),
                step,
                delay: None,
            });
        }

        if step.parameters.get("read_only").and_then(Value::as_bool) == Some(true) {
            return None;
        }
        step.parameters.insert("read_only".to_string(), Value::Bool(true));
        Some(Adaptation {
            trigger: AdaptationTrigger::Error,
            reason: "permission error: retrying read-only".to_string(),
            step,
            delay: None,
        })
    }
}

#[async_trait]
impl StepAdapter for RuleBasedAdapter {
    async fn adapt(&self, request: AdaptationRequest) -> Option<Adaptation> {
        let adaptation = match request.category {
            ErrorCategory::Timeout | ErrorCategory::PerformanceIssue => Some(self.slow_down(&request)),
            ErrorCategory::ResourceConstraint => Some(self.shrink(&request)),
            ErrorCategory::ToolError | ErrorCategory::UnexpectedResult => self.substitute(&request),
            ErrorCategory::NetworkError => Some(Adaptation {
                step: request.step.clone(),
                trigger: AdaptationTrigger::Error,
                reason: format!(
                    "network error: retrying after {}ms",
                    request.retry_delay.as_millis()
                ),
                delay: Some(request.retry_delay),
            }),
            ErrorCategory::PermissionError => self.read_only(&request),
            ErrorCategory::Unknown => None,
        };
        if adaptation.is_none() {
            debug!(
                task_id = %request.task_id,
                step_id = %request.step.id,
                category = %request.category,
                "No recovery strategy applies"
            );
        }
        adaptation
    }
}

#[derive(Debug, Deserialize)]
struct SuggestedStep {
    tool: String,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
}

/// Asks the planning assistant for replacement parameters; anything it
/// cannot use falls back to the rule-based strategies
pub struct AssistedStepAdapter {
    assistant: Arc<dyn PlanningAssistant>,
    fallback: RuleBasedAdapter,
}

impl AssistedStepAdapter {
    pub fn new(assistant: Arc<dyn PlanningAssistant>, fallback: RuleBasedAdapter) -> Self {
        Self {
            assistant,
            fallback,
        }
    }

    fn prompt(request: &AdaptationRequest) -> String {
        let step = serde_json::to_string(&request.step).unwrap_or_default();
        format!(
            "A step of an automated plan failed.\n\
             Step: {}\n\
             Error category: {}\n\
             Error: {}\n\
             Available tools: {}\n\
             Reply with JSON {{\"tool\": <tool>, \"parameters\": {{...}}}} for the next attempt.",
            step,
            request.category,
            request.error,
            request.available_tools.join(", ")
        )
    }
}

#[async_trait]
impl StepAdapter for AssistedStepAdapter {
    async fn adapt(&self, request: AdaptationRequest) -> Option<Adaptation> {
        // Plain retries need no advice
        if matches!(
            request.category,
            ErrorCategory::NetworkError | ErrorCategory::Unknown
        ) {
            return self.fallback.adapt(request).await;
        }

        let suggestion = match self.assistant.generate_plan(Self::prompt(&request)).await {
            Ok(text) => extract_json_value(&text)
                .and_then(|value| serde_json::from_value::<SuggestedStep>(value).ok()),
            Err(e) => {
                warn!(
                    task_id = %request.task_id,
                    assistant = self.assistant.name(),
                    "Assistant adaptation failed: {}",
                    e
                );
                None
            }
        };

        match suggestion {
            Some(suggested) if request.available_tools.contains(&suggested.tool) => {
                let mut step = request.step.clone();
                step.tool = suggested.tool;
                step.parameters = suggested.parameters;
                step.can_parallelize = false;
                Some(Adaptation {
                    trigger: request.category.trigger(),
                    reason: format!(
                        "{}: assistant {} suggested {}",
                        request.category,
                        self.assistant.name(),
                        step.tool
                    ),
                    step,
                    delay: None,
                })
            }
            _ => self.fallback.adapt(request).await,
        }
    }
}
