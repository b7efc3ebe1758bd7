//! Task decomposition into steps.

use super::types::{TaskClassification, TaskType};
use crate::llm::{
    AssistantError, PlanDocument, PlanDocumentError, PlanningAssistant, parse_plan_document,
};
use crate::plan::{DecompositionSource, ExecutionStrategy, Step, ToolCategory};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Input to a decomposer
#[derive(Debug, Clone)]
pub struct DecompositionRequest {
    pub description: String,
    pub classification: TaskClassification,
    pub strategy: ExecutionStrategy,
    pub available_tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecompositionError {
    #[error("No steps produced for task")]
    Empty,
    #[error(transparent)]
    Assistant(#[from] AssistantError),
    #[error(transparent)]
    Document(#[from] PlanDocumentError),
}

/// Turns a task into an unscheduled list of steps
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(
        &self,
        request: &DecompositionRequest,
    ) -> Result<(Vec<Step>, DecompositionSource), DecompositionError>;
}

/// Base estimate of one call per tool family
pub fn base_duration(category: ToolCategory) -> Duration {
    let secs = match category {
        ToolCategory::Search => 20,
        ToolCategory::FileRead => 5,
        ToolCategory::FileWrite => 10,
        ToolCategory::Shell => 60,
        ToolCategory::Browser => 30,
        ToolCategory::Analysis => 30,
        ToolCategory::Report => 15,
        ToolCategory::Other => 30,
    };
    Duration::from_secs(secs)
}

fn template_step(id: &str, title: &str, tool: &str, complexity: f64) -> Step {
    Step::new(id, tool)
        .with_title(title)
        .with_duration(base_duration(ToolCategory::of(tool)))
        .with_complexity(complexity)
}

const SOURCE_TOOLS: &[&str] = &["web_search", "browser", "file_read"];

/// Fixed step skeletons per task type, shaped by the strategy
#[derive(Debug, Clone, Default)]
pub struct TemplateDecomposer;

impl TemplateDecomposer {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, request: &DecompositionRequest) -> Vec<Step> {
        let complexity = request.classification.complexity.step_complexity();
        let description = request.description.as_str();
        let mut steps = match request.classification.task_type {
            TaskType::Research => self.research(request, complexity),
            TaskType::Analysis => vec![
                template_step("collect", "Collect input data", "file_read", complexity)
                    .with_parameter("path", "data")
                    .with_outputs(["dataset"]),
                template_step("analyze", "Analyze data", "analysis", complexity)
                    .with_parameter("objective", description)
                    .depends_on("collect")
                    .with_inputs(["dataset"])
                    .with_outputs(["findings"]),
                template_step("report", "Report findings", "report", complexity)
                    .depends_on("analyze")
                    .with_inputs(["findings"]),
            ],
            TaskType::Development => vec![
                template_step("inspect", "Inspect existing code", "file_read", complexity)
                    .with_parameter("path", "src"),
                template_step("design", "Design the change", "analysis", complexity)
                    .with_parameter("objective", description)
                    .depends_on("inspect"),
                template_step("implement", "Implement the change", "file_write", complexity)
                    .with_parameter("path", "src/changes.patch")
                    .with_parameter("content", description)
                    .depends_on("design"),
                template_step("verify", "Run verification", "shell", complexity)
                    .with_parameter("command", "make check")
                    .depends_on("implement"),
                template_step("report", "Summarize the change", "report", complexity)
                    .depends_on("verify"),
            ],
            TaskType::Automation => vec![
                template_step("plan_workflow", "Plan the workflow", "analysis", complexity)
                    .with_parameter("objective", description),
                template_step("write_script", "Write the automation script", "file_write", complexity)
                    .with_parameter("path", "automation/run.sh")
                    .with_parameter("content", description)
                    .depends_on("plan_workflow"),
                template_step("run_workflow", "Run the workflow", "shell", complexity)
                    .with_parameter("command", "sh automation/run.sh")
                    .depends_on("write_script"),
                template_step("report", "Report workflow results", "report", complexity)
                    .depends_on("run_workflow"),
            ],
            TaskType::General => vec![
                template_step("gather", "Gather context", "web_search", complexity)
                    .with_parameter("query", description),
                template_step("execute", "Work on the task", "analysis", complexity)
                    .with_parameter("objective", description)
                    .depends_on("gather"),
                template_step("report", "Report the outcome", "report", complexity)
                    .depends_on("execute"),
            ],
        };

        match request.strategy {
            ExecutionStrategy::Hierarchical => {
                // plan up front, review before reporting
                let roots: Vec<String> = steps
                    .iter()
                    .filter(|s| s.dependencies.is_empty())
                    .map(|s| s.id.clone())
                    .collect();
                for step in steps.iter_mut().filter(|s| roots.contains(&s.id)) {
                    step.dependencies.push("outline".to_string());
                }
                steps.insert(
                    0,
                    template_step("outline", "Break the task down", "analysis", complexity)
                        .with_parameter("objective", description)
                        .with_priority(8),
                );
                if let Some(report) = steps.iter().position(|s| s.id == "report") {
                    let previous = steps[report].dependencies.clone();
                    steps[report].dependencies = vec!["review".to_string()];
                    steps.insert(
                        report,
                        template_step("review", "Review intermediate results", "analysis", complexity)
                            .with_dependencies(previous),
                    );
                }
            }
            ExecutionStrategy::Adaptive => {
                for step in &mut steps {
                    step.max_retries = step.max_retries.max(5);
                }
            }
            ExecutionStrategy::Sequential => {
                for step in &mut steps {
                    step.can_parallelize = false;
                }
            }
            ExecutionStrategy::Parallel | ExecutionStrategy::GoalOriented => {}
        }
        steps
    }

    fn research(&self, request: &DecompositionRequest, complexity: f64) -> Vec<Step> {
        let description = request.description.as_str();
        let source_count = if request.strategy == ExecutionStrategy::Parallel {
            request
                .classification
                .independent_sources
                .clamp(2, SOURCE_TOOLS.len())
        } else {
            1
        };

        let mut steps = Vec::new();
        let mut source_ids = Vec::new();
        for (i, tool) in SOURCE_TOOLS.iter().take(source_count).enumerate() {
            let id = format!("source_{}", i + 1);
            let mut step = template_step(&id, &format!("Collect from source {}", i + 1), tool, complexity)
                .parallelizable(source_count > 1)
                .with_outputs([format!("{}_notes", id)]);
            step = match ToolCategory::of(tool) {
                ToolCategory::Search => step.with_parameter("query", description),
                ToolCategory::Browser => step.with_parameter("url", "https://duckduckgo.com/"),
                _ => step.with_parameter("path", "notes"),
            };
            source_ids.push(id);
            steps.push(step);
        }

        let inputs: Vec<String> = source_ids.iter().map(|id| format!("{}_notes", id)).collect();
        steps.push(
            template_step("synthesize", "Synthesize findings", "analysis", complexity)
                .with_parameter("objective", description)
                .with_dependencies(source_ids)
                .with_inputs(inputs)
                .with_outputs(["synthesis"]),
        );
        steps.push(
            template_step("report", "Write the research report", "report", complexity)
                .depends_on("synthesize")
                .with_inputs(["synthesis"]),
        );
        steps
    }
}

#[async_trait]
impl Decomposer for TemplateDecomposer {
    async fn decompose(
        &self,
        request: &DecompositionRequest,
    ) -> Result<(Vec<Step>, DecompositionSource), DecompositionError> {
        let steps = self.build(request);
        if steps.is_empty() {
            return Err(DecompositionError::Empty);
        }
        Ok((steps, DecompositionSource::Template))
    }
}

/// Minimal init, execute, finalize plan used when decomposition fails
pub fn fallback_steps(description: &str, available_tools: &[String]) -> Vec<Step> {
    let pick = |preferred: &[&str], default: &str| -> String {
        preferred
            .iter()
            .find(|tool| available_tools.iter().any(|t| t == *tool))
            .map(|tool| (*tool).to_string())
            .or_else(|| available_tools.first().cloned())
            .unwrap_or_else(|| default.to_string())
    };
    let init_tool = pick(&["analysis", "file_read"], "analysis");
    let execute_tool = pick(&["analysis", "shell", "web_search"], "analysis");
    let finalize_tool = pick(&["report", "analysis"], "report");

    vec![
        template_step("init", "Initialize", &init_tool, 0.3)
            .with_parameter("objective", description),
        template_step("execute", "Execute the task", &execute_tool, 0.5)
            .with_parameter("objective", description)
            .depends_on("init"),
        template_step("finalize", "Finalize", &finalize_tool, 0.3).depends_on("execute"),
    ]
}

/// Pick an available tool for a capability: exact name first, then the same
/// tool family
pub fn tool_for_capability(capability: &str, available_tools: &[String]) -> Option<String> {
    let capability = capability.trim().to_lowercase();
    if let Some(tool) = available_tools.iter().find(|t| t.to_lowercase() == capability) {
        return Some(tool.clone());
    }
    let category = ToolCategory::of(&capability);
    if category == ToolCategory::Other {
        return None;
    }
    available_tools
        .iter()
        .find(|t| ToolCategory::of(t) == category)
        .cloned()
}

/// Asks a planning assistant to draft phases and maps them onto steps.
/// Any failure falls back to the templates.
pub struct AssistedDecomposer {
    assistant: Arc<dyn PlanningAssistant>,
    templates: TemplateDecomposer,
}

impl AssistedDecomposer {
    pub fn new(assistant: Arc<dyn PlanningAssistant>) -> Self {
        Self {
            assistant,
            templates: TemplateDecomposer::new(),
        }
    }

    fn prompt(request: &DecompositionRequest) -> String {
        format!(
            "Draft an execution plan for the task below.\n\
             Task: {}\n\
             Task type: {}, complexity: {}, strategy: {}\n\
             Available tools: {}\n\
             Reply with JSON: {{\"goal\": string, \"phases\": [{{\"id\": string, \"title\": string, \
             \"description\": string, \"required_capabilities\": [string], \"depends_on\": [string], \
             \"estimated_minutes\": number, \"complexity\": number}}]}}",
            request.description,
            request.classification.task_type,
            request.classification.complexity,
            request.strategy,
            request.available_tools.join(", ")
        )
    }

    fn steps_from_document(document: &PlanDocument, request: &DecompositionRequest) -> Vec<Step> {
        let default_complexity = request.classification.complexity.step_complexity();
        document
            .phases
            .iter()
            .map(|phase| {
                let tool = phase
                    .required_capabilities
                    .iter()
                    .find_map(|c| tool_for_capability(c, &request.available_tools))
                    .or_else(|| tool_for_capability("analysis", &request.available_tools))
                    .unwrap_or_else(|| "analysis".to_string());
                let duration = phase
                    .estimated_minutes
                    .filter(|m| m.is_finite() && *m > 0.0)
                    .map(|m| Duration::from_secs_f64(m * 60.0))
                    .unwrap_or_else(|| base_duration(ToolCategory::of(&tool)));
                let gathering = matches!(
                    ToolCategory::of(&tool),
                    ToolCategory::Search | ToolCategory::Browser | ToolCategory::FileRead
                );
                Step::new(phase.id.clone(), tool)
                    .with_title(phase.title.clone())
                    .with_parameter("objective", phase.description.clone())
                    .with_dependencies(phase.depends_on.iter().cloned())
                    .with_duration(duration)
                    .with_complexity(phase.complexity.unwrap_or(default_complexity))
                    .parallelizable(gathering && request.strategy == ExecutionStrategy::Parallel)
            })
            .collect()
    }

    async fn draft(&self, request: &DecompositionRequest) -> Result<Vec<Step>, DecompositionError> {
        let response = self.assistant.generate_plan(Self::prompt(request)).await?;
        let document = parse_plan_document(&response)?;
        let steps = Self::steps_from_document(&document, request);
        if steps.is_empty() {
            return Err(DecompositionError::Empty);
        }
        debug!(
            assistant = self.assistant.name(),
            goal = %document.goal,
            steps = steps.len(),
            "Assistant drafted plan"
        );
        Ok(steps)
    }
}

#[async_trait]
impl Decomposer for AssistedDecomposer {
    async fn decompose(
        &self,
        request: &DecompositionRequest,
    ) -> Result<(Vec<Step>, DecompositionSource), DecompositionError> {
        match self.draft(request).await {
            Ok(steps) => Ok((steps, DecompositionSource::Assisted)),
            Err(e) => {
                warn!(
                    assistant = self.assistant.name(),
                    "Assisted decomposition failed, using templates: {}",
                    e
                );
                self.templates.decompose(request).await
            }
        }
    }
}
