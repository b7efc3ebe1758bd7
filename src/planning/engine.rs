use super::cache::PlanCache;
use super::classifier::TaskClassifier;
use super::decomposer::{
    Decomposer, DecompositionRequest, TemplateDecomposer, fallback_steps, tool_for_capability,
};
use super::types::{PlanningConfig, TaskClassification};
use crate::error::OrchestraError;
use crate::plan::{
    DecompositionSource, DependencyResolver, ExecutionPlan, OrchestrationContext, PlanHierarchy,
    PlanMetadata, Step, StepHierarchy, StepId, ToolCategory,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TITLE_LIMIT: usize = 60;

/// Classifies, decomposes, validates and optimizes tasks into plans, and
/// caches the result per (description, tool set).
pub struct HierarchicalPlanningEngine {
    config: PlanningConfig,
    classifier: TaskClassifier,
    decomposer: Arc<dyn Decomposer>,
    resolver: DependencyResolver,
    cache: PlanCache,
}

impl HierarchicalPlanningEngine {
    /// Engine that decomposes with the fixed templates
    pub fn new(config: PlanningConfig) -> Self {
        let cache = PlanCache::new(config.cache_ttl());
        Self {
            config,
            classifier: TaskClassifier::new(),
            decomposer: Arc::new(TemplateDecomposer::new()),
            resolver: DependencyResolver::default(),
            cache,
        }
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }

    pub fn with_resolver(mut self, resolver: DependencyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &PlanningConfig {
        &self.config
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn classify(&self, description: &str) -> TaskClassification {
        self.classifier.classify(description)
    }

    /// Build (or fetch from cache) the plan for `description`.
    ///
    /// Decomposition failures never surface: the minimal fallback plan is
    /// used instead and flagged in the metadata. Only an empty description
    /// is an error.
    pub async fn create_plan(
        &self,
        description: &str,
        context: &OrchestrationContext,
        available_tools: &[String],
    ) -> Result<Arc<ExecutionPlan>, OrchestraError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(OrchestraError::Validation(
                "task description must not be empty".to_string(),
            ));
        }
        let tools = effective_tools(context, available_tools);
        let key = PlanCache::key(description, &tools);
        if self.config.cache_enabled
            && let Some(plan) = self.cache.get(&key)
        {
            debug!(task_id = %context.task_id, plan_id = %plan.id, "Plan cache hit");
            return Ok(plan);
        }

        let classification = self.classifier.classify(description);
        let strategy = classification.strategy();
        info!(
            task_id = %context.task_id,
            task_type = %classification.task_type,
            complexity = %classification.complexity,
            sources = classification.independent_sources,
            strategy = %strategy,
            "Classified task"
        );

        let request = DecompositionRequest {
            description: description.to_string(),
            classification: classification.clone(),
            strategy,
            available_tools: tools.clone(),
        };
        let mut warnings = Vec::new();
        let (steps, mut source) = match self.decomposer.decompose(&request).await {
            Ok((steps, source)) if !steps.is_empty() => (steps, source),
            Ok(_) => {
                warnings.push("decomposition produced no steps".to_string());
                (Vec::new(), DecompositionSource::Fallback)
            }
            Err(e) => {
                warn!(task_id = %context.task_id, "Decomposition failed: {}", e);
                warnings.push(format!("decomposition failed: {}", e));
                (Vec::new(), DecompositionSource::Fallback)
            }
        };

        let mut steps = self.validate_steps(steps, &tools, &mut warnings);
        if steps.is_empty() {
            warn!(task_id = %context.task_id, "Using minimal fallback plan");
            source = DecompositionSource::Fallback;
            steps = self.validate_steps(fallback_steps(description, &tools), &tools, &mut warnings);
        }
        let steps = self.optimize_steps(steps, &tools, &mut warnings);

        let mut plan = ExecutionPlan::new(plan_title(description), description, strategy, steps);
        plan.hierarchy = self.build_hierarchy(plan.steps());
        plan.metadata = PlanMetadata {
            created_at: Utc::now(),
            task_type: Some(classification.task_type.to_string()),
            complexity_level: Some(classification.complexity.to_string()),
            source,
            fallback: source == DecompositionSource::Fallback,
            validation_warnings: warnings,
        };
        for warning in &plan.metadata.validation_warnings {
            debug!(task_id = %context.task_id, "Plan warning: {}", warning);
        }
        info!(
            task_id = %context.task_id,
            plan_id = %plan.id,
            steps = plan.len(),
            depth = plan.hierarchy.max_depth,
            fallback = plan.metadata.fallback,
            estimated_ms = plan.total_estimated_duration().as_millis() as u64,
            "Created plan"
        );

        let plan = Arc::new(plan);
        if self.config.cache_enabled {
            self.cache.insert(key, plan.clone());
        }
        Ok(plan)
    }

    /// Check steps against the tool list: substitute configured or
    /// same-family alternatives for missing tools, drop steps with none, and
    /// prune duplicate, dangling, self and circular dependencies
    pub fn validate_steps(
        &self,
        steps: Vec<Step>,
        tools: &[String],
        warnings: &mut Vec<String>,
    ) -> Vec<Step> {
        let mut seen = HashSet::new();
        let mut valid = Vec::with_capacity(steps.len());
        for mut step in steps {
            if !seen.insert(step.id.clone()) {
                warnings.push(format!("dropped duplicate step {}", step.id));
                continue;
            }
            if !tools.is_empty() && !tools.contains(&step.tool) {
                let replacement = self
                    .config
                    .adaptation
                    .alternative_for(&step.tool, tools)
                    .or_else(|| tool_for_capability(&step.tool, tools));
                match replacement {
                    Some(tool) => {
                        warnings.push(format!(
                            "step {}: tool {} unavailable, using {}",
                            step.id, step.tool, tool
                        ));
                        self.config.adaptation.switch_tool(&mut step, &tool);
                    }
                    None => {
                        warnings.push(format!(
                            "dropped step {}: tool {} unavailable",
                            step.id, step.tool
                        ));
                        seen.remove(&step.id);
                        continue;
                    }
                }
            }
            valid.push(step);
        }

        let ids: HashSet<StepId> = valid.iter().map(|s| s.id.clone()).collect();
        for step in &mut valid {
            let id = step.id.clone();
            step.dependencies.retain(|dep| {
                if *dep == id {
                    warnings.push(format!("step {}: removed self dependency", id));
                    false
                } else if !ids.contains(dep) {
                    warnings.push(format!("step {}: removed unknown dependency {}", id, dep));
                    false
                } else {
                    true
                }
            });
        }

        for issue in self.resolver.break_explicit_cycles(&mut valid) {
            warnings.push(issue.to_string());
        }
        valid
    }

    /// Order steps so dependencies come first, rebalance a dominant tool,
    /// relax gathering dependencies nothing requires and rescale durations
    pub fn optimize_steps(
        &self,
        steps: Vec<Step>,
        tools: &[String],
        warnings: &mut Vec<String>,
    ) -> Vec<Step> {
        let mut steps = topological_order(steps);
        self.rebalance_tools(&mut steps, tools, warnings);
        relax_gathering_dependencies(&mut steps, warnings);
        if self.config.rescale_durations {
            for step in &mut steps {
                step.estimated_duration = step.estimated_duration.mul_f64(0.5 + step.complexity);
            }
        }
        steps
    }

    fn rebalance_tools(&self, steps: &mut [Step], tools: &[String], warnings: &mut Vec<String>) {
        if steps.len() < 3 {
            return;
        }
        let mut usage: HashMap<&str, usize> = HashMap::new();
        for step in steps.iter() {
            *usage.entry(step.tool.as_str()).or_default() += 1;
        }
        let Some((dominant, count)) = usage
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
            .map(|(tool, count)| (tool.to_string(), count))
        else {
            return;
        };
        if (count as f64 / steps.len() as f64) <= self.config.tool_dominance_ratio {
            return;
        }
        let Some(alternatives) = self.config.adaptation.alternative_tools.get(&dominant) else {
            return;
        };
        let alternatives: Vec<&String> = alternatives.iter().filter(|t| tools.contains(t)).collect();
        if alternatives.is_empty() {
            return;
        }

        let mut moved = 0;
        for step in steps
            .iter_mut()
            .filter(|s| s.tool == dominant && s.can_parallelize)
            .skip(1)
            .step_by(2)
        {
            let target = alternatives[moved % alternatives.len()].clone();
            self.config.adaptation.switch_tool(step, &target);
            moved += 1;
        }
        if moved > 0 {
            warnings.push(format!("rebalanced {} steps away from {}", moved, dominant));
        }
    }

    /// Hierarchy metadata of a step set: levels, parent/child links,
    /// criticality, critical path and parallel branches
    pub fn build_hierarchy(&self, steps: &[Step]) -> PlanHierarchy {
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let parents: Vec<Vec<usize>> = steps
            .iter()
            .map(|s| {
                s.dependencies
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (child, step_parents) in parents.iter().enumerate() {
            for &parent in step_parents {
                children[parent].push(child);
            }
        }

        // relax until stable; bounded by the step count so leftover cycles
        // cannot loop forever
        let mut levels = vec![0u32; steps.len()];
        for _ in 0..steps.len() {
            let mut changed = false;
            for i in 0..steps.len() {
                let level = parents[i]
                    .iter()
                    .map(|&p| levels[p] + 1)
                    .max()
                    .unwrap_or(0);
                if level != levels[i] {
                    levels[i] = level;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let total_secs: f64 = steps
            .iter()
            .map(|s| s.estimated_duration.as_secs_f64())
            .sum::<f64>()
            .max(f64::EPSILON);
        let fan_out_scale = steps.len().saturating_sub(1).max(1) as f64;
        let criticality: Vec<f64> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let fan_out = children[i].len() as f64 / fan_out_scale;
                let share = s.estimated_duration.as_secs_f64() / total_secs;
                (0.4 * fan_out + 0.3 * s.complexity + 0.3 * share).clamp(0.0, 1.0)
            })
            .collect();

        let mut ranked: Vec<usize> = (0..steps.len()).collect();
        ranked.sort_by(|&a, &b| {
            criticality[b]
                .partial_cmp(&criticality[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let critical_path = ranked
            .into_iter()
            .take(self.config.critical_path_size)
            .map(|i| steps[i].id.clone())
            .collect();

        let nodes: BTreeMap<StepId, StepHierarchy> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (
                    s.id.clone(),
                    StepHierarchy {
                        level: levels[i],
                        parents: parents[i].iter().map(|&p| steps[p].id.clone()).collect(),
                        children: children[i].iter().map(|&c| steps[c].id.clone()).collect(),
                        criticality: criticality[i],
                    },
                )
            })
            .collect();

        let parallel_branches = self
            .resolver
            .optimize_parallel_execution(steps)
            .into_iter()
            .flat_map(|level| level.parallel_groups)
            .collect();

        PlanHierarchy {
            nodes,
            critical_path,
            parallel_branches,
            max_depth: levels.iter().copied().max().unwrap_or(0),
        }
    }
}

/// Tools a plan may use: the caller's list narrowed by the context's
/// `allowed_tools` constraint
fn effective_tools(context: &OrchestrationContext, available_tools: &[String]) -> Vec<String> {
    let mut tools: Vec<String> = match context.allowed_tools() {
        Some(allowed) => available_tools
            .iter()
            .filter(|t| allowed.contains(t))
            .cloned()
            .collect(),
        None => available_tools.to_vec(),
    };
    tools.sort();
    tools.dedup();
    tools
}

fn plan_title(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or(description).trim();
    if first_line.chars().count() <= TITLE_LIMIT {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(TITLE_LIMIT).collect();
    format!("{}...", truncated.trim_end())
}

/// Stable topological order over declared dependencies; anything left in a
/// cycle keeps its original relative order at the end
fn topological_order(steps: Vec<Step>) -> Vec<Step> {
    let index: HashMap<StepId, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();
    let mut placed = vec![false; steps.len()];
    let mut order = Vec::with_capacity(steps.len());

    loop {
        let next = (0..steps.len()).find(|&i| {
            !placed[i]
                && steps[i]
                    .dependencies
                    .iter()
                    .all(|d| index.get(d).is_none_or(|&j| placed[j]))
        });
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => break,
        }
    }
    order.extend((0..steps.len()).filter(|&i| !placed[i]));

    let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

fn is_gathering(step: &Step) -> bool {
    matches!(
        step.category(),
        ToolCategory::Search | ToolCategory::Browser | ToolCategory::FileRead
    )
}

/// Drop dependencies between two parallelizable gathering steps that share
/// no data and no resources
fn relax_gathering_dependencies(steps: &mut [Step], warnings: &mut Vec<String>) {
    let snapshot: HashMap<StepId, Step> = steps.iter().map(|s| (s.id.clone(), s.clone())).collect();
    for step in steps.iter_mut() {
        if !step.can_parallelize || !is_gathering(step) {
            continue;
        }
        let tags = step.effective_resource_tags();
        let id = step.id.clone();
        let inputs = step.inputs.clone();
        step.dependencies.retain(|dep| {
            let Some(parent) = snapshot.get(dep) else {
                return true;
            };
            let independent = parent.can_parallelize
                && is_gathering(parent)
                && !parent.outputs.iter().any(|o| inputs.contains(o))
                && parent.effective_resource_tags().is_disjoint(&tags);
            if independent {
                warnings.push(format!("relaxed dependency {} -> {}", dep, id));
            }
            !independent
        });
    }
}
