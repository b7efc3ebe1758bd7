use super::types::{ActiveTask, OrchestrationMetrics, OrchestrationResult, OrchestratorConfig};
use crate::error::OrchestraError;
use crate::execution::{
    AdaptiveExecutionEngine, CancellationFlag, EngineConfig, ExecutionContext, PlanExecution,
    StepReservations,
};
use crate::plan::{
    DependencyResolver, ExecutionPlan, OrchestrationContext, ResolvedSchedule, ResultStatus,
    TaskId,
};
use crate::planning::{HierarchicalPlanningEngine, PlanningConfig, RuleBasedAdapter, StepAdapter};
use crate::resources::{
    AlertLevel, ResourceAlert, ResourceManager, ResourceManagerConfig, ResourceRequest,
    ResourceType, step_key,
};
use crate::telemetry::{LifecycleEventKind, Telemetry};
use crate::tools::ToolExecutor;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-step demand as (type, base units, units per complexity point)
const STEP_DEMAND: [(ResourceType, f64, f64); 2] = [
    (ResourceType::Cpu, 10.0, 40.0),
    (ResourceType::Memory, 10.0, 30.0),
];

struct Registration {
    run_id: Uuid,
    description: String,
    plan_id: Option<String>,
    started_at: DateTime<Utc>,
    cancel: CancellationFlag,
    step_keys: Vec<String>,
}

async fn release_keys(resources: &ResourceManager, keys: &[String]) -> usize {
    let mut released = 0;
    for key in keys {
        released += resources.release(key).await;
    }
    released
}

/// Holds the admission permit and the active registration of one run.
///
/// Dropping it deregisters the run; resources are released in the
/// background if `finish` was never reached, e.g. when the caller abandons
/// the orchestration future.
struct ActiveGuard {
    task_id: TaskId,
    run_id: Uuid,
    active: Arc<DashMap<TaskId, Registration>>,
    resources: ResourceManager,
    step_keys: Vec<String>,
    released: bool,
    _permit: OwnedSemaphorePermit,
}

impl ActiveGuard {
    async fn finish(mut self) -> usize {
        let released = release_keys(&self.resources, &self.step_keys).await;
        self.released = true;
        released
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let run_id = self.run_id;
        self.active
            .remove_if(&self.task_id, |_, registration| registration.run_id == run_id);
        if self.released || self.step_keys.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let resources = self.resources.clone();
            let keys = std::mem::take(&mut self.step_keys);
            handle.spawn(async move {
                release_keys(&resources, &keys).await;
            });
        }
    }
}

/// Entry point of the core: plans a task, reserves resources for its steps,
/// runs the plan adaptively and aggregates the outcome.
///
/// At most `max_concurrent_tasks` orchestrations run at once; the limit is
/// halved while a critical resource alert is recent.
pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    planner: Arc<HierarchicalPlanningEngine>,
    resolver: DependencyResolver,
    engine_config: EngineConfig,
    adapter: Arc<dyn StepAdapter>,
    tools: Arc<dyn ToolExecutor>,
    resources: ResourceManager,
    telemetry: Telemetry,
    admission: Arc<Semaphore>,
    active: Arc<DashMap<TaskId, Registration>>,
    metrics: Arc<RwLock<OrchestrationMetrics>>,
    alerts: Mutex<broadcast::Receiver<ResourceAlert>>,
    last_critical: Mutex<Option<Instant>>,
}

impl TaskOrchestrator {
    /// Orchestrator with default planning, execution and resource settings
    pub fn new(config: OrchestratorConfig, tools: Arc<dyn ToolExecutor>) -> Self {
        let planning = PlanningConfig::default();
        let adapter = Arc::new(RuleBasedAdapter::new(planning.adaptation.clone()));
        let resources = ResourceManager::new(ResourceManagerConfig::default());
        let alerts = Mutex::new(resources.subscribe_alerts());
        Self {
            admission: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            config,
            planner: Arc::new(HierarchicalPlanningEngine::new(planning)),
            resolver: DependencyResolver::default(),
            engine_config: EngineConfig::default(),
            adapter,
            tools,
            resources,
            telemetry: Telemetry::logging(),
            active: Arc::new(DashMap::new()),
            metrics: Arc::new(RwLock::new(OrchestrationMetrics::default())),
            alerts,
            last_critical: Mutex::new(None),
        }
    }

    pub fn with_planner(mut self, planner: HierarchicalPlanningEngine) -> Self {
        self.planner = Arc::new(planner);
        self
    }

    pub fn with_resolver(mut self, resolver: DependencyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = engine_config;
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn StepAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_resources(mut self, resources: ResourceManager) -> Self {
        self.alerts = Mutex::new(resources.subscribe_alerts());
        self.resources = resources;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn planner(&self) -> &HierarchicalPlanningEngine {
        &self.planner
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Start the background resource monitor
    pub async fn start(&self) {
        self.resources.start_monitoring().await;
    }

    /// Plan `context.task_description` and run the plan
    pub async fn orchestrate(
        &self,
        context: OrchestrationContext,
    ) -> Result<OrchestrationResult, OrchestraError> {
        self.execute(context, None).await
    }

    /// Run a caller-built plan, skipping the planning stage
    pub async fn orchestrate_plan(
        &self,
        context: OrchestrationContext,
        plan: ExecutionPlan,
    ) -> Result<OrchestrationResult, OrchestraError> {
        self.execute(context, Some(plan)).await
    }

    async fn execute(
        &self,
        context: OrchestrationContext,
        provided: Option<ExecutionPlan>,
    ) -> Result<OrchestrationResult, OrchestraError> {
        context.validate()?;
        let (mut guard, cancel) = self.admit(&context).await?;
        let task_id = context.task_id.clone();

        info!(task_id = %task_id, priority = context.priority, "Orchestration started");
        self.telemetry.emit(
            LifecycleEventKind::TaskStarted,
            &task_id,
            json!({
                "description": context.task_description,
                "user_id": context.user_id,
                "session_id": context.session_id,
                "priority": context.priority,
            }),
        );

        let outcome = self.run(&context, provided, &cancel, &mut guard).await;
        let released = guard.finish().await;
        debug!(task_id = %task_id, released, "Released orchestration resources");

        match outcome {
            Ok(result) => {
                self.record_metrics(&result).await;
                let kind = if result.success {
                    LifecycleEventKind::TaskCompleted
                } else {
                    LifecycleEventKind::TaskFailed
                };
                self.telemetry.emit(
                    kind,
                    &task_id,
                    json!({
                        "success": result.success,
                        "steps_completed": result.steps_completed,
                        "steps_failed": result.steps_failed,
                        "adaptations_made": result.adaptations_made,
                        "cancelled": result.cancelled,
                        "duration_ms": result.duration.as_millis() as u64,
                        "error": result.error,
                    }),
                );
                info!(
                    task_id = %task_id,
                    success = result.success,
                    completed = result.steps_completed,
                    failed = result.steps_failed,
                    adaptations = result.adaptations_made,
                    duration_ms = result.duration.as_millis() as u64,
                    "Orchestration finished"
                );
                Ok(result)
            }
            Err(e) => {
                if matches!(e, OrchestraError::Cancelled(_)) {
                    self.metrics.write().await.record_cancelled();
                } else {
                    self.metrics.write().await.record_error();
                }
                self.telemetry.emit(
                    LifecycleEventKind::TaskFailed,
                    &task_id,
                    json!({ "error": e.to_string(), "kind": e.kind() }),
                );
                warn!(task_id = %task_id, "Orchestration failed: {}", e);
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        context: &OrchestrationContext,
    ) -> Result<(ActiveGuard, CancellationFlag), OrchestraError> {
        let limit = self.admission_limit();
        let active = self.active.len();
        let permit = if active < limit {
            self.admission.clone().try_acquire_owned().ok()
        } else {
            None
        };
        let Some(permit) = permit else {
            self.metrics.write().await.rejected += 1;
            warn!(task_id = %context.task_id, active, limit, "Admission rejected");
            return Err(OrchestraError::AdmissionRejected { active, limit });
        };

        let run_id = Uuid::new_v4();
        let cancel = CancellationFlag::new();
        match self.active.entry(context.task_id.clone()) {
            Entry::Occupied(_) => {
                return Err(OrchestraError::Orchestration(format!(
                    "task {} is already running",
                    context.task_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    run_id,
                    description: context.task_description.clone(),
                    plan_id: None,
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                    step_keys: Vec::new(),
                });
            }
        }

        let guard = ActiveGuard {
            task_id: context.task_id.clone(),
            run_id,
            active: self.active.clone(),
            resources: self.resources.clone(),
            step_keys: Vec::new(),
            released: false,
            _permit: permit,
        };
        Ok((guard, cancel))
    }

    /// Current admission limit: halved while a critical alert is recent
    pub fn admission_limit(&self) -> usize {
        let limit = self.config.max_concurrent_tasks.max(1);
        if self.recently_critical() {
            (limit / 2).max(1)
        } else {
            limit
        }
    }

    fn recently_critical(&self) -> bool {
        let mut latest = None;
        if let Ok(mut alerts) = self.alerts.lock() {
            loop {
                match alerts.try_recv() {
                    Ok(alert) if alert.level == AlertLevel::Critical => {
                        latest = Some(Instant::now());
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Lagged(skipped)) => {
                        debug!(skipped, "Missed resource alerts");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        let Ok(mut last) = self.last_critical.lock() else {
            return false;
        };
        if latest.is_some() {
            *last = latest;
        }
        last.is_some_and(|at| at.elapsed() < self.config.throttle_cooldown())
    }

    async fn run(
        &self,
        context: &OrchestrationContext,
        provided: Option<ExecutionPlan>,
        cancel: &CancellationFlag,
        guard: &mut ActiveGuard,
    ) -> Result<OrchestrationResult, OrchestraError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let task_id = context.task_id.as_str();

        let mut plan = match provided {
            Some(plan) => plan,
            None => {
                let tools = self.tools.available_tools();
                self.planner
                    .create_plan(&context.task_description, context, &tools)
                    .await?
                    .as_ref()
                    .clone()
            }
        };
        if plan.is_empty() {
            return Err(OrchestraError::Validation(format!(
                "plan {} has no steps",
                plan.id
            )));
        }

        let schedule = self.resolver.resolve(plan.steps());
        for error in dependency_errors(&schedule) {
            warn!(task_id, plan_id = %plan.id, "{}", error);
        }
        // steps keep only the edges the schedule honours
        for (step_id, dependencies) in &schedule.effective_dependencies {
            plan.update_step(step_id, |step| step.dependencies = dependencies.clone());
        }

        guard.step_keys = plan
            .steps()
            .iter()
            .map(|step| step_key(task_id, &step.id))
            .collect();
        if let Some(mut registration) = self.active.get_mut(task_id)
            && registration.run_id == guard.run_id
        {
            registration.plan_id = Some(plan.id.clone());
            registration.step_keys = guard.step_keys.clone();
        }

        self.telemetry.emit(
            LifecycleEventKind::PlanUpdated,
            task_id,
            json!({
                "plan_id": plan.id,
                "strategy": plan.strategy.to_string(),
                "steps": plan.step_ids(),
                "levels": schedule.execution_order(),
                "fallback": plan.metadata.fallback,
            }),
        );
        info!(
            task_id,
            plan_id = %plan.id,
            strategy = %plan.strategy,
            steps = plan.len(),
            levels = schedule.levels.len(),
            "Plan ready"
        );

        if cancel.is_cancelled() {
            info!(task_id, "Cancelled before execution started");
            return Err(OrchestraError::Cancelled(task_id.to_string()));
        }

        let mut ctx = ExecutionContext::new(task_id).with_cancellation(cancel.clone());
        if let Some(reservations) = self.step_reservations(context, &plan) {
            ctx = ctx.with_reservations(reservations);
        }
        if let Some(timeout) = context.timeout {
            match started.checked_add(timeout) {
                Some(deadline) => ctx = ctx.with_deadline(deadline),
                None => debug!(task_id, "Timeout out of the clock's range; no deadline"),
            }
        }

        let run = self.engine().execute_plan(&plan, &schedule, &ctx).await;
        Ok(build_result(context, &plan, &schedule, run, started, started_at))
    }

    /// Cpu and memory demand of every step, requested by the engine once
    /// the step's group or slot is reached. `None` when neither type is
    /// managed.
    fn step_reservations(
        &self,
        context: &OrchestrationContext,
        plan: &ExecutionPlan,
    ) -> Option<StepReservations> {
        let limits = self.resources.config();
        if STEP_DEMAND
            .iter()
            .all(|(resource_type, _, _)| limits.max_for(*resource_type).is_none())
        {
            return None;
        }

        let task_id = context.task_id.as_str();
        let mut reservations = StepReservations::new();
        for step in plan.steps() {
            let key = step_key(task_id, &step.id);
            // a grant covers every attempt of the step
            let attempts = step
                .attempt_limit(self.engine_config.max_adaptation_attempts)
                .saturating_add(1);
            let expected_duration = self.engine_config.step_deadline(step).saturating_mul(attempts);
            let requests = STEP_DEMAND
                .iter()
                .filter_map(|&(resource_type, base, per_complexity)| {
                    let max = limits.max_for(resource_type)?;
                    let amount =
                        ((base + per_complexity * step.complexity) * self.config.resource_scale)
                            .min(max);
                    Some(
                        ResourceRequest::new(key.clone(), resource_type, amount)
                            .with_priority(context.priority)
                            .with_timeout(self.config.resource_request_timeout())
                            .with_expected_duration(expected_duration),
                    )
                })
                .collect();
            reservations.insert(step.id.clone(), requests);
        }
        Some(reservations)
    }

    fn engine(&self) -> AdaptiveExecutionEngine {
        AdaptiveExecutionEngine::new(
            self.engine_config.clone(),
            self.tools.clone(),
            self.adapter.clone(),
        )
        .with_resources(self.resources.clone())
        .with_telemetry(self.telemetry.clone())
    }

    async fn record_metrics(&self, result: &OrchestrationResult) {
        let efficiency = self.resources.metrics().await.resource_efficiency();
        let mut metrics = self.metrics.write().await;
        metrics.record(result);
        if efficiency.is_some() {
            metrics.resource_efficiency = efficiency;
        }
    }

    /// Stop scheduling the task's remaining steps and release its resources.
    /// In-flight tool calls run to their deadline; completed steps stay in
    /// the partial result.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some((_, registration)) = self.active.remove(task_id) else {
            debug!(task_id, "Cancel requested for unknown task");
            return false;
        };
        registration.cancel.cancel();
        let released = release_keys(&self.resources, &registration.step_keys).await;
        info!(task_id, released, "Orchestration cancelled");
        true
    }

    pub async fn metrics(&self) -> OrchestrationMetrics {
        self.metrics.read().await.clone()
    }

    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        let mut tasks: Vec<ActiveTask> = self
            .active
            .iter()
            .map(|entry| ActiveTask {
                task_id: entry.key().clone(),
                description: entry.description.clone(),
                plan_id: entry.plan_id.clone(),
                started_at: entry.started_at,
                cancelled: entry.cancel.is_cancelled(),
            })
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        tasks
    }

    /// Cancel every active orchestration and stop the resource monitor
    pub async fn shutdown(&self) {
        let task_ids: Vec<TaskId> = self.active.iter().map(|e| e.key().clone()).collect();
        for task_id in &task_ids {
            self.cancel(task_id).await;
        }
        self.resources.shutdown().await;
        info!(cancelled = task_ids.len(), "Orchestrator shut down");
    }
}

fn build_result(
    context: &OrchestrationContext,
    plan: &ExecutionPlan,
    schedule: &ResolvedSchedule,
    run: PlanExecution,
    started: Instant,
    started_at: DateTime<Utc>,
) -> OrchestrationResult {
    let steps_completed = run.completed();
    let steps_failed = run.failed();
    let steps_cancelled = run.interrupted();
    let ran_out_of_time =
        run.deadline_exceeded && (!run.not_started.is_empty() || steps_cancelled > 0);
    let success = steps_failed == 0
        && steps_completed > 0
        && steps_cancelled == 0
        && !run.cancelled
        && !ran_out_of_time;

    let (summary, error) = if success {
        (
            Some(format!(
                "Completed {} of {} steps with {} adaptations",
                steps_completed,
                plan.len(),
                run.adaptations.len()
            )),
            None,
        )
    } else {
        let first_error = run
            .results
            .iter()
            .find(|r| r.status == ResultStatus::Failed)
            .and_then(|r| r.error.clone());
        let reason = if run.cancelled {
            "orchestration cancelled".to_string()
        } else if let Some(halt) = &run.halted {
            format!("halted early: {}", halt)
        } else if ran_out_of_time {
            "deadline exceeded before all steps ran".to_string()
        } else if let Some(first_error) = first_error {
            format!(
                "{} of {} steps failed; first error: {}",
                steps_failed,
                plan.len(),
                first_error
            )
        } else {
            "no steps completed".to_string()
        };
        (None, Some(reason))
    };

    let issues = dependency_errors(schedule)
        .map(|error| error.to_string())
        .chain(plan.metadata.validation_warnings.iter().cloned())
        .chain(run.resource_issues.iter().cloned())
        .collect();

    OrchestrationResult {
        task_id: context.task_id.clone(),
        plan_id: plan.id.clone(),
        strategy: plan.strategy,
        fallback: plan.metadata.fallback,
        success,
        steps_total: plan.len(),
        steps_completed,
        steps_failed,
        steps_skipped: run.skipped.len(),
        steps_cancelled,
        steps_not_started: run.not_started.len(),
        adaptations_made: run.adaptations.len(),
        outputs: run.outputs(),
        adaptations: run.adaptations,
        results: run.results,
        summary,
        error,
        cancelled: run.cancelled,
        halted: run.halted,
        deadline_exceeded: run.deadline_exceeded,
        execution_order: schedule.execution_order(),
        issues,
        started_at,
        duration: started.elapsed(),
    }
}

/// Resolver findings as the errors they were recovered from
fn dependency_errors(schedule: &ResolvedSchedule) -> impl Iterator<Item = OrchestraError> + '_ {
    schedule
        .issues
        .iter()
        .map(|issue| OrchestraError::Dependency(issue.to_string()))
}
