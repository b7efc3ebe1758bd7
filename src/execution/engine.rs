use super::monitor::StepMonitor;
use super::recovery::{ErrorCategory, RetryPolicy, StepFailure, classify_error, validate_output};
use crate::error::OrchestraError;
use crate::plan::{
    AdaptationEvent, ExecutionPlan, ExecutionResult, LevelSchedule, ResolvedSchedule,
    ResultStatus, Step, StepId, StepStatus,
};
use crate::planning::{AdaptationRequest, StepAdapter};
use crate::resources::{
    AllocationId, AllocationOutcome, ResourceError, ResourceManager, ResourceRequest,
    ResourceType, step_key,
};
use crate::telemetry::{LifecycleEventKind, Telemetry};
use crate::tools::{ProgressReporter, ToolExecutor, ToolOptions};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Adaptive execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Adaptations allowed per step
    pub max_adaptation_attempts: u32,
    /// Adaptations allowed across the plan before execution halts
    pub max_total_adaptations: u32,
    /// Halt when failed / (failed + completed) exceeds this
    pub failure_ratio_threshold: f64,
    /// Concurrency cap within a parallel group
    pub max_parallel_steps: usize,
    /// Hard deadline of one attempt as a multiple of its estimate
    pub hard_deadline_multiplier: f64,
    pub min_step_deadline_ms: u64,
    pub monitor_interval_ms: u64,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_adaptation_attempts: 3,
            max_total_adaptations: 10,
            failure_ratio_threshold: 0.5,
            max_parallel_steps: 4,
            hard_deadline_multiplier: 3.0,
            min_step_deadline_ms: 1_000,
            monitor_interval_ms: 250,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            retry_jitter: 0.0,
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            jitter: self.retry_jitter,
        }
    }

    /// Hard deadline of one attempt of `step`, saturating at `Duration::MAX`
    pub fn step_deadline(&self, step: &Step) -> Duration {
        let seconds =
            step.estimated_duration.as_secs_f64() * self.hard_deadline_multiplier.max(1.0);
        let scaled = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX);
        scaled.max(Duration::from_millis(self.min_step_deadline_ms))
    }

    fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

/// Cooperative cancellation shared between an orchestration and its caller
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resource requests the engine issues for each step once its parallel
/// group or sequential slot is reached
#[derive(Debug, Clone, Default)]
pub struct StepReservations {
    requests: HashMap<StepId, Vec<ResourceRequest>>,
}

impl StepReservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, step_id: impl Into<StepId>, requests: Vec<ResourceRequest>) {
        self.requests.insert(step_id.into(), requests);
    }

    pub fn requests_for(&self, step_id: &str) -> &[ResourceRequest] {
        self.requests.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.requests.values().all(Vec::is_empty)
    }
}

/// Queued tickets a step may still pick up before it starts
#[derive(Debug, Default)]
struct Reservation {
    queued: Vec<(AllocationId, ResourceType)>,
    denied: bool,
}

impl Reservation {
    fn complete(&self) -> bool {
        self.queued.is_empty() && !self.denied
    }
}

/// Per-run settings handed to the engine
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    pub cancel: CancellationFlag,
    /// Orchestration deadline; no step starts after it and running attempts
    /// are cut off at it
    pub deadline: Option<Instant>,
    /// Steps holding a resource grant. Bounds the width of parallel groups;
    /// `None` means no bound.
    pub granted: Option<HashSet<StepId>>,
    /// Demand requested from the attached resource manager step by step.
    /// Each step's grants are released as soon as it finishes.
    pub reservations: Option<StepReservations>,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            cancel: CancellationFlag::new(),
            deadline: None,
            granted: None,
            reservations: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_granted(mut self, granted: HashSet<StepId>) -> Self {
        self.granted = Some(granted);
        self
    }

    pub fn with_reservations(mut self, reservations: StepReservations) -> Self {
        self.reservations = Some(reservations);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_passed()
    }
}

/// Why a plan stopped before every step ran
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    FailureRatio {
        failed: usize,
        completed: usize,
        ratio: f64,
    },
    AdaptationBudget {
        total: usize,
        limit: u32,
    },
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::FailureRatio {
                failed,
                completed,
                ratio,
            } => write!(
                f,
                "failure ratio {:.2} ({} failed, {} completed)",
                ratio, failed, completed
            ),
            HaltReason::AdaptationBudget { total, limit } => {
                write!(f, "{} adaptations exceed the plan limit of {}", total, limit)
            }
        }
    }
}

/// Everything a plan run produced, partial or not
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PlanExecution {
    /// In completion order
    pub results: Vec<ExecutionResult>,
    pub adaptations: Vec<AdaptationEvent>,
    /// Steps not run because a dependency did not complete
    pub skipped: Vec<StepId>,
    /// Steps never reached because execution stopped
    pub not_started: Vec<StepId>,
    pub halted: Option<HaltReason>,
    pub cancelled: bool,
    pub deadline_exceeded: bool,
    /// Steps that ran without their full resource grant, and why
    pub resource_issues: Vec<String>,
}

impl PlanExecution {
    pub fn completed(&self) -> usize {
        self.count(ResultStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(ResultStatus::Failed)
    }

    /// Steps that were running when cancellation or the deadline hit
    pub fn interrupted(&self) -> usize {
        self.count(ResultStatus::Cancelled)
    }

    fn count(&self, status: ResultStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Outputs of completed steps
    pub fn outputs(&self) -> HashMap<StepId, Value> {
        self.results
            .iter()
            .filter_map(|r| Some((r.step_id.clone(), r.result.clone()?)))
            .collect()
    }

    pub fn result(&self, step_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }
}

/// Bookkeeping of one plan run, owned by the level loop
struct RunState<'a> {
    run: PlanExecution,
    statuses: HashMap<StepId, ResultStatus>,
    stop: &'a AtomicBool,
}

impl RunState<'_> {
    fn dependencies_completed(&self, dependencies: &[StepId]) -> bool {
        dependencies
            .iter()
            .all(|dep| self.statuses.get(dep) == Some(&ResultStatus::Completed))
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn record(&mut self, result: ExecutionResult, config: &EngineConfig, task_id: &str) {
        self.statuses.insert(result.step_id.clone(), result.status);
        self.run.adaptations.extend(result.adaptations.iter().cloned());
        self.run.results.push(result);

        if self.run.halted.is_some() {
            return;
        }
        let completed = self.run.completed();
        let failed = self.run.failed();
        let ratio = failed as f64 / (failed + completed).max(1) as f64;
        let halt = if failed > 0 && ratio > config.failure_ratio_threshold {
            Some(HaltReason::FailureRatio {
                failed,
                completed,
                ratio,
            })
        } else if self.run.adaptations.len() > config.max_total_adaptations as usize {
            Some(HaltReason::AdaptationBudget {
                total: self.run.adaptations.len(),
                limit: config.max_total_adaptations,
            })
        } else {
            None
        };
        if let Some(reason) = halt {
            warn!(task_id, "Halting plan execution: {}", reason);
            self.stop.store(true, Ordering::SeqCst);
            self.run.halted = Some(reason);
        }
    }
}

/// Runs plans level by level against a tool backend, re-issuing failed
/// steps through a [`StepAdapter`] within a bounded number of attempts.
pub struct AdaptiveExecutionEngine {
    config: EngineConfig,
    tools: Arc<dyn ToolExecutor>,
    adapter: Arc<dyn StepAdapter>,
    resources: Option<ResourceManager>,
    telemetry: Telemetry,
}

impl AdaptiveExecutionEngine {
    pub fn new(
        config: EngineConfig,
        tools: Arc<dyn ToolExecutor>,
        adapter: Arc<dyn StepAdapter>,
    ) -> Self {
        Self {
            config,
            tools,
            adapter,
            resources: None,
            telemetry: Telemetry::default(),
        }
    }

    /// Forward observed memory usage of running steps to `resources`
    pub fn with_resources(mut self, resources: ResourceManager) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `plan` following `schedule`.
    ///
    /// Levels run strictly in order. A step starts only once every one of
    /// its effective dependencies completed; otherwise it is skipped. Stop
    /// conditions are checked after every step and stop anything not yet
    /// started; completed results are always kept.
    pub async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        schedule: &ResolvedSchedule,
        ctx: &ExecutionContext,
    ) -> PlanExecution {
        let stop = AtomicBool::new(false);
        let mut state = RunState {
            run: PlanExecution::default(),
            statuses: HashMap::new(),
            stop: &stop,
        };
        let no_dependencies = Vec::new();
        let dependencies_of = |step_id: &str| {
            schedule
                .effective_dependencies
                .get(step_id)
                .unwrap_or(&no_dependencies)
        };

        info!(
            task_id = %ctx.task_id,
            plan_id = %plan.id,
            steps = plan.len(),
            levels = schedule.levels.len(),
            "Executing plan"
        );

        for level in &schedule.levels {
            if state.stopped() || ctx.should_stop() {
                break;
            }
            debug!(task_id = %ctx.task_id, level = level.index, steps = level.len(), "Starting level");

            for group in &level.parallel_groups {
                let mut runnable = Vec::new();
                for step_id in group {
                    let Some(step) = plan.step(step_id) else {
                        continue;
                    };
                    if state.dependencies_completed(dependencies_of(step_id)) {
                        runnable.push(step);
                    } else {
                        self.skip(&mut state, step, ctx);
                    }
                }
                self.run_group(&runnable, &mut state, ctx).await;
                if state.stopped() || ctx.should_stop() {
                    break;
                }
            }

            for step_id in &level.sequential {
                if state.stopped() || ctx.should_stop() {
                    break;
                }
                let Some(step) = plan.step(step_id) else {
                    continue;
                };
                if !state.dependencies_completed(dependencies_of(step_id)) {
                    self.skip(&mut state, step, ctx);
                    continue;
                }
                let reservation = self.reserve(step, ctx, &mut state.run.resource_issues).await;
                let (result, issue) = self.run_reserved(step, reservation, ctx).await;
                state.run.resource_issues.extend(issue);
                state.record(result, &self.config, &ctx.task_id);
            }
        }

        let mut run = state.run;
        let seen: HashSet<&str> = run
            .results
            .iter()
            .map(|r| r.step_id.as_str())
            .chain(run.skipped.iter().map(String::as_str))
            .collect();
        let not_started: Vec<StepId> = plan
            .steps()
            .iter()
            .filter(|step| !seen.contains(step.id.as_str()))
            .map(|step| step.id.clone())
            .collect();
        run.not_started = not_started;
        run.cancelled = ctx.cancel.is_cancelled();
        run.deadline_exceeded = ctx.deadline_passed();

        info!(
            task_id = %ctx.task_id,
            completed = run.completed(),
            failed = run.failed(),
            skipped = run.skipped.len(),
            not_started = run.not_started.len(),
            adaptations = run.adaptations.len(),
            halted = run.halted.is_some(),
            "Plan execution finished"
        );
        run
    }

    fn skip(&self, state: &mut RunState<'_>, step: &Step, ctx: &ExecutionContext) {
        warn!(
            task_id = %ctx.task_id,
            step_id = %step.id,
            "Skipping step: a dependency did not complete"
        );
        state.run.skipped.push(step.id.clone());
    }

    /// Run one parallel group, bounded by the configured width and by how
    /// many members hold a resource grant
    async fn run_group(&self, steps: &[&Step], state: &mut RunState<'_>, ctx: &ExecutionContext) {
        if steps.is_empty() {
            return;
        }
        let mut reservations = Vec::with_capacity(steps.len());
        for step in steps {
            reservations.push(self.reserve(step, ctx, &mut state.run.resource_issues).await);
        }
        let granted = steps
            .iter()
            .zip(&reservations)
            .filter(|&(step, reservation)| {
                ctx.granted
                    .as_ref()
                    .is_none_or(|granted| granted.contains(&step.id))
                    && reservation.as_ref().is_none_or(Reservation::complete)
            })
            .count();
        let width = self
            .config
            .max_parallel_steps
            .min(steps.len())
            .min(granted)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(width));
        let stop = state.stop;
        debug!(task_id = %ctx.task_id, members = steps.len(), width, "Running parallel group");

        let mut in_flight = FuturesUnordered::new();
        for (step, reservation) in steps.iter().zip(reservations) {
            let semaphore = semaphore.clone();
            in_flight.push(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    self.release_step(step, ctx).await;
                    return None;
                };
                if stop.load(Ordering::SeqCst) || ctx.should_stop() {
                    self.release_step(step, ctx).await;
                    return None;
                }
                Some(self.run_reserved(step, reservation, ctx).await)
            });
        }

        while let Some(outcome) = in_flight.next().await {
            if let Some((result, issue)) = outcome {
                state.run.resource_issues.extend(issue);
                state.record(result, &self.config, &ctx.task_id);
            }
        }
    }

    /// Issue the demand of `step` without waiting. `None` when the run
    /// reserves nothing for it.
    async fn reserve(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        issues: &mut Vec<String>,
    ) -> Option<Reservation> {
        let (Some(resources), Some(reservations)) = (&self.resources, &ctx.reservations) else {
            return None;
        };
        let requests = reservations.requests_for(&step.id);
        if requests.is_empty() {
            return None;
        }

        let mut reservation = Reservation::default();
        for request in requests {
            let resource_type = request.resource_type;
            match resources.try_request(request.clone()).await {
                Ok(AllocationOutcome::Granted(_)) => {}
                Ok(AllocationOutcome::Queued { ticket, position }) => {
                    debug!(
                        task_id = %ctx.task_id,
                        step_id = %step.id,
                        resource = %resource_type,
                        position,
                        "Resource request queued until the step starts"
                    );
                    reservation.queued.push((ticket, resource_type));
                }
                Err(e) => {
                    let error = OrchestraError::from(e);
                    warn!(
                        task_id = %ctx.task_id,
                        step_id = %step.id,
                        "Step proceeds without a grant: {}",
                        error
                    );
                    issues.push(format!("step {}: {}", step.id, error));
                    reservation.denied = true;
                }
            }
        }
        Some(reservation)
    }

    /// Keep queued grants that arrived while the step waited for its slot
    /// and withdraw the rest, then run the step and release what it held
    async fn run_reserved(
        &self,
        step: &Step,
        reservation: Option<Reservation>,
        ctx: &ExecutionContext,
    ) -> (ExecutionResult, Option<String>) {
        let mut issue = None;
        if let (Some(resources), Some(reservation)) = (&self.resources, reservation) {
            let mut missing = Vec::new();
            for (ticket, resource_type) in reservation.queued {
                if !resources.claim(ticket).await {
                    missing.push(resource_type.to_string());
                }
            }
            if !missing.is_empty() {
                let error = OrchestraError::ResourceExhausted(ResourceError::Withdrawn(
                    step_key(&ctx.task_id, &step.id),
                ));
                warn!(
                    task_id = %ctx.task_id,
                    step_id = %step.id,
                    missing = %missing.join(","),
                    "Step proceeds without a grant: {}",
                    error
                );
                issue = Some(format!("step {}: {}", step.id, error));
            }
        }

        let result = self.execute_step(step, ctx).await;
        self.release_step(step, ctx).await;
        (result, issue)
    }

    /// Drop the grants and queued requests of `step` once it no longer runs
    async fn release_step(&self, step: &Step, ctx: &ExecutionContext) {
        if let (Some(resources), Some(_)) = (&self.resources, &ctx.reservations) {
            resources.release(&step_key(&ctx.task_id, &step.id)).await;
        }
    }

    /// Run one step to a terminal state, adapting it after failures until
    /// the step's attempt limit is reached
    pub async fn execute_step(&self, original: &Step, ctx: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        let limit = original.attempt_limit(self.config.max_adaptation_attempts);
        let policy = self.config.retry_policy();
        let mut retry_delay = policy.initial_delay;
        let mut step = original.clone();
        let mut adaptations: Vec<AdaptationEvent> = Vec::new();

        step.status = StepStatus::Running;
        self.telemetry.emit(
            LifecycleEventKind::StepStarted,
            &ctx.task_id,
            json!({"step_id": step.id, "tool": step.tool}),
        );

        loop {
            let failure = match self.attempt(&step, ctx).await {
                Ok(output) => {
                    if let Some(last) = adaptations.last_mut() {
                        last.succeeded = true;
                    }
                    let elapsed = started.elapsed();
                    info!(
                        task_id = %ctx.task_id,
                        step_id = %step.id,
                        tool = %step.tool,
                        attempts = adaptations.len() + 1,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Step completed"
                    );
                    self.telemetry.emit(
                        LifecycleEventKind::StepCompleted,
                        &ctx.task_id,
                        json!({
                            "step_id": step.id,
                            "tool": step.tool,
                            "attempts": adaptations.len() + 1,
                            "execution_time_ms": elapsed.as_millis() as u64,
                        }),
                    );
                    return ExecutionResult::completed(step.id.clone(), output, elapsed)
                        .with_adaptations(adaptations);
                }
                Err(failure) => failure,
            };

            warn!(
                task_id = %ctx.task_id,
                step_id = %step.id,
                tool = %step.tool,
                category = %failure.category,
                attempt = adaptations.len() + 1,
                "Step attempt failed: {}",
                failure.message
            );

            if ctx.should_stop() {
                return self.interrupt(&step, &failure, started, adaptations, ctx);
            }

            let attempts = adaptations.len() as u32 + 1;
            let exhausted = adaptations.len() as u32 >= limit;
            let terminal_error = if exhausted && limit > 0 {
                Some(OrchestraError::AdaptationExhausted {
                    step_id: step.id.clone(),
                    attempts,
                    last_error: failure.message.clone(),
                })
            } else if exhausted {
                Some(self.execution_error(&step, &failure))
            } else {
                None
            };
            if let Some(error) = terminal_error {
                return self.fail(&step, error, started, adaptations, ctx);
            }

            step.status = StepStatus::Adapting;
            let request = AdaptationRequest {
                task_id: ctx.task_id.clone(),
                step: step.clone(),
                category: failure.category,
                error: failure.message.clone(),
                attempt: attempts,
                retry_delay: policy.jittered(retry_delay),
                available_tools: self.tools.available_tools(),
            };
            let Some(adaptation) = self.adapter.adapt(request).await else {
                let error = self.execution_error(&step, &failure);
                return self.fail(&step, error, started, adaptations, ctx);
            };

            if failure.category == ErrorCategory::NetworkError {
                retry_delay = policy.next_delay(retry_delay);
            }
            info!(
                task_id = %ctx.task_id,
                step_id = %step.id,
                trigger = %adaptation.trigger,
                attempt = attempts,
                "Adapting step: {}",
                adaptation.reason
            );
            adaptations.push(AdaptationEvent::new(
                adaptation.trigger,
                step.clone(),
                adaptation.step.clone(),
                adaptation.reason,
                attempts,
            ));
            if let Some(delay) = adaptation.delay {
                tokio::time::sleep(delay).await;
            }
            step = adaptation.step;
            step.retry_count += 1;
            step.status = StepStatus::Running;
        }
    }

    fn execution_error(&self, step: &Step, failure: &StepFailure) -> OrchestraError {
        OrchestraError::Execution {
            step_id: step.id.clone(),
            category: failure.category,
            message: failure.message.clone(),
        }
    }

    fn fail(
        &self,
        step: &Step,
        error: OrchestraError,
        started: Instant,
        adaptations: Vec<AdaptationEvent>,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let message = error.to_string();
        warn!(task_id = %ctx.task_id, step_id = %step.id, "Step failed: {}", message);
        self.telemetry.emit(
            LifecycleEventKind::StepFailed,
            &ctx.task_id,
            json!({
                "step_id": step.id,
                "tool": step.tool,
                "attempts": adaptations.len() + 1,
                "error": message,
            }),
        );
        ExecutionResult::failed(step.id.clone(), message, started.elapsed())
            .with_adaptations(adaptations)
    }

    /// A failure that surfaced after cancellation or the orchestration
    /// deadline ends the step as cancelled; it is neither completed nor failed
    fn interrupt(
        &self,
        step: &Step,
        failure: &StepFailure,
        started: Instant,
        adaptations: Vec<AdaptationEvent>,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let cause = if ctx.cancel.is_cancelled() {
            "cancelled"
        } else {
            "deadline exceeded"
        };
        let reason = format!("{}: {}", cause, failure.message);
        info!(task_id = %ctx.task_id, step_id = %step.id, "Step interrupted: {}", reason);
        self.telemetry.emit(
            LifecycleEventKind::StepFailed,
            &ctx.task_id,
            json!({
                "step_id": step.id,
                "tool": step.tool,
                "attempts": adaptations.len() + 1,
                "error": reason,
                "cancelled": true,
            }),
        );
        let mut result =
            ExecutionResult::cancelled(step.id.clone(), reason).with_adaptations(adaptations);
        result.execution_time = started.elapsed();
        result
    }

    /// One tool call raced against its hard deadline while the monitor
    /// samples progress and memory
    async fn attempt(&self, step: &Step, ctx: &ExecutionContext) -> Result<Value, StepFailure> {
        let hard_deadline = self.config.step_deadline(step);
        // unreachable instants mean no cutoff
        let deadline = match (Instant::now().checked_add(hard_deadline), ctx.deadline) {
            (Some(own), Some(orchestration)) => Some(own.min(orchestration)),
            (own, orchestration) => own.or(orchestration),
        };

        let progress = ProgressReporter::new();
        let options = ToolOptions {
            timeout: hard_deadline,
            task_id: ctx.task_id.clone(),
            step_id: step.id.clone(),
            progress: progress.clone(),
        };
        let usage_key = step_key(&ctx.task_id, &step.id);
        let baseline = match &self.resources {
            Some(resources) => {
                let granted: f64 = resources
                    .allocations_for(&usage_key)
                    .await
                    .iter()
                    .filter(|a| a.resource_type == ResourceType::Memory)
                    .map(|a| a.allocated_amount)
                    .sum();
                (granted > 0.0).then_some(granted)
            }
            None => None,
        };
        let mut monitor =
            StepMonitor::start(step.estimated_duration, progress).with_baseline(baseline);

        let call = self.tools.execute(&step.tool, &step.parameters, options);
        tokio::pin!(call);
        let cutoff = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cutoff);
        let mut ticker = tokio::time::interval(self.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                result = &mut call => break Some(result),
                _ = &mut cutoff => break None,
                now = ticker.tick() => {
                    if let Some(memory) = monitor.observe(now)
                        && let Some(resources) = &self.resources
                    {
                        let usage = HashMap::from([(ResourceType::Memory, memory)]);
                        resources.update_usage(&usage_key, &usage).await;
                    }
                }
            }
        };
        monitor.observe(Instant::now());
        let flags = monitor.flags();
        if flags.any() {
            debug!(task_id = %ctx.task_id, step_id = %step.id, ?flags, "Monitor flags raised");
        }

        match outcome {
            None => Err(StepFailure {
                category: ErrorCategory::Timeout,
                message: format!(
                    "step {} timed out after {}ms",
                    step.id,
                    monitor.elapsed().as_millis()
                ),
                flags,
            }),
            Some(Err(error)) => Err(StepFailure {
                category: classify_error(Some(error.kind), &error.message, &flags),
                message: error.message,
                flags,
            }),
            Some(Ok(output)) => match validate_output(step, &output) {
                Ok(()) => Ok(output),
                Err(message) => Err(StepFailure {
                    category: ErrorCategory::UnexpectedResult,
                    message,
                    flags,
                }),
            },
        }
    }
}

/// Levels of `schedule` as plain step id lists, for logging
pub fn describe_levels(levels: &[LevelSchedule]) -> String {
    levels
        .iter()
        .map(|level| {
            let groups: Vec<String> = level
                .parallel_groups
                .iter()
                .map(|group| format!("[{}]", group.join(" | ")))
                .collect();
            let mut parts = groups;
            parts.extend(level.sequential.iter().cloned());
            format!("L{}: {}", level.index, parts.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}
