use anyhow::{Context, Result};
use orca::cli::{Args, ConfigDiscovery, ExecutionMode, OrcaConfig, PlanConfig, RunConfig};
use orca::env;
use orca::execution::describe_levels;
use orca::plan::{ExecutionPlan, OrchestrationContext};
use orca::tools::{SimulatedToolExecutor, ToolExecutor};
use orca::{DependencyResolver, HierarchicalPlanningEngine, OrchestrationResult};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let verbose = matches!(&mode, ExecutionMode::Run(run) if run.verbose);
    let logging = Logging::init(verbose);

    match mode {
        ExecutionMode::Run(config) => run_task(config, &logging).await,
        ExecutionMode::Plan(config) => show_plan(config, &logging).await,
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
        ExecutionMode::InitConfig => {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("Configuration file: {}", path.display());
            Ok(())
        }
    }
}

/// Logging is up before configuration discovery runs, so discovery is
/// logged too; the configured level is swapped in once the file is read.
struct Logging {
    filter: reload::Handle<EnvFilter, Registry>,
    /// `--verbose` or `RUST_LOG` set the filter and win over the config file
    pinned: bool,
}

impl Logging {
    fn init(verbose: bool) -> Self {
        let from_env = EnvFilter::try_from_default_env().ok();
        let pinned = verbose || from_env.is_some();
        let filter = if verbose {
            EnvFilter::new(env::VERBOSE_LOG_FILTER)
        } else {
            from_env.unwrap_or_else(|| EnvFilter::new(env::DEFAULT_LOG_FILTER))
        };
        let (filter, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        Self {
            filter: handle,
            pinned,
        }
    }

    fn apply_configured(&self, level: &str) {
        if self.pinned {
            return;
        }
        if let Err(e) = self.filter.reload(EnvFilter::new(level)) {
            warn!("Keeping the default log filter: {}", e);
        }
    }
}

fn load_config(explicit: Option<&Path>, logging: &Logging) -> Result<OrcaConfig> {
    let (config, source) = ConfigDiscovery::load(explicit)?;
    logging.apply_configured(&config.logging.level);
    match source {
        Some(path) => info!("Using configuration from {}", path.display()),
        None => info!("Using built-in configuration defaults"),
    }
    Ok(config)
}

fn context_for(description: &str, tools: &[String]) -> OrchestrationContext {
    let task_id = Uuid::new_v4().to_string();
    let session_id = Uuid::new_v4().to_string();
    let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    let context = OrchestrationContext::new(task_id, user, session_id, description);
    if tools.is_empty() {
        context
    } else {
        context.with_constraint("allowed_tools", json!(tools))
    }
}

async fn run_task(run: RunConfig, logging: &Logging) -> Result<()> {
    let config = load_config(run.config_override.as_deref(), logging)?;
    let tools: Arc<dyn ToolExecutor> = Arc::new(SimulatedToolExecutor::new(config.tools.clone()));
    let orchestrator = config.build_orchestrator(tools);
    orchestrator.start().await;

    let mut context = context_for(&run.description, &run.tools).with_priority(run.priority);
    if let Some(timeout) = run.timeout {
        context = context.with_timeout(timeout);
    }
    info!(task_id = %context.task_id, "Orchestrating task");

    let outcome = orchestrator.orchestrate(context).await;
    orchestrator.shutdown().await;
    let result = outcome.context("orchestration failed")?;

    if run.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if !result.success {
        warn!(task_id = %result.task_id, "Task did not succeed");
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(result: &OrchestrationResult) {
    let status = if result.success { "succeeded" } else { "failed" };
    println!("Task {} {}", result.task_id, status);
    println!(
        "  Plan: {} ({} strategy{})",
        result.plan_id,
        result.strategy,
        if result.fallback { ", fallback" } else { "" }
    );
    println!(
        "  Steps: {} total, {} completed, {} failed, {} skipped, {} cancelled, {} not started",
        result.steps_total,
        result.steps_completed,
        result.steps_failed,
        result.steps_skipped,
        result.steps_cancelled,
        result.steps_not_started
    );
    println!("  Adaptations: {}", result.adaptations_made);
    println!("  Duration: {} ms", result.duration.as_millis());
    for step in &result.results {
        match &step.error {
            Some(error) => println!("    {} {:?}: {}", step.step_id, step.status, error),
            None => println!("    {} {:?}", step.step_id, step.status),
        }
    }
    for issue in &result.issues {
        println!("  Issue: {}", issue);
    }
    if let Some(summary) = &result.summary {
        println!("  Summary: {}", summary);
    }
    if let Some(error) = &result.error {
        println!("  Error: {}", error);
    }
}

async fn show_plan(request: PlanConfig, logging: &Logging) -> Result<()> {
    let config = load_config(request.config_override.as_deref(), logging)?;
    let planner = HierarchicalPlanningEngine::new(config.planning.clone());
    let context = context_for(&request.description, &request.tools);

    let plan = planner
        .create_plan(&request.description, &context, &config.tools.tools)
        .await?;
    let schedule = DependencyResolver::default().resolve(plan.steps());

    if request.json {
        let document = json!({
            "plan": plan.as_ref(),
            "levels": schedule.execution_order(),
            "issues": schedule.issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    print_plan(&plan);
    println!("Levels: {}", describe_levels(&schedule.levels));
    for issue in &schedule.issues {
        println!("Issue: {}", issue);
    }
    Ok(())
}

fn print_plan(plan: &ExecutionPlan) {
    println!("Plan {}: {}", plan.id, plan.title);
    println!(
        "  Strategy: {}, estimated {} s, complexity {:.2}, success probability {:.2}",
        plan.strategy,
        plan.total_estimated_duration().as_secs(),
        plan.complexity_score(),
        plan.success_probability()
    );
    if plan.metadata.fallback {
        println!("  Fallback plan (decomposition failed)");
    }
    for step in plan.steps() {
        let deps = if step.dependencies.is_empty() {
            String::new()
        } else {
            format!(" after [{}]", step.dependencies.join(", "))
        };
        println!(
            "  - {} [{}] {} ({} s){}",
            step.id,
            step.tool,
            step.title,
            step.estimated_duration.as_secs(),
            deps
        );
    }
    for warning in &plan.metadata.validation_warnings {
        println!("  Warning: {}", warning);
    }
}
