//! # Orca
//!
//! An orchestrator for autonomous agent tasks. A natural-language task is
//! classified, decomposed into a plan of tool-using steps, scheduled into
//! dependency levels, given resource grants and executed with per-step
//! monitoring and adaptive recovery.
//!
//! ## Architecture Overview
//!
//! - **[`plan`]**: the plan data model and the dependency resolver that turns
//!   steps into a level schedule, repairing cycles on the way
//! - **[`resources`]**: capacity accounting with grant-or-queue requests,
//!   background monitoring and pressure alerts
//! - **[`execution`]**: the adaptive execution engine (retries, deadlines,
//!   error classification, stop conditions)
//! - **[`planning`]**: task classification, decomposition, plan validation,
//!   optimization and the plan cache
//! - **[`orchestrator`]**: admission control and the end-to-end pipeline
//! - **[`tools`]**, **[`llm`]**, **[`telemetry`]**: collaborator contracts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use orca::{OrchestrationContext, OrchestratorConfig, TaskOrchestrator};
//! use orca::tools::{SimulatedToolExecutor, SimulationConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let tools = Arc::new(SimulatedToolExecutor::new(SimulationConfig::default()));
//!     let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), tools);
//!
//!     let context = OrchestrationContext::new(
//!         "task-1",
//!         "user",
//!         "session",
//!         "Research rust async runtimes using web sources",
//!     );
//!     let result = orchestrator.orchestrate(context).await?;
//!     println!("{} of {} steps completed", result.steps_completed, result.steps_total);
//!     Ok(())
//! }
//! ```

/// Plan data model and dependency resolution.
pub mod plan;

/// Resource allocation, queuing and monitoring.
pub mod resources;

/// Adaptive step execution.
pub mod execution;

/// Hierarchical planning: classification, decomposition, adaptation.
pub mod planning;

/// Task orchestration.
pub mod orchestrator;

/// Tool backend contract, simulated and scripted backends.
pub mod tools;

/// Planning-assistant contract and plan document parsing.
pub mod llm;

/// Lifecycle events and sinks.
pub mod telemetry;

/// Error taxonomy shared by the components.
pub mod error;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use error::OrchestraError;
pub use execution::{AdaptiveExecutionEngine, EngineConfig};
pub use orchestrator::{OrchestrationMetrics, OrchestrationResult, OrchestratorConfig, TaskOrchestrator};
pub use plan::{DependencyResolver, ExecutionPlan, OrchestrationContext, Step};
pub use planning::{HierarchicalPlanningEngine, PlanningConfig};
pub use resources::{ResourceManager, ResourceManagerConfig};
