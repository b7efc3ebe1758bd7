//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: plan and orchestrate a task against the simulated tool backend
//! - `plan`: print the plan a task would get, without running it
//! - `show-config`: show configuration discovery information
//! - `init-config`: write the default configuration to the user config path

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    Plan(PlanConfig),
    ShowConfig,
    InitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub description: String,
    pub tools: Vec<String>,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub config_override: Option<PathBuf>,
    pub json: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanConfig {
    pub description: String,
    pub tools: Vec<String>,
    pub config_override: Option<PathBuf>,
    pub json: bool,
}

#[derive(Debug, Parser)]
#[command(name = "orca")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Plans, schedules and adaptively executes multi-step agent tasks")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Plan and execute a task with the simulated tool backend
    Run {
        /// Natural-language task description
        description: String,
        /// Restrict planning to these tools (repeatable)
        #[arg(short = 't', long = "tool", value_name = "TOOL")]
        tools: Vec<String>,
        /// Task priority, higher is more important
        #[arg(short = 'p', long = "priority", default_value_t = 5)]
        priority: i32,
        /// Overall orchestration deadline
        #[arg(long = "timeout-secs", value_name = "SECS")]
        timeout_secs: Option<u64>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Print the full result as JSON
        #[arg(long = "json")]
        json: bool,
        /// Enable debug logging
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show the plan a task would get
    Plan {
        /// Natural-language task description
        description: String,
        /// Restrict planning to these tools (repeatable)
        #[arg(short = 't', long = "tool", value_name = "TOOL")]
        tools: Vec<String>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Print the plan as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Show configuration discovery information
    ShowConfig,
    /// Write the default configuration to ~/.orca/config.toml
    InitConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                description,
                tools,
                priority,
                timeout_secs,
                config,
                json,
                verbose,
            }) => {
                let description = Self::require_description(description)?;
                let timeout = match timeout_secs {
                    Some(0) => return Err("--timeout-secs must be greater than zero".to_string()),
                    Some(secs) => Some(Duration::from_secs(*secs)),
                    None => None,
                };
                Ok(ExecutionMode::Run(RunConfig {
                    description,
                    tools: tools.clone(),
                    priority: *priority,
                    timeout,
                    config_override: config.clone(),
                    json: *json,
                    verbose: *verbose,
                }))
            }
            Some(Commands::Plan {
                description,
                tools,
                config,
                json,
            }) => Ok(ExecutionMode::Plan(PlanConfig {
                description: Self::require_description(description)?,
                tools: tools.clone(),
                config_override: config.clone(),
                json: *json,
            })),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            Some(Commands::InitConfig) => Ok(ExecutionMode::InitConfig),
            None => Err(
                "No command specified. Use 'orca --help' to see available commands.".to_string(),
            ),
        }
    }

    fn require_description(description: &str) -> Result<String, String> {
        let trimmed = description.trim();
        if trimmed.is_empty() {
            return Err("task description must not be empty".to_string());
        }
        Ok(trimmed.to_string())
    }
}
