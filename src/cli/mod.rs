//! Command line interface: argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, Commands, ExecutionMode, PlanConfig, RunConfig};
pub use config::{ConfigDiscovery, LoggingConfig, OrcaConfig};
