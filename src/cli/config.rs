//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. `$ORCA_CONFIG`
//! 2. Current directory: ./orca.toml or ./.orca/config.toml
//! 3. User config: ~/.orca/config.toml
//! 4. System config: /etc/orca/config.toml
//! 5. Built-in defaults

use crate::env;
use crate::execution::EngineConfig;
use crate::orchestrator::{OrchestratorConfig, TaskOrchestrator};
use crate::planning::{HierarchicalPlanningEngine, PlanningConfig, RuleBasedAdapter};
use crate::resources::{ResourceManager, ResourceManagerConfig};
use crate::tools::{SimulationConfig, ToolExecutor};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: env::DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Everything the `orca` binary can be configured with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrcaConfig {
    pub orchestrator: OrchestratorConfig,
    pub planning: PlanningConfig,
    pub execution: EngineConfig,
    pub resources: ResourceManagerConfig,
    /// Settings of the simulated tool backend
    pub tools: SimulationConfig,
    pub logging: LoggingConfig,
}

impl OrcaConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid orca configuration")
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    /// Orchestrator wired from every section, running tools on `tools`
    pub fn build_orchestrator(&self, tools: Arc<dyn ToolExecutor>) -> TaskOrchestrator {
        let adapter = Arc::new(RuleBasedAdapter::new(self.planning.adaptation.clone()));
        TaskOrchestrator::new(self.orchestrator.clone(), tools)
            .with_planner(HierarchicalPlanningEngine::new(self.planning.clone()))
            .with_engine_config(self.execution.clone())
            .with_adapter(adapter)
            .with_resources(ResourceManager::new(self.resources.clone()))
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the first file of the hierarchy, or defaults if there is none
    pub fn discover_config() -> Result<(OrcaConfig, Option<PathBuf>)> {
        match Self::find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                let config = OrcaConfig::from_toml_file(&path)?;
                Ok((config, Some(path)))
            }
            None => {
                info!("No configuration file found, using defaults");
                Ok((OrcaConfig::default(), None))
            }
        }
    }

    /// Load `explicit` if given, otherwise discover
    pub fn load(explicit: Option<&Path>) -> Result<(OrcaConfig, Option<PathBuf>)> {
        match explicit {
            Some(path) => {
                info!("Loading configuration override from: {:?}", path);
                Ok((OrcaConfig::from_toml_file(path)?, Some(path.to_path_buf())))
            }
            None => Self::discover_config(),
        }
    }

    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }
        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Candidates in priority order for the current process
    pub fn config_candidates() -> Vec<PathBuf> {
        let explicit = std::env::var_os(env::CONFIG_ENV_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let current_dir = std::env::current_dir().ok();
        Self::candidates_for(explicit, current_dir.as_deref(), env::home_dir().as_deref())
    }

    pub fn candidates_for(
        explicit: Option<PathBuf>,
        current_dir: Option<&Path>,
        home_dir: Option<&Path>,
    ) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        candidates.extend(explicit);
        if let Some(current_dir) = current_dir {
            candidates.push(env::local_config_toml_path(current_dir));
            candidates.push(env::local_config_file_path(current_dir));
        }
        if let Some(home_dir) = home_dir {
            candidates.push(env::user_config_file_path(home_dir));
        }
        #[cfg(unix)]
        candidates.push(env::system_config_file_path());
        candidates
    }

    /// Write the defaults to ~/.orca/config.toml unless a file is already there
    pub fn create_default_user_config() -> Result<PathBuf> {
        let home_dir = env::home_dir().context("could not determine home directory")?;
        Self::create_default_config_in(&home_dir)
    }

    pub fn create_default_config_in(home_dir: &Path) -> Result<PathBuf> {
        let config_dir = env::user_config_dir_path(home_dir);
        let config_path = env::user_config_file_path(home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).with_context(|| {
                format!("failed to create config directory {}", config_dir.display())
            })?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if config_path.exists() {
            warn!("Configuration file already exists: {:?}", config_path);
        } else {
            OrcaConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        }
        Ok(config_path)
    }

    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "EXISTS"
            } else if candidate.exists() {
                "NOT A FILE"
            } else {
                "NOT FOUND"
            };
            println!("  {}. {} - {}", i + 1, candidate.display(), status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {}", found.display()),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrcaConfig::from_toml_str(
            r#"
            [orchestrator]
            max_concurrent_tasks = 2

            [resources]
            cpu_max = 8.0

            [logging]
            level = "orca=trace"
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.max_concurrent_tasks, 2);
        assert_eq!(config.orchestrator.throttle_cooldown_ms, 30_000);
        assert_eq!(config.resources.cpu_max, 8.0);
        assert_eq!(config.resources.memory_max, 100.0);
        assert_eq!(config.logging.level, "orca=trace");
        assert!(config.planning.cache_enabled);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let err = OrcaConfig::from_toml_str("[orchestrator]\nmax_concurrent_tasks = \"many\"")
            .unwrap_err();
        assert!(err.to_string().contains("invalid orca configuration"));
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("orca.toml");

        let mut original = OrcaConfig::default();
        original.execution.max_parallel_steps = 7;
        original.tools.latency_ms = 5;
        original.to_toml_file(&config_path).unwrap();

        let loaded = OrcaConfig::from_toml_file(&config_path).unwrap();
        assert_eq!(loaded.execution.max_parallel_steps, 7);
        assert_eq!(loaded.tools.latency_ms, 5);
        assert_eq!(loaded.logging, original.logging);
    }

    #[test]
    fn test_candidate_order() {
        let candidates = ConfigDiscovery::candidates_for(
            Some(PathBuf::from("/explicit/orca.toml")),
            Some(Path::new("/work")),
            Some(Path::new("/home/user")),
        );

        assert_eq!(candidates[0], Path::new("/explicit/orca.toml"));
        assert_eq!(candidates[1], Path::new("/work/orca.toml"));
        assert_eq!(candidates[2], Path::new("/work/.orca/config.toml"));
        assert_eq!(candidates[3], Path::new("/home/user/.orca/config.toml"));
    }

    #[test]
    fn test_create_default_config_is_idempotent() {
        let home = TempDir::new().unwrap();
        let path = ConfigDiscovery::create_default_config_in(home.path()).unwrap();
        assert!(path.is_file());

        fs::write(&path, "[orchestrator]\nmax_concurrent_tasks = 9\n").unwrap();
        ConfigDiscovery::create_default_config_in(home.path()).unwrap();
        let kept = OrcaConfig::from_toml_file(&path).unwrap();
        assert_eq!(kept.orchestrator.max_concurrent_tasks, 9);
    }

    #[test]
    #[serial]
    fn test_env_override_wins_discovery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[orchestrator]\nmax_concurrent_tasks = 3\n").unwrap();

        unsafe { std::env::set_var(env::CONFIG_ENV_VAR, &path) };
        let found = ConfigDiscovery::find_config_file();
        let loaded = ConfigDiscovery::discover_config();
        unsafe { std::env::remove_var(env::CONFIG_ENV_VAR) };

        assert_eq!(found.as_deref(), Some(path.as_path()));
        let (config, source) = loaded.unwrap();
        assert_eq!(config.orchestrator.max_concurrent_tasks, 3);
        assert_eq!(source, Some(path));
    }

    #[tokio::test]
    async fn test_build_orchestrator_applies_sections() {
        let mut config = OrcaConfig::default();
        config.orchestrator.max_concurrent_tasks = 2;
        config.resources.cpu_max = 10.0;
        config.planning.cache_enabled = false;

        let tools = Arc::new(crate::tools::SimulatedToolExecutor::new(config.tools.clone()));
        let orchestrator = config.build_orchestrator(tools);

        assert_eq!(orchestrator.config().max_concurrent_tasks, 2);
        assert_eq!(orchestrator.admission_limit(), 2);
        assert!(!orchestrator.planner().config().cache_enabled);
        assert_eq!(
            orchestrator
                .resources()
                .config()
                .max_for(crate::resources::ResourceType::Cpu),
            Some(10.0)
        );
    }
}
