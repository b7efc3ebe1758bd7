use super::types::*;
use crate::plan::{ParameterMap, ToolCategory};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Dry-run backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub tools: Vec<String>,
    /// Wall-clock time each simulated call takes
    pub latency_ms: u64,
    /// Probability that a call fails with a transient network error
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tools: super::DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect(),
            latency_ms: 50,
            failure_rate: 0.0,
        }
    }
}

/// Output a well-behaved tool of this family would return
pub fn simulated_output(tool: &str, parameters: &ParameterMap) -> Value {
    let text = |key: &str| parameters.get(key).and_then(Value::as_str).unwrap_or("");
    match ToolCategory::of(tool) {
        ToolCategory::Search => {
            let query = if text("query").is_empty() {
                text("research_query")
            } else {
                text("query")
            };
            json!({
                "success": true,
                "query": query,
                "results": [
                    {"title": format!("Result for {}", query), "url": "https://example.org/1", "snippet": "..."},
                    {"title": format!("Background on {}", query), "url": "https://example.org/2", "snippet": "..."}
                ]
            })
        }
        ToolCategory::FileRead => json!({
            "success": true,
            "path": text("path"),
            "content": "",
            "bytes": 0
        }),
        ToolCategory::FileWrite => json!({
            "success": true,
            "path": text("path"),
            "bytes_written": text("content").len()
        }),
        ToolCategory::Shell => json!({
            "success": true,
            "stdout": format!("$ {}", text("command")),
            "stderr": "",
            "exit_code": 0
        }),
        ToolCategory::Browser => json!({
            "success": true,
            "url": text("url"),
            "content": "<html></html>"
        }),
        _ => json!({
            "success": true,
            "output": format!("{} completed", tool)
        }),
    }
}

/// Backend that pretends to run tools, for the CLI and demos
#[derive(Debug, Clone, Default)]
pub struct SimulatedToolExecutor {
    config: SimulationConfig,
}

impl SimulatedToolExecutor {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ToolExecutor for SimulatedToolExecutor {
    async fn execute(
        &self,
        tool: &str,
        parameters: &ParameterMap,
        options: ToolOptions,
    ) -> Result<Value, ToolError> {
        if !self.config.tools.iter().any(|t| t == tool) {
            return Err(ToolError::new(
                ToolErrorKind::NotFound,
                format!("tool '{}' not found", tool),
            ));
        }

        debug!(task_id = %options.task_id, step_id = %options.step_id, tool, "Simulating tool call");
        let chunk = Duration::from_millis(self.config.latency_ms / 4);
        for quarter in 1..=4 {
            tokio::time::sleep(chunk).await;
            options.progress.report(quarter as f64 / 4.0);
        }

        if self.config.failure_rate > 0.0 && rand::random::<f64>() < self.config.failure_rate {
            return Err(ToolError::network("simulated connection reset"));
        }
        Ok(simulated_output(tool, parameters))
    }

    fn available_tools(&self) -> Vec<String> {
        self.config.tools.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_call_reports_progress() {
        let executor = SimulatedToolExecutor::default();
        let options = ToolOptions::new("t", "s", Duration::from_secs(1));
        let progress = options.progress.clone();

        let mut parameters = ParameterMap::new();
        parameters.insert("command".into(), json!("ls"));
        let output = executor.execute("shell", &parameters, options).await.unwrap();

        assert_eq!(output["exit_code"], 0);
        assert_eq!(output["stdout"], "$ ls");
        assert_eq!(progress.progress(), 1.0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let executor = SimulatedToolExecutor::default();
        let options = ToolOptions::new("t", "s", Duration::from_secs(1));
        let err = executor
            .execute("teleport", &ParameterMap::new(), options)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);
    }

    #[test]
    fn test_search_output_uses_either_query_key() {
        let mut parameters = ParameterMap::new();
        parameters.insert("research_query".into(), json!("rust"));
        let output = simulated_output("web_search", &parameters);
        assert_eq!(output["query"], "rust");
        assert!(output["results"].as_array().is_some_and(|r| !r.is_empty()));
    }
}
