use super::simulated::simulated_output;
use super::types::*;
use crate::plan::ParameterMap;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// One recorded call
#[derive(Debug, Clone)]
pub struct MockCall {
    pub tool: String,
    pub step_id: String,
    pub task_id: String,
    pub parameters: ParameterMap,
    pub timeout: Duration,
}

/// Scripted tool backend.
///
/// Responses are consumed per step id first, then per tool; once a script
/// runs dry the call succeeds with a well-shaped default output.
#[derive(Debug, Default)]
pub struct MockToolExecutor {
    tools: Vec<String>,
    step_scripts: Mutex<HashMap<String, VecDeque<Result<Value, ToolError>>>>,
    tool_scripts: Mutex<HashMap<String, VecDeque<Result<Value, ToolError>>>>,
    step_delays: Mutex<HashMap<String, Duration>>,
    delay: Duration,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockToolExecutor {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Every call sleeps this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue responses for calls made on behalf of `step_id`
    pub fn script_step<I>(&self, step_id: &str, responses: I)
    where
        I: IntoIterator<Item = Result<Value, ToolError>>,
    {
        lock(&self.step_scripts)
            .entry(step_id.to_string())
            .or_default()
            .extend(responses);
    }

    /// Queue responses for calls to `tool`
    pub fn script_tool<I>(&self, tool: &str, responses: I)
    where
        I: IntoIterator<Item = Result<Value, ToolError>>,
    {
        lock(&self.tool_scripts)
            .entry(tool.to_string())
            .or_default()
            .extend(responses);
    }

    /// Make every call for `step_id` fail with `error`
    pub fn fail_step_always(&self, step_id: &str, error: ToolError, times: usize) {
        self.script_step(step_id, std::iter::repeat_n(Err(error), times));
    }

    pub fn delay_step(&self, step_id: &str, delay: Duration) {
        lock(&self.step_delays).insert(step_id.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for_step(&self, step_id: &str) -> Vec<MockCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.step_id == step_id)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of calls that were in flight at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, step_id: &str, tool: &str) -> Option<Result<Value, ToolError>> {
        if let Some(response) = lock(&self.step_scripts)
            .get_mut(step_id)
            .and_then(VecDeque::pop_front)
        {
            return Some(response);
        }
        lock(&self.tool_scripts)
            .get_mut(tool)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(
        &self,
        tool: &str,
        parameters: &ParameterMap,
        options: ToolOptions,
    ) -> Result<Value, ToolError> {
        lock(&self.calls).push(MockCall {
            tool: tool.to_string(),
            step_id: options.step_id.clone(),
            task_id: options.task_id.clone(),
            parameters: parameters.clone(),
            timeout: options.timeout,
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);

        let delay = lock(&self.step_delays)
            .get(&options.step_id)
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        options.progress.report(1.0);

        self.next_response(&options.step_id, tool)
            .unwrap_or_else(|| {
                if self.tools.iter().any(|t| t == tool) {
                    Ok(simulated_output(tool, parameters))
                } else {
                    Err(ToolError::new(
                        ToolErrorKind::NotFound,
                        format!("tool '{}' not found", tool),
                    ))
                }
            })
    }

    fn available_tools(&self) -> Vec<String> {
        self.tools.clone()
    }
}
