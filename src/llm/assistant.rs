use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Planning assistant failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AssistantError {
    #[error("Assistant unavailable: {0}")]
    Unavailable(String),
    #[error("Assistant request failed: {0}")]
    RequestFailed(String),
}

/// Language-model collaborator used to draft plans and replacement steps.
///
/// Responses are opaque text; callers parse them defensively.
pub trait PlanningAssistant: Send + Sync {
    fn generate_plan(&self, prompt: String) -> BoxFuture<'_, Result<String, AssistantError>>;

    /// Identifier used in logs
    fn name(&self) -> &'static str;
}

/// Assistant that replays queued responses; errors once the queue is empty
#[derive(Debug, Default)]
pub struct ScriptedAssistant {
    responses: Mutex<VecDeque<Result<String, AssistantError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAssistant {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, AssistantError>>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

impl PlanningAssistant for ScriptedAssistant {
    fn generate_plan(&self, prompt: String) -> BoxFuture<'_, Result<String, AssistantError>> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt);
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        Box::pin(async move {
            next.unwrap_or_else(|| {
                Err(AssistantError::Unavailable(
                    "no scripted response left".to_string(),
                ))
            })
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
