//! Provider-agnostic LLM completion interface.

use async_trait::async_trait;

use crate::error::LlmError;

/// A single system+user completion request.
///
/// The collaborator services (language, synthesis) only need one-shot
/// completions; conversation history is folded into the prompt text.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u64,
    pub temperature: f64,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 1024,
            temperature: 0.3,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Backend-agnostic completion provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// The model identifier this provider talks to.
    fn model_name(&self) -> &str;

    /// Run a completion and return the raw response text.
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_defaults() {
        let req = CompletionRequest::new("sys", "user");
        assert_eq!(req.max_tokens, 1024);
        assert!((req.temperature - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn request_builder_overrides() {
        let req = CompletionRequest::new("sys", "user")
            .with_max_tokens(64)
            .with_temperature(0.0);
        assert_eq!(req.max_tokens, 64);
        assert_eq!(req.temperature, 0.0);
    }
}
