pub mod client;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    Connection(String),
    #[error("LLM response error: {0}")]
    Response(String),
    #[error("LLM configuration error: {0}")]
    Config(String),
    #[error("LLM context window exceeded: {0}")]
    ContextWindow(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ChatOptions {
    pub fn new(temperature: f32, max_tokens: Option<u32>) -> Self {
        Self { temperature, max_tokens }
    }

    /// Caps the completion budget, keeping the configured value when it is
    /// already below the ceiling.
    pub fn capped(self, ceiling: u32) -> Self {
        Self {
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens.map_or(ceiling, |t| t.min(ceiling))),
        }
    }
}

/// The single chat capability every agent shares: one blocking completion per
/// call, no streaming. Implemented by the OpenAI-compatible HTTP client and by
/// scripted fakes in tests.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], options: ChatOptions) -> Result<String, LlmError>;
}
