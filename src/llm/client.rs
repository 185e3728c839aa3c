use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::llm::{ChatApi, ChatMessage, ChatOptions, LlmError};
use crate::store::LlmSettings;

const MAX_TRANSIENT_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// OpenAI-compatible chat completions client.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        if settings.base_url.is_empty() {
            return Err(LlmError::Config("base_url is required".to_string()));
        }
        if settings.model_name.is_empty() {
            return Err(LlmError::Config("model_name is required".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        let endpoint = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            api_key: settings.api_key.clone(),
            model: settings.model_name.clone(),
        })
    }

    fn is_context_window_message(body: &str) -> bool {
        let lower = body.to_lowercase();
        lower.contains("context_length_exceeded")
            || lower.contains("contextwindowexceedederror")
            || lower.contains("maximum context length")
            || (lower.contains("max_tokens") && lower.contains("too large"))
    }

    async fn send_once(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 && Self::is_context_window_message(&body) {
                return Err(LlmError::ContextWindow(body));
            }
            return Err(LlmError::Response(format!("status {}: {}", status, body)));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Response(e.to_string()))?;

        let reply = completion
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| LlmError::Response("no choices in response".to_string()))?;

        Ok(reply)
    }

    fn is_transient(error: &LlmError) -> bool {
        match error {
            LlmError::Connection(_) => true,
            LlmError::Response(message) => {
                message.starts_with("status 429")
                    || message.starts_with("status 500")
                    || message.starts_with("status 502")
                    || message.starts_with("status 503")
                    || message.starts_with("status 504")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ChatApi for OpenAiChatClient {
    async fn chat(&self, messages: &[ChatMessage], options: ChatOptions) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(messages, options).await {
                Ok(reply) => return Ok(reply),
                Err(error) if Self::is_transient(&error) && attempt < MAX_TRANSIENT_RETRIES => {
                    let delay = Duration::from_millis(BACKOFF_BASE_MS << attempt);
                    warn!("transient LLM error, retrying in {:?}: {}", delay, error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_heuristics() {
        assert!(OpenAiChatClient::is_context_window_message(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(OpenAiChatClient::is_context_window_message(
            "error code: context_length_exceeded"
        ));
        assert!(OpenAiChatClient::is_context_window_message(
            "max_tokens is too large: 90000"
        ));
        assert!(!OpenAiChatClient::is_context_window_message("invalid api key"));
    }

    #[test]
    fn transient_statuses_are_retryable() {
        assert!(OpenAiChatClient::is_transient(&LlmError::Response(
            "status 429 Too Many Requests: slow down".to_string()
        )));
        assert!(OpenAiChatClient::is_transient(&LlmError::Connection("timed out".to_string())));
        assert!(!OpenAiChatClient::is_transient(&LlmError::Response(
            "status 401 Unauthorized: bad key".to_string()
        )));
        assert!(!OpenAiChatClient::is_transient(&LlmError::ContextWindow("too big".to_string())));
    }
}
