//! Shared test fakes for the LLM and executor seams.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatApi, ChatMessage, ChatOptions, LlmError};

/// Chat fake that replays a fixed list of replies and records every prompt.
pub struct ScriptedChat {
    replies: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().rev().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, index: usize) -> String {
        self.prompts.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ChatApi for ScriptedChat {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: ChatOptions,
    ) -> Result<String, LlmError> {
        let prompt = messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);
        self.replies
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| LlmError::Response("script exhausted".to_string()))
    }
}

/// Executor fake that replays scripted envelopes.
pub struct ScriptedExecutor {
    outcomes: Mutex<Vec<crate::executor::ExecutionEnvelope>>,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(outcomes: Vec<crate::executor::ExecutionEnvelope>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
            executed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl crate::executor::ExecuteSql for ScriptedExecutor {
    async fn execute_envelope(&self, sql: &str) -> crate::executor::ExecutionEnvelope {
        self.executed.lock().unwrap().push(sql.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| crate::executor::ExecutionEnvelope::failed(sql, "script exhausted".to_string()))
    }
}
