use tracing::warn;

use crate::llm::{ChatApi, ChatMessage, ChatOptions, LlmError};

const MAX_SHRINK_ROUNDS: u32 = 12;

/// Reduces a completion budget by one third, always making progress and never
/// going below 1.
pub fn reduce_by_one_third(current: u32) -> u32 {
    let mut next = current - current / 3;
    if next >= current {
        next = current.saturating_sub(1);
    }
    next.max(1)
}

/// Runs a chat call under the shared shrink-and-retry policy: when the
/// provider rejects the request for context-window reasons, the completion
/// budget is shrunk by one third and the call retried in place, up to a fixed
/// number of rounds. Prompts that fail with no budget left (or with no budget
/// configured at all) escalate unchanged.
pub async fn chat_with_shrink(
    api: &dyn ChatApi,
    messages: &[ChatMessage],
    options: ChatOptions,
) -> Result<String, LlmError> {
    let mut current = options;
    let mut rounds = 0;

    loop {
        match api.chat(messages, current).await {
            Ok(reply) => return Ok(reply),
            Err(LlmError::ContextWindow(detail)) => {
                let Some(budget) = current.max_tokens else {
                    return Err(LlmError::ContextWindow(detail));
                };
                if budget <= 1 || rounds >= MAX_SHRINK_ROUNDS {
                    return Err(LlmError::ContextWindow(detail));
                }
                let next = reduce_by_one_third(budget);
                warn!("context window exceeded, shrinking max_tokens {} -> {}", budget, next);
                current.max_tokens = Some(next);
                rounds += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct ShrinkingFake {
        accept_at_or_below: u32,
        budgets_seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ChatApi for ShrinkingFake {
        async fn chat(&self, _messages: &[ChatMessage], options: ChatOptions) -> Result<String, LlmError> {
            match options.max_tokens {
                Some(budget) => {
                    self.budgets_seen.lock().unwrap().push(budget);
                    if budget <= self.accept_at_or_below {
                        Ok("ok".to_string())
                    } else {
                        Err(LlmError::ContextWindow("maximum context length".to_string()))
                    }
                }
                None => {
                    self.budgets_seen.lock().unwrap().push(0);
                    Err(LlmError::ContextWindow("maximum context length".to_string()))
                }
            }
        }
    }

    #[test]
    fn reduction_is_monotonic_down_to_one() {
        let mut budget = 4096;
        let mut rounds = 0;
        while budget > 1 {
            let next = reduce_by_one_third(budget);
            assert!(next < budget);
            budget = next;
            rounds += 1;
        }
        assert!(rounds < 30);
        assert_eq!(reduce_by_one_third(1), 1);
    }

    #[tokio::test]
    async fn shrinks_until_the_provider_accepts() {
        let fake = ShrinkingFake { accept_at_or_below: 2000, budgets_seen: Mutex::new(Vec::new()) };
        let reply = chat_with_shrink(
            &fake,
            &[ChatMessage::user("hi")],
            ChatOptions::new(0.2, Some(4096)),
        )
        .await
        .unwrap();
        assert_eq!(reply, "ok");

        let seen = fake.budgets_seen.lock().unwrap();
        assert!(seen.len() > 1);
        assert!(seen.windows(2).all(|pair| pair[1] < pair[0]));
    }

    #[tokio::test]
    async fn escalates_when_no_budget_is_configured() {
        let fake = ShrinkingFake { accept_at_or_below: 0, budgets_seen: Mutex::new(Vec::new()) };
        let result = chat_with_shrink(
            &fake,
            &[ChatMessage::user("hi")],
            ChatOptions::new(0.2, None),
        )
        .await;
        assert!(matches!(result, Err(LlmError::ContextWindow(_))));
        assert_eq!(fake.budgets_seen.lock().unwrap().len(), 1);
    }
}
