//! Deterministic provider used by tests and offline smoke runs.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ChatMessage, ChatOutcome, LlmProvider, TokenUsage};
use crate::errors::EngineError;

/// One scripted reply: either model text or a transport failure.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(String),
}

/// Serves scripted replies in order and records every prompt it receives.
/// When the script runs dry it answers with a terminal `taskComplete`.
pub struct MockLlmProvider {
    replies: Mutex<VecDeque<MockReply>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    usage: TokenUsage,
}

impl MockLlmProvider {
    pub fn new(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
            usage: TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 40,
            },
        }
    }

    pub fn empty() -> Self {
        Self::new([])
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// All prompts seen so far, in call order.
    pub fn recorded_prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<ChatOutcome, EngineError> {
        self.prompts.lock().push(messages.to_vec());
        let next = self.replies.lock().pop_front();
        match next {
            Some(MockReply::Text(text)) => Ok(ChatOutcome {
                text,
                usage: self.usage,
            }),
            Some(MockReply::Error(message)) => Err(EngineError::llm(message)),
            None => Ok(ChatOutcome {
                text: r#"{"taskComplete": true, "result": "mock task finished"}"#.to_string(),
                usage: self.usage,
            }),
        }
    }

    fn model(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replies_come_back_in_order() {
        let provider = MockLlmProvider::new([
            MockReply::Error("fetch failed".to_string()),
            MockReply::Text("{\"ok\": true}".to_string()),
        ]);
        let first = provider.chat(&[ChatMessage::user("hi")], 0.2).await;
        assert!(first.is_err());
        let second = provider.chat(&[ChatMessage::user("hi")], 0.2).await.unwrap();
        assert_eq!(second.text, "{\"ok\": true}");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn dry_script_falls_back_to_task_complete() {
        let provider = MockLlmProvider::empty();
        let outcome = provider.chat(&[ChatMessage::user("hi")], 0.2).await.unwrap();
        assert!(outcome.text.contains("taskComplete"));
    }
}
