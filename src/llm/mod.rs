//! The chat capability the engine consumes.
//!
//! The engine never sees a provider wire format; it sees
//! `chat(messages) -> text + token counts`, with optional image attachments
//! when the provider advertises vision.

mod json;
mod mock;
mod openai;

pub use json::extract_json_object;
pub use mock::{MockLlmProvider, MockReply};
pub use openai::{OpenAiConfig, OpenAiProvider};

use async_trait::async_trait;

use crate::errors::EngineError;

/// Message role in a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
}

/// One prompt message; `images` carries base64 screenshot payloads for
/// vision-capable providers.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub images: Vec<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, base64_png: impl Into<String>) -> Self {
        self.images.push(base64_png.into());
        self
    }
}

/// Token accounting for a single chat call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Result of a chat call: the raw text plus usage.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<ChatOutcome, EngineError>;

    /// Whether image attachments are honored.
    fn supports_vision(&self) -> bool {
        false
    }

    fn model(&self) -> &str;
}
