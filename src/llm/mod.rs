//! Chat completion sources
//!
//! The pipeline only needs an incremental stream of text fragments for an
//! ordered message history; [`ChatSource`] is that boundary.

mod openai;

pub use openai::OpenAiChat;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Incremental reply text, ending when the model finishes
pub type TextStream = BoxStream<'static, Result<String>>;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A streaming chat completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier
    pub model: String,
    /// Ordered history, ending with the new user message
    pub messages: Vec<ChatMessage>,
    /// Max tokens to generate
    pub max_tokens: u32,
}

/// Produces a reply as a stream of text fragments
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Open a streaming completion
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started; errors after the
    /// stream has opened are yielded as stream items
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TextStream>;
}
