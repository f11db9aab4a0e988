//! The chat model collaborator (§6: "LLM provider (chat)").
//!
//! A single external, OpenAI-compatible HTTP endpoint, called either for
//! a full JSON-structured response (planner classification, re-rank
//! scoring, query expansion, memory summarisation) or for a token stream
//! (final answer synthesis).

pub mod external;
pub mod streaming;

pub use external::ExternalChatProvider;
pub use streaming::TokenStream;

use crate::error::RagError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    /// When set, the provider asks the model for a JSON object matching
    /// this schema (or, for providers without native structured output,
    /// instructs it via the prompt) rather than free text.
    pub json_schema: Option<serde_json::Value>,
    pub deadline: std::time::Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            json_schema: None,
            deadline: std::time::Duration::from_secs(30),
        }
    }
}

/// A chat-model collaborator. Every call that needs the answer in one
/// shot (planner, re-ranker, query expansion, memory compression) uses
/// `generate`; the final answer synthesis uses `generate_stream`.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<String, RagError>;

    async fn generate_stream(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<TokenStream, RagError>;
}
