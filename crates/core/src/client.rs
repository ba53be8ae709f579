//! ChatClient trait — the abstraction over LLM backends.
//!
//! A ChatClient knows how to send an assembled message sequence to an LLM
//! and return the completed response. The request builder never touches this
//! trait; only the dispatch wrapper does, which keeps the budgeting core
//! free of I/O.
//!
//! Implementations: Anthropic native, OpenAI-compatible, custom endpoints.

use crate::error::ClientError;
use crate::message::{ChatMessage, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A complete (non-streaming) response from an LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// The generated response text
    pub response: String,

    /// Token usage statistics, when the provider reports them
    pub usage: Option<TokenUsage>,

    /// Which model actually responded (may differ from requested)
    pub model_used: String,

    /// Which provider produced the response
    pub provider: String,
}

/// The core ChatClient trait.
///
/// Every LLM backend implements this. The dispatch wrapper calls
/// `send_chat()` without knowing which backend is behind it.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// A human-readable name for this client (e.g., "anthropic", "openai").
    fn name(&self) -> &str;

    /// Whether this client is ready to serve requests (credentials present).
    fn is_available(&self) -> bool;

    /// Send an assembled message sequence and get the completed response.
    ///
    /// `max_output_tokens` is the profile's reserved-output ceiling;
    /// implementations must pass it through as the provider's output cap.
    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        max_output_tokens: u32,
        temperature: f32,
    ) -> std::result::Result<ChatCompletion, ClientError>;
}
