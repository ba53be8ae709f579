//! Anthropic native client implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy):
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field
//!
//! Streaming is deliberately not implemented; the dispatch layer only needs
//! complete responses.

use async_trait::async_trait;
use promptloom_core::client::{ChatClient, ChatCompletion};
use promptloom_core::error::ClientError;
use promptloom_core::message::{ChatMessage, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic native Messages API client.
pub struct AnthropicClient {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    /// Create a new Anthropic client for the given model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Extract system messages from the sequence.
    /// Anthropic takes the system prompt as a top-level field, not a message.
    fn extract_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut non_system: Vec<&ChatMessage> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                _ => non_system.push(msg),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system, non_system)
    }

    /// Convert messages to the Messages API wire format. Tool outputs
    /// re-enter the conversation as user-side content.
    fn to_api_messages(messages: &[&ChatMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|msg| ApiMessage {
                role: match msg.role {
                    Role::Assistant => "assistant".into(),
                    Role::User | Role::Tool | Role::System => "user".into(),
                },
                content: msg.content.clone(),
            })
            .collect()
    }

    fn response_to_completion(&self, resp: ApiResponse) -> ChatCompletion {
        let text = resp
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                ResponseContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        ChatCompletion {
            response: text,
            usage: Some(TokenUsage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
            }),
            model_used: resp.model,
            provider: self.name.clone(),
        }
    }
}

#[async_trait]
impl ChatClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        max_output_tokens: u32,
        temperature: f32,
    ) -> Result<ChatCompletion, ClientError> {
        let url = format!("{}/v1/messages", self.base_url);
        let (system, non_system) = Self::extract_system(messages);
        let api_messages = Self::to_api_messages(&non_system);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": max_output_tokens,
            "temperature": temperature,
        });

        if let Some(ref sys) = system {
            body["system"] = serde_json::json!(sys);
        }

        debug!(provider = "anthropic", model = %self.model, "sending completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout(e.to_string())
                } else {
                    ClientError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ClientError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if status == 401 || status == 403 {
            return Err(ClientError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status == 404 {
            return Err(ClientError::ModelNotFound(self.model.clone()));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ClientError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_resp: ApiResponse = response.json().await.map_err(|e| ClientError::ApiError {
            status_code: 200,
            message: format!("Failed to parse Anthropic response: {e}"),
        })?;

        Ok(self.response_to_completion(api_resp))
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}
