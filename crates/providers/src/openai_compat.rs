//! OpenAI-compatible client implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Fireworks AI,
//! and any endpoint exposing `/chat/completions` with Bearer auth.

use async_trait::async_trait;
use promptloom_core::client::{ChatClient, ChatCompletion};
use promptloom_core::error::ClientError;
use promptloom_core::message::{ChatMessage, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// An OpenAI-compatible LLM client.
pub struct OpenAiCompatClient {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Create a new OpenAI-compatible client.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    /// Create an OpenAI client (convenience constructor).
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key, model)
    }

    /// Create an Ollama client (convenience constructor).
    pub fn ollama(base_url: Option<&str>, model: impl Into<String>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
            model,
        )
    }

    fn to_api_messages(messages: &[ChatMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                    // The builder ships tool output as a labeled context
                    // block, so plain "user" keeps compatibility with
                    // endpoints that demand tool_call_id on "tool" roles.
                    Role::Tool => "user".into(),
                },
                content: m.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
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
        let url = format!("{}/chat/completions", self.base_url);

        let body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(messages),
            "temperature": temperature,
            "max_tokens": max_output_tokens,
            "stream": false,
        });

        debug!(provider = %self.name, model = %self.model, "sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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
                "Invalid API key or insufficient permissions".into(),
            ));
        }
        if status == 404 {
            return Err(ClientError::ModelNotFound(self.model.clone()));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "provider returned error");
            return Err(ClientError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ClientError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        Ok(ChatCompletion {
            response: choice.message.content.unwrap_or_default(),
            usage: api_response.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            model_used: api_response.model,
            provider: self.name.clone(),
        })
    }
}

// --- OpenAI API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
