//! Client router — selects the correct LLM client based on config.
//!
//! Handles client creation, registration by provider name, and lookup.

use crate::anthropic::AnthropicClient;
use crate::openai_compat::OpenAiCompatClient;
use promptloom_core::client::ChatClient;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes dispatch requests to the correct client.
pub struct ClientRouter {
    clients: HashMap<String, Arc<dyn ChatClient>>,
    default_provider: String,
}

impl ClientRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            clients: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a client under a provider name.
    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn ChatClient>) {
        self.clients.insert(name.into(), client);
    }

    /// Get the default client.
    pub fn default_client(&self) -> Option<Arc<dyn ChatClient>> {
        self.clients.get(&self.default_provider).cloned()
    }

    /// Get a specific client by provider name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatClient>> {
        self.clients.get(name).cloned()
    }

    /// Get the client for a provider name, falling back to the default.
    pub fn resolve(&self, provider: &str) -> Option<Arc<dyn ChatClient>> {
        self.get(provider).or_else(|| self.default_client())
    }

    /// List all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        self.clients.keys().map(|s| s.as_str()).collect()
    }
}

/// Build clients from configuration.
pub fn build_from_config(config: &promptloom_config::AppConfig) -> ClientRouter {
    let mut router = ClientRouter::new(&config.default_provider);

    for (name, provider_config) in &config.providers {
        let api_key = provider_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();

        let base_url = provider_config
            .api_url
            .clone()
            .unwrap_or_else(|| default_base_url(name));

        let model = provider_config
            .default_model
            .clone()
            .unwrap_or_else(|| config.default_model.clone());

        let client: Arc<dyn ChatClient> = if name == "anthropic" {
            let mut c = AnthropicClient::new(&api_key, &model);
            if provider_config.api_url.is_some() {
                c = c.with_base_url(&base_url);
            }
            Arc::new(c)
        } else {
            Arc::new(OpenAiCompatClient::new(name, &base_url, &api_key, &model))
        };

        router.register(name.clone(), client);
    }

    // Ensure the default provider exists even if not explicitly configured.
    if router.get(&config.default_provider).is_none() {
        let api_key = config.api_key.clone().unwrap_or_default();
        let base_url = default_base_url(&config.default_provider);

        let client: Arc<dyn ChatClient> = if config.default_provider == "anthropic" {
            Arc::new(AnthropicClient::new(&api_key, &config.default_model))
        } else {
            Arc::new(OpenAiCompatClient::new(
                &config.default_provider,
                &base_url,
                &api_key,
                &config.default_model,
            ))
        };

        router.register(config.default_provider.clone(), client);
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "anthropic" => "https://api.anthropic.com".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
