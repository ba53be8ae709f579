//! Configuration loading, validation, and management for promptloom.
//!
//! Loads configuration from `~/.promptloom/config.toml` with environment
//! variable overrides. Supplies the process-level defaults for context
//! window size and reserved output tokens that budget profiles inherit
//! when an agent is first seen.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.promptloom/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Total model context window, in tokens. Budget profiles created for
    /// new agents inherit this unless overridden per call.
    #[serde(default = "default_context_window")]
    pub context_window_tokens: u32,

    /// Tokens carved out of the window for the model's answer.
    #[serde(default = "default_reserved_output")]
    pub reserved_output_tokens: u32,

    /// Persistence configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_context_window() -> u32 {
    200_000
}
fn default_reserved_output() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("context_window_tokens", &self.context_window_tokens)
            .field("reserved_output_tokens", &self.reserved_output_tokens)
            .field("store", &self.store)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// Persistence backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "sqlite"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Database path for the sqlite backend.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_backend() -> String {
    "sqlite".into()
}
fn default_store_path() -> String {
    "~/.promptloom/promptloom.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.promptloom/config.toml).
    ///
    /// Also checks environment variables:
    /// - `PROMPTLOOM_API_KEY` (highest priority), then `ANTHROPIC_API_KEY`,
    ///   then `OPENAI_API_KEY`
    /// - `PROMPTLOOM_PROVIDER`, `PROMPTLOOM_MODEL`
    /// - `PROMPTLOOM_CONTEXT_WINDOW`, `PROMPTLOOM_RESERVED_OUTPUT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("PROMPTLOOM_API_KEY")
                .ok()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("PROMPTLOOM_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("PROMPTLOOM_MODEL") {
            config.default_model = model;
        }

        if let Ok(window) = std::env::var("PROMPTLOOM_CONTEXT_WINDOW") {
            if let Ok(parsed) = window.parse() {
                config.context_window_tokens = parsed;
            }
        }

        if let Ok(reserved) = std::env::var("PROMPTLOOM_RESERVED_OUTPUT") {
            if let Ok(parsed) = reserved.parse() {
                config.reserved_output_tokens = parsed;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".promptloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.reserved_output_tokens >= self.context_window_tokens {
            return Err(ConfigError::ValidationError(format!(
                "reserved_output_tokens ({}) must be smaller than context_window_tokens ({})",
                self.reserved_output_tokens, self.context_window_tokens
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            context_window_tokens: default_context_window(),
            reserved_output_tokens: default_reserved_output(),
            store: StoreConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.context_window_tokens, 200_000);
        assert!(config.reserved_output_tokens < config.context_window_tokens);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.context_window_tokens, config.context_window_tokens);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn reserved_at_least_window_rejected() {
        let config = AppConfig {
            context_window_tokens: 4096,
            reserved_output_tokens: 4096,
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reserved_output_tokens"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.default_provider, "anthropic");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_provider = "openai"
default_model = "gpt-4o"
context_window_tokens = 128000
reserved_output_tokens = 2048

[providers.openai]
api_url = "https://api.openai.com/v1"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.default_provider, "openai");
        assert_eq!(config.context_window_tokens, 128_000);
        assert_eq!(config.reserved_output_tokens, 2048);
        assert!(config.providers.contains_key("openai"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("anthropic"));
        assert!(toml_str.contains("context_window_tokens"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
