//! Deployment configuration loaded from a TOML file
//!
//! ```toml
//! [llm]
//! provider = "ollama"
//! model = "gpt-oss:20b"
//!
//! [chat]
//! system_message = "Use a friendly tone."
//! enabled_tools = ["get_current_weather"]
//! terminal_policy = "final_only"
//!
//! [chat.options]
//! reasoning_level = "medium"
//! ```
//!
//! The `[chat]` section provides the options used for requests that carry none.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::ConversationOptions;
use crate::core::{TerminalPolicy, PROVIDER_NAME};
use crate::harmony::options::MODEL;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub chat: ChatConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::Validation("llm.timeout_secs must be positive".into()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model must not be empty".into()));
        }
        Ok(())
    }

    /// Options applied to requests that carry none.
    pub fn default_options(&self) -> ConversationOptions {
        let mut options = ConversationOptions {
            chat_provider_name: PROVIDER_NAME.to_string(),
            system_message: self.chat.system_message.clone(),
            enabled_tool_names: Some(self.chat.enabled_tools.clone()),
            extended_properties: self.chat.options.clone(),
            ..ConversationOptions::default()
        };
        options
            .extended_properties
            .entry(MODEL.key.to_string())
            .or_insert_with(|| Value::String(self.llm.model.clone()));
        options
    }
}

/// Model backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Backend name; only "ollama" is built in
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model used when a request does not name one
    #[serde(default = "default_model")]
    pub model: String,

    /// Overrides `OLLAMA_URL`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Connect timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    MODEL.default_value.to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            endpoint: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Developer instructions
    #[serde(default)]
    pub system_message: String,

    #[serde(default)]
    pub enabled_tools: Vec<String>,

    #[serde(default)]
    pub terminal_policy: TerminalPolicy,

    /// Extended options (`reasoning_level`, `meta_information`, ...)
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
