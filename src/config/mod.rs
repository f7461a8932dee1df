//! Application configuration

pub mod client;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use client::{ChatConfig, ClientConfig, ConfigError, LlmConfig};

/// Process settings read from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ollama_url: String,
    /// Directory holding the conversation database
    pub data_dir: PathBuf,
    /// Optional TOML client configuration
    pub client_config: Option<PathBuf>,
    pub max_tool_rounds: usize,
    /// Follow-up requests allowed when the model stops before a final turn
    pub max_continuations: usize,
    /// Capacity of the per-exchange chunk channel
    pub chunk_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            ollama_url: "http://localhost:11434".into(),
            data_dir: PathBuf::from("./data"),
            client_config: None,
            max_tool_rounds: 10,
            max_continuations: 10,
            chunk_buffer: 64,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parsed("PORT").unwrap_or(defaults.port),
            ollama_url: env::var("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            data_dir: env::var("HARMONY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            client_config: env::var("HARMONY_CONFIG").ok().map(PathBuf::from),
            max_tool_rounds: parsed("MAX_TOOL_ROUNDS").unwrap_or(defaults.max_tool_rounds),
            max_continuations: parsed("MAX_CONTINUATIONS").unwrap_or(defaults.max_continuations),
            chunk_buffer: parsed::<usize>("CHUNK_BUFFER")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.chunk_buffer),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("harmony.db")
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
