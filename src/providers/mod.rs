//! Model backends
//!
//! A backend takes a fully compiled prompt and streams back raw output
//! fragments. Control tokens arrive as their own fragments; everything else
//! is literal text.

mod ollama;
mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::config::client::LlmConfig;
use crate::config::Config;
use crate::conversation::ModelOptions;

pub use ollama::OllamaProvider;
pub use scripted::ScriptedProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Raw output fragments, in arrival order
pub type TokenStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start a completion for `prompt`. Dropping the stream aborts the request.
    async fn stream_completion(
        &self,
        prompt: &str,
        model: &str,
        options: &ModelOptions,
    ) -> Result<TokenStream, ProviderError>;
}

/// Build the backend named in the `[llm]` section.
pub fn from_config(llm: &LlmConfig, config: &Config) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    match llm.provider.to_lowercase().as_str() {
        "ollama" => {
            let url = llm
                .endpoint
                .clone()
                .unwrap_or_else(|| config.ollama_url.clone());
            let provider = OllamaProvider::new(url, Duration::from_secs(llm.timeout_secs))?;
            Ok(Arc::new(provider))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = Config::default();
        let provider = from_config(&LlmConfig::default(), &config).unwrap();
        assert_eq!(provider.name(), "ollama");

        let llm = LlmConfig {
            provider: "openai".into(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            from_config(&llm, &config),
            Err(ProviderError::UnknownProvider(name)) if name == "openai"
        ));
    }
}
