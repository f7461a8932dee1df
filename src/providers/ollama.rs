//! Ollama backend over the raw `/api/generate` endpoint

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::conversation::ModelOptions;

use super::{CompletionProvider, ProviderError, TokenStream};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: &'a ModelOptions,
    /// The prompt is already in the model's own format
    raw: bool,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        model: &str,
        options: &ModelOptions,
    ) -> Result<TokenStream, ProviderError> {
        let request = GenerateRequest {
            model,
            prompt,
            options,
            raw: true,
            stream: true,
        };

        tracing::debug!(model, prompt_len = prompt.len(), "Requesting completion");

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        Ok(Box::pin(ndjson_fragments(response.bytes_stream())))
    }
}

/// Split a byte stream into NDJSON lines and yield each line's fragment.
fn ndjson_fragments<S, B>(bytes: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            buffer.extend_from_slice(chunk?.as_ref());
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(text) = parse_line(&line)? {
                    yield text;
                }
            }
        }
        if let Some(text) = parse_line(&buffer)? {
            yield text;
        }
    }
}

/// One NDJSON line into the fragment it carries, if any.
fn parse_line(line: &[u8]) -> Result<Option<String>, ProviderError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| ProviderError::InvalidResponse(format!("non UTF-8 line: {e}")))?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: GenerateChunk =
        serde_json::from_str(line).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::InvalidResponse(error));
    }

    Ok((!chunk.response.is_empty()).then_some(chunk.response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let line = br#"{"model":"gpt-oss:20b","response":"<|channel|>","done":false}"#;
        assert_eq!(parse_line(line).unwrap().as_deref(), Some("<|channel|>"));

        // final record carries no text
        let line = br#"{"model":"gpt-oss:20b","response":"","done":true,"done_reason":"stop"}"#;
        assert_eq!(parse_line(line).unwrap(), None);

        assert_eq!(parse_line(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_parse_line_errors() {
        assert!(matches!(
            parse_line(br#"{"error":"model not found"}"#),
            Err(ProviderError::InvalidResponse(msg)) if msg == "model not found"
        ));
        assert!(parse_line(b"{truncated").is_err());
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = vec![
            Ok(br#"{"response":"<|channel|>"}"#.to_vec()),
            Ok(b"\n{\"respo".to_vec()),
            Ok("nse\":\"caf\u{e9}\"}\n{\"response\":\"\",\"done\":true}".as_bytes().to_vec()),
        ];
        let fragments: Vec<String> = ndjson_fragments(futures::stream::iter(chunks))
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["<|channel|>", "caf\u{e9}"]);
    }

    #[test]
    fn test_request_shape() {
        let options = ModelOptions {
            temperature: Some(0.2),
            ..ModelOptions::default()
        };
        let request = GenerateRequest {
            model: "gpt-oss:20b",
            prompt: "<|start|>user<|message|>hi<|end|><|start|>assistant",
            options: &options,
            raw: true,
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["raw"], true);
        assert_eq!(json["stream"], true);
        assert!(json["options"]["temperature"].is_number());
        assert!(json["options"].get("top_k").is_none());
    }
}
