//! In-process backend that replays scripted output
//!
//! Each call to `stream_completion` consumes the next script. Prompts and
//! model names are recorded so callers can check what the model would have seen.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::conversation::ModelOptions;
use crate::harmony;

use super::{CompletionProvider, ProviderError, TokenStream};

#[derive(Debug, Clone)]
enum Script {
    Fragments(Vec<String>),
    /// Fragments, then a mid-stream failure
    Broken(Vec<String>, String),
    /// Fragments, then nothing ever again
    Stalled(Vec<String>),
    Refused(String),
}

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<String>>,
    models: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response given as wire text; control tokens become their own fragments.
    pub fn respond(self, wire: &str) -> Self {
        self.push(Script::Fragments(split(wire)))
    }

    /// Queue a response as explicit fragments.
    pub fn respond_fragments<I, S>(self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Script::Fragments(fragments.into_iter().map(Into::into).collect()))
    }

    /// Queue a response that fails after `wire` was streamed.
    pub fn fail_after(self, wire: &str, error: impl Into<String>) -> Self {
        self.push(Script::Broken(split(wire), error.into()))
    }

    /// Queue a response that stalls after `wire` was streamed.
    pub fn stall_after(self, wire: &str) -> Self {
        self.push(Script::Stalled(split(wire)))
    }

    /// Queue a request that fails before streaming anything.
    pub fn refuse(self, error: impl Into<String>) -> Self {
        self.push(Script::Refused(error.into()))
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Model named by each request, in order
    pub fn models(&self) -> Vec<String> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn requests(&self) -> usize {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn push(self, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(script);
        self
    }
}

fn split(wire: &str) -> Vec<String> {
    harmony::fragments(wire).into_iter().map(str::to_string).collect()
}

fn replay(fragments: Vec<String>) -> stream::Iter<std::vec::IntoIter<Result<String, ProviderError>>> {
    stream::iter(fragments.into_iter().map(Ok).collect::<Vec<_>>())
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        model: &str,
        _options: &ModelOptions,
    ) -> Result<TokenStream, ProviderError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(model.to_string());

        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidResponse("no scripted response left".into()))?;

        let stream = match script {
            Script::Fragments(fragments) => replay(fragments).boxed(),
            Script::Broken(fragments, error) => replay(fragments)
                .chain(stream::once(async move { Err(ProviderError::InvalidResponse(error)) }))
                .boxed(),
            Script::Stalled(fragments) => replay(fragments).chain(stream::pending()).boxed(),
            Script::Refused(error) => return Err(ProviderError::InvalidResponse(error)),
        };
        Ok(stream)
    }
}
