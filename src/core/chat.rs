//! Chat engine with tool calling orchestration
//!
//! One exchange runs the model until it produces a terminal turn:
//! 1. Compile the conversation into a prompt and open a completion stream
//! 2. Classify fragments into turns, forwarding visible content as it arrives
//! 3. On a tool call, dispatch it, record call and outcome, and go again
//! 4. On a terminal turn, finish; when the stream stops after turns that do
//!    not end the exchange, ask the model again for what comes next
//!
//! Every exchange ends with exactly one `is_done` chunk.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::{
    ContentKind, Conversation, ConversationOptions, EndToken, OptionDescriptor, Role, StreamChunk,
    ToolContext, Turn,
};
use crate::harmony::options::{ALL as HARMONY_OPTIONS, MODEL};
use crate::harmony::{
    channels, fragments, roles, tokens, ChannelKind, Classifier, ClassifierEvent, CompletedMessage,
    HistoryCompiler, MessageHeader,
};
use crate::providers::CompletionProvider;
use crate::tools::{FailureKind, ToolOutcome, ToolRegistry};

use super::memory::{ConversationStore, StoreError};

/// Name under which the engine advertises itself and its options
pub const PROVIDER_NAME: &str = "harmony";

/// Which turns end an exchange besides tool calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalPolicy {
    /// Only `final` turns and `<|return|>`
    #[default]
    FinalOnly,
    /// Also `analysis` and plain `commentary` turns
    AnyNonTool,
}

impl TerminalPolicy {
    fn is_terminal(self, kind: ChannelKind) -> bool {
        match self {
            TerminalPolicy::FinalOnly => kind == ChannelKind::Final,
            TerminalPolicy::AnyNonTool => kind != ChannelKind::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_tool_rounds: usize,
    /// Follow-up requests after streams that closed on a non-terminal turn
    pub max_continuations: usize,
    pub terminal_policy: TerminalPolicy,
    pub chunk_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            max_continuations: 10,
            terminal_policy: TerminalPolicy::FinalOnly,
            chunk_buffer: 64,
        }
    }
}

/// Errors from the chat engine
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Conversation {0} already has an exchange in progress")]
    Busy(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// The core chat engine
pub struct ChatEngine {
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
    settings: EngineSettings,
    active: Arc<Mutex<HashSet<String>>>,
}

impl ChatEngine {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            settings: EngineSettings::default(),
            active: Arc::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn store(&self) -> &dyn ConversationStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Options understood by this engine
    pub fn option_descriptors(&self) -> &'static [OptionDescriptor] {
        &HARMONY_OPTIONS
    }

    /// Run one exchange on `conversation`, appending every turn it produces.
    ///
    /// Model and tool level problems never surface as errors here; they end
    /// up as turns or chunks. The last chunk sent is always `is_done`.
    pub async fn run_exchange(
        &self,
        conversation: &mut Conversation,
        options: &ConversationOptions,
        chunks: &mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) {
        self.drive(conversation, options, chunks, cancel).await;
        // a consumer that went away no longer needs it
        let _ = chunks.send(StreamChunk::done()).await;
    }

    /// Append `user_turn` to the stored conversation and start an exchange.
    pub async fn send_message(
        self: Arc<Self>,
        conversation_id: &str,
        user_turn: Turn,
        options: ConversationOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ChatError> {
        self.start(conversation_id, Some(user_turn), options, cancel).await
    }

    /// Continue the stored conversation (e.g. after an interrupted exchange).
    pub async fn continue_chat(
        self: Arc<Self>,
        conversation_id: &str,
        options: ConversationOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ChatError> {
        self.start(conversation_id, None, options, cancel).await
    }

    async fn start(
        self: Arc<Self>,
        conversation_id: &str,
        user_turn: Option<Turn>,
        options: ConversationOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ChatError> {
        let guard = InFlight::acquire(&self.active, conversation_id)
            .ok_or_else(|| ChatError::Busy(conversation_id.to_string()))?;

        if let Some(turn) = &user_turn {
            self.store.append(conversation_id, std::slice::from_ref(turn)).await?;
        }

        let mut conversation = self.store.load(conversation_id).await?;
        if conversation.is_empty() {
            return Err(ChatError::NotFound(conversation_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(self.settings.chunk_buffer.max(1));
        let engine = Arc::clone(&self);

        tokio::spawn(async move {
            let _guard = guard;
            let before = conversation.len();

            engine.drive(&mut conversation, &options, &tx, cancel).await;

            let appended = &conversation.turns[before..];
            if let Err(e) = engine.store.append(&conversation.id, appended).await {
                tracing::warn!(conversation = %conversation.id, error = %e, "Failed to persist turns");
            }
            let _ = tx.send(StreamChunk::done()).await;
        });

        Ok(rx)
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        options: &ConversationOptions,
        chunks: &mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) {
        let started = conversation.len();
        tracing::info!(conversation = %conversation.id, "Exchange started");

        let mut exchange = Exchange {
            engine: self,
            conversation,
            options,
            chunks,
            cancel,
            tool_rounds: 0,
            continuations: 0,
            requests: 0,
        };

        while exchange.iteration().await == Step::Continue {}

        tracing::info!(
            conversation = %exchange.conversation.id,
            turns = exchange.conversation.len() - started,
            tool_rounds = exchange.tool_rounds,
            continuations = exchange.continuations,
            requests = exchange.requests,
            "Exchange finished"
        );
    }
}

/// Marks a conversation as busy until dropped
struct InFlight {
    active: Arc<Mutex<HashSet<String>>>,
    conversation_id: String,
}

impl InFlight {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, conversation_id: &str) -> Option<Self> {
        let inserted = active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation_id.to_string());

        inserted.then(|| Self {
            active: Arc::clone(active),
            conversation_id: conversation_id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.conversation_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Request another completion
    Continue,
    Done,
}

/// What to do after a message was closed
enum Flow {
    Read,
    Step(Step),
}

struct Exchange<'a> {
    engine: &'a ChatEngine,
    conversation: &'a mut Conversation,
    options: &'a ConversationOptions,
    chunks: &'a mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    tool_rounds: usize,
    continuations: usize,
    requests: usize,
}

impl Exchange<'_> {
    async fn iteration(&mut self) -> Step {
        if self.cancel.is_cancelled() {
            return Step::Done;
        }

        let continuation = self.conversation.needs_continuation();
        let compiled = HistoryCompiler::new(&self.engine.tools).compile(
            self.conversation,
            self.options,
            continuation,
        );
        let prompt = match compiled {
            Ok(prompt) => format!("{prompt}{}{}", tokens::START, roles::ASSISTANT),
            Err(e) => {
                self.report_error(None, &e.to_string()).await;
                return Step::Done;
            }
        };
        let model: String = match MODEL.value(self.options) {
            Ok(model) => model,
            Err(e) => {
                self.report_error(None, &e.to_string()).await;
                return Step::Done;
            }
        };

        self.requests += 1;
        tracing::debug!(continuation, request = self.requests, "Requesting completion");

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Step::Done,
            opened = self.engine.provider.stream_completion(&prompt, &model, &self.options.model_options) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.report_error(None, &e.to_string()).await;
                return Step::Done;
            }
        };

        let mut classifier = Classifier::resume(roles::ASSISTANT);
        let mut committed = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(conversation = %self.conversation.id, "Exchange cancelled");
                    self.commit_partial(classifier.finish());
                    return Step::Done;
                }
                next = stream.next() => next,
            };

            let fragment = match next {
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => {
                    let turn_id = classifier.current().map(|h| h.id);
                    self.report_error(turn_id, &e.to_string()).await;
                    self.commit_partial(classifier.finish());
                    return Step::Done;
                }
                None => {
                    return match classifier.finish() {
                        Some(open) if open.header.route.is_tool_call() => {
                            tracing::debug!("Stream ended inside a tool call, dispatching it");
                            self.tool_round(open.header, open.content).await
                        }
                        None if committed > 0 => self.follow_up().await,
                        open => {
                            self.commit_partial(open);
                            Step::Done
                        }
                    };
                }
            };

            for part in fragments(&fragment) {
                match classifier.feed(part) {
                    Some(ClassifierEvent::Content { text, forward: true }) => {
                        let Some(header) = classifier.current() else { continue };
                        let chunk = StreamChunk::content(header.id, header.content_kind, text);
                        if !self.emit(chunk).await {
                            self.commit_partial(classifier.finish());
                            return Step::Done;
                        }
                    }
                    Some(ClassifierEvent::MessageEnd(message)) => match self.on_message_end(message).await {
                        Flow::Read => committed += 1,
                        Flow::Step(step) => return step,
                    },
                    _ => {}
                }
            }
        }
    }

    async fn on_message_end(&mut self, message: CompletedMessage) -> Flow {
        let CompletedMessage { header, content, end } = message;

        if header.route.is_tool_call() || end == EndToken::Call {
            return Flow::Step(self.tool_round(header, content).await);
        }

        let policy = self.engine.settings.terminal_policy;
        if end == EndToken::Return || policy.is_terminal(header.route.kind) {
            self.commit_terminal(header, content);
            return Flow::Step(Step::Done);
        }

        self.conversation.push(turn_from(header, content, end));
        Flow::Read
    }

    /// Record the call, dispatch it and record the outcome.
    async fn tool_round(&mut self, header: MessageHeader, arguments: String) -> Step {
        let tool_name = header.route.tool_name.clone();
        let name = tool_name.clone().unwrap_or_else(|| "unknown".to_string());
        let call_id = Uuid::new_v4().to_string();

        let mut call = Turn::tool(
            header.id,
            ToolContext {
                call_id: call_id.clone(),
                tool_name: name.clone(),
                content: arguments.clone(),
                is_result: false,
            },
        );
        if let Some(channel) = header.channel.as_deref() {
            call = call.with_channel(channel);
        }
        self.conversation.push(call);

        if self.tool_rounds >= self.engine.settings.max_tool_rounds {
            let notice = format!(
                "Stopped after {} tool calls without a final answer.",
                self.tool_rounds
            );
            tracing::warn!(conversation = %self.conversation.id, tool = %name, "Tool round limit reached");
            self.push_notice(notice).await;
            return Step::Done;
        }

        let mut cancelled = false;
        let outcome = match &tool_name {
            Some(tool_name) => tokio::select! {
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    ToolOutcome::failure(FailureKind::ExecutionError, "Tool call was cancelled.")
                }
                outcome = self.engine.tools.execute(tool_name, &arguments) => outcome,
            },
            None => {
                tracing::warn!(header = ?header.channel, "Tool call without a usable tool name");
                ToolOutcome::failure(FailureKind::MalformedToolName, "")
            }
        };
        self.tool_rounds += 1;

        let id = Uuid::new_v4();
        let text = outcome.describe(&name);
        let turn = match outcome {
            ToolOutcome::Success(result) => Turn::tool(
                id,
                ToolContext {
                    call_id,
                    tool_name: name,
                    content: result,
                    is_result: true,
                },
            ),
            ToolOutcome::Failure { .. } => Turn::system(id, text.clone(), ContentKind::Reasoning),
        };
        self.conversation.push(turn.with_channel(channels::COMMENTARY));

        if cancelled || !self.emit(StreamChunk::content(id, ContentKind::Reasoning, text)).await {
            return Step::Done;
        }
        Step::Continue
    }

    /// The stream closed cleanly after turns that do not end the exchange.
    async fn follow_up(&mut self) -> Step {
        if self.continuations >= self.engine.settings.max_continuations {
            let notice = format!(
                "Stopped after {} follow-up requests without a final answer.",
                self.continuations
            );
            tracing::warn!(conversation = %self.conversation.id, "Follow-up request limit reached");
            self.push_notice(notice).await;
            return Step::Done;
        }

        self.continuations += 1;
        tracing::debug!(continuations = self.continuations, "Stream closed without a final turn, asking again");
        Step::Continue
    }

    /// Record a system notice and show it as the answer.
    async fn push_notice(&mut self, notice: String) {
        let id = Uuid::new_v4();
        self.conversation.push(
            Turn::system(id, notice.clone(), ContentKind::Reasoning).with_channel(channels::COMMENTARY),
        );
        self.emit(StreamChunk::content(id, ContentKind::Answer, notice)).await;
    }

    /// Close the exchange with `content` as the final turn.
    fn commit_terminal(&mut self, header: MessageHeader, content: String) {
        let content = format!("{content}{}", tokens::RETURN);
        self.conversation.push(turn_from(header, content, EndToken::Return));
    }

    /// Keep whatever was received of an interrupted message.
    fn commit_partial(&mut self, open: Option<CompletedMessage>) {
        if let Some(open) = open {
            tracing::debug!(chars = open.content.len(), "Committing interrupted message");
            self.commit_terminal(open.header, open.content);
        }
    }

    async fn report_error(&mut self, turn_id: Option<Uuid>, description: &str) {
        tracing::warn!(conversation = %self.conversation.id, error = %description, "Exchange failed");
        let chunk = StreamChunk::content(
            turn_id.unwrap_or_else(Uuid::new_v4),
            ContentKind::Answer,
            format!("Error: {description}"),
        );
        self.emit(chunk).await;
    }

    /// Deliver a chunk; false once the exchange was cancelled or nobody listens.
    async fn emit(&self, chunk: StreamChunk) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.chunks.send(chunk) => sent.is_ok(),
        }
    }
}

fn turn_from(header: MessageHeader, content: String, end: EndToken) -> Turn {
    let turn = match header.role {
        Role::System => Turn::system(header.id, content, header.content_kind),
        Role::User => Turn::user(content).with_id(header.id),
        Role::Assistant | Role::Tool => Turn::assistant(header.id, content, header.content_kind),
    };
    let turn = match header.channel {
        Some(channel) => turn.with_channel(channel),
        None => turn,
    };
    turn.with_end_token(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::InMemoryStore;
    use crate::providers::ScriptedProvider;

    fn engine(provider: ScriptedProvider) -> Arc<ChatEngine> {
        Arc::new(ChatEngine::new(
            Arc::new(provider),
            Arc::new(ToolRegistry::builtin()),
            Arc::new(InMemoryStore::new()),
        ))
    }

    async fn drain(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_terminal_policy() {
        assert!(TerminalPolicy::FinalOnly.is_terminal(ChannelKind::Final));
        assert!(!TerminalPolicy::FinalOnly.is_terminal(ChannelKind::Analysis));
        assert!(TerminalPolicy::AnyNonTool.is_terminal(ChannelKind::Commentary));
        assert!(!TerminalPolicy::AnyNonTool.is_terminal(ChannelKind::Unknown));
    }

    #[tokio::test]
    async fn test_send_message_persists_turns() {
        let engine = engine(ScriptedProvider::new().respond("<|channel|>final<|message|>Hi!<|return|>"));

        let rx = Arc::clone(&engine)
            .send_message("c1", Turn::user("Hello"), ConversationOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        let chunks = drain(rx).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk, "Hi!");
        assert!(chunks[1].is_done);

        let stored = engine.store().load("c1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.turns[1].content.as_deref(), Some("Hi!<|return|>"));
        assert_eq!(stored.turns[1].id, chunks[0].turn_id.unwrap());
    }

    #[tokio::test]
    async fn test_continue_chat_requires_history() {
        let engine = engine(ScriptedProvider::new());
        let result = Arc::clone(&engine)
            .continue_chat("missing", ConversationOptions::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ChatError::NotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_one_exchange_per_conversation() {
        let engine = engine(ScriptedProvider::new().stall_after("<|channel|>final<|message|>Thinking"));
        let cancel = CancellationToken::new();

        let mut rx = Arc::clone(&engine)
            .send_message("c1", Turn::user("Hello"), ConversationOptions::default(), cancel.clone())
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.chunk, "Thinking");

        let second = Arc::clone(&engine)
            .send_message("c1", Turn::user("Again"), ConversationOptions::default(), CancellationToken::new())
            .await;
        assert!(matches!(second, Err(ChatError::Busy(_))));

        cancel.cancel();
        let chunks = drain(rx).await;
        assert!(chunks.last().unwrap().is_done);

        // the rejected message was never stored
        let stored = engine.store().load("c1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.turns[1].content.as_deref(), Some("Thinking<|return|>"));
    }
}
