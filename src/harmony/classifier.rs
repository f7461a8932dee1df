//! Streaming classifier for model output
//!
//! Fragments are fed one at a time, in arrival order. Control tokens move
//! the state machine; literal text is buffered into the role label, the
//! channel header or the message body depending on the state. A message is
//! only handed out whole, when its terminator arrives (or through
//! [`Classifier::finish`] when the stream stops early).

use uuid::Uuid;

use super::channel::{classify, ChannelKind, Route};
use super::{roles, ControlToken};
use crate::conversation::{ContentKind, EndToken, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    /// Buffering a role label
    AwaitingRole,
    /// Buffering a channel header
    AwaitingChannel,
    /// Role known, waiting for `<|channel|>` or `<|message|>`
    AwaitingMessage,
    InMessage,
}

/// Everything known about a message once `<|message|>` arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: Uuid,
    pub role: Role,
    pub role_label: String,
    pub channel: Option<String>,
    pub route: Route,
    pub content_kind: ContentKind,
}

impl MessageHeader {
    /// Content is only shown to the consumer once the channel is known.
    pub fn is_visible(&self) -> bool {
        self.channel.is_some() && self.route.kind != ChannelKind::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub header: MessageHeader,
    pub content: String,
    pub end: EndToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierEvent {
    RoleStart,
    RoleSet(String),
    MessageStart(MessageHeader),
    Content { text: String, forward: bool },
    MessageEnd(CompletedMessage),
}

#[derive(Debug)]
pub struct Classifier {
    state: ClassifierState,
    role_label: String,
    channel: String,
    header: Option<MessageHeader>,
    message: String,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            state: ClassifierState::AwaitingRole,
            role_label: String::new(),
            channel: String::new(),
            header: None,
            message: String::new(),
        }
    }

    /// Start after a role trailer the caller already wrote into the prompt
    /// (e.g. a prompt ending in `<|start|>assistant`).
    pub fn resume(role_label: &str) -> Self {
        Self {
            state: ClassifierState::AwaitingMessage,
            role_label: role_label.to_string(),
            ..Self::new()
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// Header of the message currently being received
    pub fn current(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    pub fn feed(&mut self, fragment: &str) -> Option<ClassifierEvent> {
        if fragment.is_empty() {
            return None;
        }

        match ControlToken::parse(fragment) {
            Some(token) => self.on_control(token),
            None => self.on_text(fragment),
        }
    }

    /// Hand out the message still open when the stream stopped, if any.
    pub fn finish(&mut self) -> Option<CompletedMessage> {
        if self.state != ClassifierState::InMessage {
            return None;
        }
        self.close(EndToken::Open)
    }

    fn on_control(&mut self, token: ControlToken) -> Option<ClassifierEvent> {
        match token {
            ControlToken::Start => {
                if self.state == ClassifierState::InMessage {
                    tracing::warn!(
                        dropped = self.message.len(),
                        "<|start|> inside an open message, dropping partial content"
                    );
                }
                self.reset();
                Some(ClassifierEvent::RoleStart)
            }
            ControlToken::Channel => {
                match self.state {
                    ClassifierState::AwaitingRole | ClassifierState::AwaitingMessage => {}
                    ClassifierState::AwaitingChannel => {
                        tracing::warn!(header = %self.channel, "Repeated <|channel|>, discarding header");
                    }
                    ClassifierState::InMessage => {
                        tracing::warn!("<|channel|> inside an open message, dropping partial content");
                        self.message.clear();
                        self.header = None;
                    }
                }
                self.channel.clear();
                self.state = ClassifierState::AwaitingChannel;
                Some(ClassifierEvent::RoleSet(self.role_label.trim().to_string()))
            }
            ControlToken::Message => {
                let channel = match self.state {
                    ClassifierState::AwaitingChannel => Some(std::mem::take(&mut self.channel)),
                    ClassifierState::AwaitingRole | ClassifierState::AwaitingMessage => None,
                    ClassifierState::InMessage => {
                        tracing::warn!("Repeated <|message|>, ignoring");
                        return None;
                    }
                };

                let header = self.open(channel);
                self.header = Some(header.clone());
                self.message.clear();
                self.state = ClassifierState::InMessage;
                Some(ClassifierEvent::MessageStart(header))
            }
            ControlToken::End | ControlToken::Call | ControlToken::Return => {
                let end = token.end_token().unwrap_or_default();
                if self.state != ClassifierState::InMessage {
                    tracing::warn!(state = ?self.state, ?end, "Terminator outside a message, ignoring");
                    self.reset();
                    return None;
                }
                self.close(end).map(ClassifierEvent::MessageEnd)
            }
        }
    }

    fn on_text(&mut self, text: &str) -> Option<ClassifierEvent> {
        match self.state {
            ClassifierState::AwaitingRole => {
                self.role_label.push_str(text);
                None
            }
            ClassifierState::AwaitingChannel => {
                self.channel.push_str(text);
                None
            }
            ClassifierState::AwaitingMessage => {
                tracing::warn!(fragment = %text, "Text before <|channel|>/<|message|>, dropping");
                None
            }
            ClassifierState::InMessage => {
                self.message.push_str(text);
                let forward = self.header.as_ref().is_some_and(MessageHeader::is_visible);
                Some(ClassifierEvent::Content {
                    text: text.to_string(),
                    forward,
                })
            }
        }
    }

    fn open(&self, channel: Option<String>) -> MessageHeader {
        let role_label = self.role_label.trim().to_string();
        let route = channel.as_deref().map(classify).unwrap_or_else(Route::unknown);
        let content_kind = if route.kind == ChannelKind::Final {
            ContentKind::Answer
        } else {
            ContentKind::Reasoning
        };

        tracing::debug!(role = %role_label, channel = ?channel, kind = ?route.kind, "Message started");

        MessageHeader {
            id: Uuid::new_v4(),
            role: role_from_label(&role_label),
            role_label,
            channel,
            route,
            content_kind,
        }
    }

    fn close(&mut self, end: EndToken) -> Option<CompletedMessage> {
        let header = self.header.take()?;
        let content = std::mem::take(&mut self.message);
        self.reset();

        Some(CompletedMessage {
            header,
            content,
            end,
        })
    }

    fn reset(&mut self) {
        self.state = ClassifierState::AwaitingRole;
        self.role_label.clear();
        self.channel.clear();
        self.header = None;
        self.message.clear();
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn role_from_label(label: &str) -> Role {
    match label {
        roles::USER => Role::User,
        roles::ASSISTANT => Role::Assistant,
        roles::SYSTEM | roles::DEVELOPER => Role::System,
        l if l.starts_with("functions.") || l.contains(" to=") => Role::Tool,
        other => {
            tracing::warn!(role = %other, "Unrecognized role label, assuming assistant");
            Role::Assistant
        }
    }
}
