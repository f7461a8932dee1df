//! Conversation types and state management
//!
//! A [`Conversation`] is an append-only list of [`Turn`]s. Turns are created
//! fully formed by the chat engine (or by the caller for user turns) and are
//! never edited in place afterwards.

pub mod options;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::harmony::tokens;

pub use options::{ConversationOptions, ModelOptions, OptionDescriptor, OptionError, OptionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Whether a turn's text is the model thinking out loud or the answer proper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Reasoning,
    Answer,
}

/// The terminator that closed a turn on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndToken {
    #[default]
    End,
    Call,
    Return,
    /// Not closed yet; rendered blank so the model keeps writing the turn.
    Open,
}

impl EndToken {
    /// Wire literal for this terminator (empty for [`EndToken::Open`]).
    pub fn literal(self) -> &'static str {
        match self {
            EndToken::End => tokens::END,
            EndToken::Call => tokens::CALL,
            EndToken::Return => tokens::RETURN,
            EndToken::Open => "",
        }
    }
}

/// Tool call or tool result payload. A call and its result share `call_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_result: bool,
}

/// One complete role + channel + content unit of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_context: Option<ToolContext>,
    #[serde(default)]
    pub content_kind: ContentKind,
    pub created_at: DateTime<Utc>,

    /// Raw response-channel header written during this turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default)]
    pub end_token: EndToken,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extended_properties: HashMap<String, String>,
}

impl Turn {
    fn with_content(id: Uuid, role: Role, content: String, content_kind: ContentKind) -> Self {
        Self {
            id,
            role,
            content: Some(content),
            tool_context: None,
            content_kind,
            created_at: Utc::now(),
            channel: None,
            end_token: EndToken::End,
            extended_properties: HashMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_content(Uuid::new_v4(), Role::User, content.into(), ContentKind::Answer)
    }

    pub fn assistant(id: Uuid, content: impl Into<String>, content_kind: ContentKind) -> Self {
        Self::with_content(id, Role::Assistant, content.into(), content_kind)
    }

    pub fn system(id: Uuid, content: impl Into<String>, content_kind: ContentKind) -> Self {
        Self::with_content(id, Role::System, content.into(), content_kind)
    }

    pub fn tool(id: Uuid, context: ToolContext) -> Self {
        let end_token = if context.is_result {
            EndToken::End
        } else {
            EndToken::Call
        };

        Self {
            id,
            role: Role::Tool,
            content: None,
            tool_context: Some(context),
            content_kind: ContentKind::Reasoning,
            created_at: Utc::now(),
            channel: None,
            end_token,
            extended_properties: HashMap::new(),
        }
    }

    /// Keep the caller-supplied id (e.g. the id the UI already rendered).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_end_token(mut self, end_token: EndToken) -> Self {
        self.end_token = end_token;
        self
    }

    /// Text of the turn: the message content, or the tool payload for tool turns.
    pub fn text(&self) -> &str {
        match (&self.content, &self.tool_context) {
            (Some(content), _) => content,
            (None, Some(context)) => &context.content,
            (None, None) => "",
        }
    }
}

/// Ordered, append-only chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn add_user(&mut self, content: &str) {
        self.push(Turn::user(content));
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The next model request continues the last turn instead of opening a
    /// fresh assistant turn after a user message.
    pub fn needs_continuation(&self) -> bool {
        matches!(self.last(), Some(turn) if turn.role != Role::User)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Unit pushed to the consumer as tokens resolve into visible content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub turn_id: Option<Uuid>,
    pub content_kind: ContentKind,
    pub chunk: String,
    pub is_done: bool,
}

impl StreamChunk {
    pub fn content(turn_id: Uuid, content_kind: ContentKind, chunk: impl Into<String>) -> Self {
        Self {
            turn_id: Some(turn_id),
            content_kind,
            chunk: chunk.into(),
            is_done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            turn_id: None,
            content_kind: ContentKind::Answer,
            chunk: String::new(),
            is_done: true,
        }
    }
}
