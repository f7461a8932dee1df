//! The token-delimited chat format spoken by gpt-oss style models
//!
//! Model input and output are plain text interleaved with control tokens:
//!
//! ```text
//! <|start|>assistant<|channel|>final<|message|>Hello<|return|>
//! ```
//!
//! - [`classifier`] turns the model's fragment stream into turn events
//! - [`channel`] classifies response-channel headers and finds tool calls
//! - [`compiler`] renders a conversation back into prompt text

pub mod channel;
pub mod classifier;
pub mod compiler;

pub use channel::{classify, ChannelKind, Route};
pub use classifier::{Classifier, ClassifierEvent, ClassifierState, CompletedMessage, MessageHeader};
pub use compiler::HistoryCompiler;

/// Control tokens, bit-exact
pub mod tokens {
    pub const START: &str = "<|start|>";
    pub const CHANNEL: &str = "<|channel|>";
    pub const MESSAGE: &str = "<|message|>";
    pub const END: &str = "<|end|>";
    pub const CALL: &str = "<|call|>";
    pub const RETURN: &str = "<|return|>";
    /// Marks a JSON-constrained function call inside a channel header
    pub const CONSTRAIN: &str = "<|constrain|>";
}

pub mod roles {
    pub const SYSTEM: &str = "system";
    pub const DEVELOPER: &str = "developer";
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
}

pub mod channels {
    pub const ANALYSIS: &str = "analysis";
    pub const COMMENTARY: &str = "commentary";
    pub const FINAL: &str = "final";
    /// Prefix of a commentary header addressing a function
    pub const FUNCTION_CALL_PREFIX: &str = "commentary to=functions.";
    /// Suffix declaring JSON-constrained arguments
    pub const FUNCTION_CALL_SUFFIX: &str = "<|constrain|>json";
}

/// Extended options understood by the harmony engine
pub mod options {
    use crate::conversation::{OptionDescriptor, OptionKind};

    pub const MODEL: OptionDescriptor = OptionDescriptor {
        key: "model_name",
        name: "Model Name",
        description: "Name of the model the backend should run.",
        kind: OptionKind::String,
        default_value: "gpt-oss:20b",
        allowed_values: &[],
    };

    pub const META_INFORMATION: OptionDescriptor = OptionDescriptor {
        key: "meta_information",
        name: "Meta Information",
        description: "Identity line placed at the top of the system turn.",
        kind: OptionKind::String,
        default_value: "You are a large language model.",
        allowed_values: &[],
    };

    pub const REASONING_LEVEL: OptionDescriptor = OptionDescriptor {
        key: "reasoning_level",
        name: "Reasoning Level",
        description: "Level of reasoning effort the model should use.",
        kind: OptionKind::Enum,
        default_value: "low",
        allowed_values: &["low", "medium", "high"],
    };

    pub const ALL: [OptionDescriptor; 3] = [MODEL, META_INFORMATION, REASONING_LEVEL];
}

use crate::conversation::EndToken;

/// A fragment that is one of the six control tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Start,
    Channel,
    Message,
    End,
    Call,
    Return,
}

impl ControlToken {
    /// Recognizes a whole fragment; partial matches are literal text.
    pub fn parse(fragment: &str) -> Option<Self> {
        match fragment {
            tokens::START => Some(ControlToken::Start),
            tokens::CHANNEL => Some(ControlToken::Channel),
            tokens::MESSAGE => Some(ControlToken::Message),
            tokens::END => Some(ControlToken::End),
            tokens::CALL => Some(ControlToken::Call),
            tokens::RETURN => Some(ControlToken::Return),
            _ => None,
        }
    }

    /// Terminator carried by this token, if it closes a message
    pub fn end_token(self) -> Option<EndToken> {
        match self {
            ControlToken::End => Some(EndToken::End),
            ControlToken::Call => Some(EndToken::Call),
            ControlToken::Return => Some(EndToken::Return),
            _ => None,
        }
    }
}

/// Split wire text into fragments, each control token on its own.
///
/// Backends stream control tokens as standalone fragments; this is the same
/// split applied to a whole prompt, used to replay compiled history.
pub fn fragments(text: &str) -> Vec<&str> {
    const ALL: [&str; 6] = [
        tokens::START,
        tokens::CHANNEL,
        tokens::MESSAGE,
        tokens::END,
        tokens::CALL,
        tokens::RETURN,
    ];

    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let next = ALL
            .iter()
            .filter_map(|token| rest.find(token).map(|pos| (pos, *token)))
            .min_by_key(|(pos, _)| *pos);

        match next {
            Some((pos, token)) => {
                if pos > 0 {
                    out.push(&rest[..pos]);
                }
                out.push(&rest[pos..pos + token.len()]);
                rest = &rest[pos + token.len()..];
            }
            None => {
                out.push(rest);
                break;
            }
        }
    }
    out
}
