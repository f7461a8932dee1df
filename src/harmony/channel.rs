//! Response-channel routing
//!
//! The header between `<|channel|>` and `<|message|>` says what a turn is
//! for. Recognition is by literal prefix/suffix on the whole header string.

use serde::{Deserialize, Serialize};

use super::channels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Analysis,
    Commentary,
    Final,
    Unknown,
}

/// Classified channel header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: ChannelKind,
    /// Function named by a `commentary to=functions.<name> <|constrain|>json` header
    pub tool_name: Option<String>,
}

impl Route {
    pub fn unknown() -> Self {
        Self {
            kind: ChannelKind::Unknown,
            tool_name: None,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        self.kind == ChannelKind::Commentary && self.tool_name.is_some()
    }
}

/// Classify a raw channel header.
pub fn classify(header: &str) -> Route {
    let kind = match header {
        channels::ANALYSIS => ChannelKind::Analysis,
        channels::FINAL => ChannelKind::Final,
        h if h.starts_with(channels::COMMENTARY) => ChannelKind::Commentary,
        _ => ChannelKind::Unknown,
    };

    if kind == ChannelKind::Unknown {
        tracing::warn!(header = %header, "Unexpected response channel");
    }

    let tool_name = if kind == ChannelKind::Commentary {
        function_name(header)
    } else {
        None
    };

    Route { kind, tool_name }
}

/// Commentary without a function header (preamble chatter) yields `None`.
fn function_name(header: &str) -> Option<String> {
    let name = header
        .strip_prefix(channels::FUNCTION_CALL_PREFIX)?
        .strip_suffix(channels::FUNCTION_CALL_SUFFIX)?
        .trim();

    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
