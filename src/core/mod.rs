//! Core engine components
//!
//! The chat engine drives exchanges with the model; the store keeps the
//! conversations it works on.

mod chat;
mod memory;

pub use chat::{ChatEngine, ChatError, EngineSettings, TerminalPolicy, PROVIDER_NAME};
pub use memory::{ConversationStore, ConversationSummary, InMemoryStore, SqliteStore, StoreError};
