//! Conversation storage
//!
//! The chat engine only sees the [`ConversationStore`] trait. [`SqliteStore`]
//! persists turns as JSON rows; [`InMemoryStore`] keeps them in a map and is
//! what tests and throwaway runs use.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::conversation::{Conversation, Role, Turn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored turn could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of the conversation listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub turn_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation; unknown ids load as an empty conversation.
    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError>;

    /// Append turns in order, creating the conversation if needed.
    async fn append(&self, conversation_id: &str, turns: &[Turn]) -> Result<(), StoreError>;

    /// Most recently updated first
    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Returns false when there was nothing to delete.
    async fn delete(&self, conversation_id: &str) -> Result<bool, StoreError>;
}

/// SQLite-backed store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database, gone when the store is dropped
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                turn_id TEXT NOT NULL,
                role TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_turns_conversation
            ON turns(conversation_id, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT payload
            FROM turns
            WHERE conversation_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut conversation = Conversation::new(conversation_id);
        for (payload,) in rows {
            conversation.push(serde_json::from_str(&payload)?);
        }
        Ok(conversation)
    }

    async fn append(&self, conversation_id: &str, turns: &[Turn]) -> Result<(), StoreError> {
        if turns.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for turn in turns {
            let payload = serde_json::to_string(turn)?;

            sqlx::query(
                r#"
                INSERT INTO turns (conversation_id, turn_id, role, payload, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(conversation_id)
            .bind(turn.id.to_string())
            .bind(role_name(turn.role))
            .bind(payload)
            .bind(turn.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"
            SELECT c.id, COUNT(t.seq), c.updated_at
            FROM conversations c
            LEFT JOIN turns t ON t.conversation_id = c.id
            GROUP BY c.id
            ORDER BY c.updated_at DESC, c.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, turn_count, updated_at)| ConversationSummary {
                id,
                turn_count: turn_count.max(0) as usize,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect())
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM turns WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

#[derive(Debug, Default)]
struct StoredConversation {
    turns: Vec<Turn>,
    updated_at: DateTime<Utc>,
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, StoredConversation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let conversations = self.conversations.read().await;
        let mut conversation = Conversation::new(conversation_id);
        if let Some(stored) = conversations.get(conversation_id) {
            conversation.turns = stored.turns.clone();
        }
        Ok(conversation)
    }

    async fn append(&self, conversation_id: &str, turns: &[Turn]) -> Result<(), StoreError> {
        if turns.is_empty() {
            return Ok(());
        }
        let mut conversations = self.conversations.write().await;
        let stored = conversations.entry(conversation_id.to_string()).or_default();
        stored.turns.extend_from_slice(turns);
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let conversations = self.conversations.read().await;
        let mut summaries: Vec<ConversationSummary> = conversations
            .iter()
            .map(|(id, stored)| ConversationSummary {
                id: id.clone(),
                turn_count: stored.turns.len(),
                updated_at: stored.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool, StoreError> {
        Ok(self.conversations.write().await.remove(conversation_id).is_some())
    }
}
