//! Conversation persistence: the store seam plus in-memory and SQLite backends.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{ContentBlock, ConversationId, DatabaseError, Message, Role};
use sqlx::{Row, sqlite::SqlitePool};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../../migrations/0001_conversations.sql");

/// Storage used by the agent loop for transcripts and long-lived facts.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Appends one message to a conversation.
    async fn append(&self, conversation: &ConversationId, message: &Message)
    -> Result<(), DatabaseError>;

    /// The last `limit` messages in chronological order; `0` returns all.
    async fn recent(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Known facts rendered for the system prompt; empty when there are none.
    async fn fact_context(&self) -> Result<String, DatabaseError>;

    /// Records or replaces a fact.
    async fn remember_fact(&self, category: &str, key: &str, value: &str)
    -> Result<(), DatabaseError>;
}

fn render_facts(facts: impl IntoIterator<Item = (String, String, String)>) -> String {
    let lines: Vec<String> = facts
        .into_iter()
        .map(|(category, key, value)| format!("- [{category}] {key}: {value}"))
        .collect();
    if lines.is_empty() {
        String::new()
    } else {
        format!("Known facts about the user and device:\n{}", lines.join("\n"))
    }
}

fn tail(messages: &[Message], limit: usize) -> Vec<Message> {
    let start = if limit == 0 {
        0
    } else {
        messages.len().saturating_sub(limit)
    };
    messages[start..].to_vec()
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<ConversationId, Vec<Message>>>,
    facts: Mutex<BTreeMap<(String, String), String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<(), DatabaseError> {
        self.conversations
            .lock()
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn recent(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        Ok(self
            .conversations
            .lock()
            .get(conversation)
            .map(|messages| tail(messages, limit))
            .unwrap_or_default())
    }

    async fn fact_context(&self) -> Result<String, DatabaseError> {
        let facts = self.facts.lock();
        Ok(render_facts(
            facts
                .iter()
                .map(|((category, key), value)| (category.clone(), key.clone(), value.clone())),
        ))
    }

    async fn remember_fact(
        &self,
        category: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        self.facts
            .lock()
            .insert((category.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

/// SQLite-backed conversation memory
pub struct SqliteMemory {
    pool: SqlitePool,
}

impl SqliteMemory {
    /// Open (or create) the SQLite database and apply the schema
    pub async fn open(db_url: &str) -> Result<Self, DatabaseError> {
        // Expand ~ in path
        let url = if db_url.starts_with('~') {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen('~', &home, 1)
        } else {
            db_url.to_string()
        };

        // Ensure parent directory exists
        if let Some(parent) = std::path::Path::new(&url).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{url}?mode=rwc"))
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("SQLite memory opened: {url}");
        Ok(Self { pool })
    }

    /// Conversation ids, most recently active first.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationId>, DatabaseError> {
        let rows = sqlx::query("SELECT id FROM conversations ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| ConversationId::from(row.get::<String, _>("id")))
            .collect())
    }
}

#[async_trait]
impl ConversationStore for SqliteMemory {
    async fn append(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<(), DatabaseError> {
        let content_json = serde_json::to_string(&message.content)
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        sqlx::query(
            "INSERT INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(conversation.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        sqlx::query(
            "INSERT INTO messages (conversation_id, role, content_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation.as_str())
        .bind(message.role.to_string())
        .bind(content_json)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        debug!("Saved message to {conversation} (role: {})", message.role);
        Ok(())
    }

    async fn recent(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = if limit == 0 {
            -1
        } else {
            i64::try_from(limit).unwrap_or(i64::MAX)
        };
        let rows = sqlx::query(
            "SELECT role, content_json FROM messages WHERE conversation_id = ? \
             ORDER BY seq DESC LIMIT ?",
        )
        .bind(conversation.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        let mut messages = rows
            .into_iter()
            .map(|row| {
                let role_str: String = row.get("role");
                let role =
                    Role::from_str(&role_str).map_err(|e| DatabaseError::Corrupt(e.to_string()))?;
                let raw: String = row.get("content_json");
                let content: Vec<ContentBlock> = serde_json::from_str(&raw)
                    .map_err(|e| DatabaseError::Corrupt(e.to_string()))?;
                Ok(Message { role, content })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn fact_context(&self) -> Result<String, DatabaseError> {
        let rows = sqlx::query("SELECT category, key, value FROM facts ORDER BY category, key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(render_facts(rows.into_iter().map(|row| {
            (
                row.get::<String, _>("category"),
                row.get::<String, _>("key"),
                row.get::<String, _>("value"),
            )
        })))
    }

    async fn remember_fact(
        &self,
        category: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO facts (category, key, value, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(category, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(category)
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(())
    }
}
