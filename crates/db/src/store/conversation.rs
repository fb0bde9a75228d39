use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::Mutex;

use taskpilot_core::domain::conversation::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, Role, ToolCallRecord,
    MESSAGE_CEILING,
};
use taskpilot_core::domain::task::UserId;
use taskpilot_core::errors::StoreError;
use taskpilot_core::store::ConversationStore;

use crate::DbPool;

/// SQLite-backed conversation store.
///
/// Appends to one conversation are funneled through a per-conversation
/// mutex, so the count-check and insert act as one operation and message
/// ordering never interleaves under concurrency.
pub struct SqlConversationStore {
    pool: DbPool,
    ceiling: usize,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self::with_ceiling(pool, MESSAGE_CEILING)
    }

    pub fn with_ceiling(pool: DbPool, ceiling: usize) -> Self {
        Self { pool, ceiling, append_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, conversation_id: &ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks.entry(conversation_id.0.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Removes the lock entry once no other appender holds a clone, so the
    /// map only tracks conversations with appends in flight.
    async fn release_lock(&self, conversation_id: &ConversationId, lock: Arc<Mutex<()>>) {
        let mut locks = self.append_locks.lock().await;
        // Two holders: the map's entry and ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&conversation_id.0);
        }
    }

    async fn insert_message(
        &self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT id FROM conversation WHERE id = ?")
            .bind(&conversation_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let count = self.message_count(conversation_id).await?;
        if count >= self.ceiling {
            return Err(StoreError::Full);
        }

        let tool_calls_json = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&message.tool_calls)
                    .map_err(|e| StoreError::Database(format!("tool_calls encode: {e}")))?,
            )
        };

        sqlx::query(
            "INSERT INTO message (id, conversation_id, role, content, tool_calls, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&conversation_id.0)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&tool_calls_json)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE conversation SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&conversation_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn append_lock_entries(&self) -> usize {
        self.append_locks.lock().await.len()
    }
}

fn db_err(error: sqlx::Error) -> StoreError {
    StoreError::Database(error.to_string())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, StoreError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let user_id: String = row.try_get("user_id").map_err(db_err)?;
    let title: String = row.try_get("title").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;

    Ok(Conversation {
        id: ConversationId(id),
        user_id: UserId(user_id),
        title,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let conversation_id: String = row.try_get("conversation_id").map_err(db_err)?;
    let role_str: String = row.try_get("role").map_err(db_err)?;
    let content: String = row.try_get("content").map_err(db_err)?;
    let tool_calls_json: Option<String> = row.try_get("tool_calls").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;

    let role: Role = role_str.parse().map_err(StoreError::Database)?;
    let tool_calls: Vec<ToolCallRecord> = match tool_calls_json {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| StoreError::Database(format!("tool_calls decode: {e}")))?,
        None => Vec::new(),
    };

    Ok(Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        role,
        content,
        tool_calls,
        created_at: parse_timestamp(&created_at),
    })
}

#[async_trait]
impl ConversationStore for SqlConversationStore {
    async fn create(&self, user: &UserId, title: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(user.clone(), title);
        sqlx::query(
            "INSERT INTO conversation (id, user_id, title, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.user_id.0)
        .bind(&conversation.title)
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(conversation)
    }

    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(conversation_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.insert_message(conversation_id, message).await
        };
        self.release_lock(conversation_id, lock).await;
        result
    }

    async fn load(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
    ) -> Result<(Conversation, Vec<Message>), StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at
             FROM conversation WHERE id = ?",
        )
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let conversation = match row {
            Some(ref r) => row_to_conversation(r)?,
            None => return Err(StoreError::NotFound),
        };
        if &conversation.user_id != user {
            return Err(StoreError::Forbidden);
        }

        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, tool_calls, created_at
             FROM message WHERE conversation_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let messages =
            rows.iter().map(row_to_message).collect::<Result<Vec<_>, StoreError>>()?;
        Ok((conversation, messages))
    }

    async fn load_latest(&self, user: &UserId) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at
             FROM conversation WHERE user_id = ?
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(&user.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_conversation(r)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, user: &UserId) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.id, c.user_id, c.title, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM message m WHERE m.conversation_id = c.id) AS message_count
             FROM conversation c WHERE c.user_id = ?
             ORDER BY c.updated_at DESC",
        )
        .bind(&user.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let conversation = row_to_conversation(row)?;
                let message_count: i64 = row.try_get("message_count").map_err(db_err)?;
                Ok(ConversationSummary {
                    id: conversation.id,
                    title: conversation.title,
                    created_at: conversation.created_at,
                    updated_at: conversation.updated_at,
                    message_count: message_count as usize,
                })
            })
            .collect()
    }

    async fn message_count(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message WHERE conversation_id = ?")
                .bind(&conversation_id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(count as usize)
    }
}
