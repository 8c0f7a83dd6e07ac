//! PostgreSQL chat store.
//!
//! `chat_messages` is hash-partitioned by `stream_id` with primary key
//! `(stream_id, created_at, message_id)`; see `migrations/`. PostgreSQL has
//! no native TTL, so `expires_at` is written with each row and removed by
//! the expiry task calling [`ChatStore::purge_expired`].
//!
//! All queries are parameterized.

use crate::errors::ChatStoreError;
use crate::metrics;
use crate::models::{
    effective_limit, ChatCursor, ChatMessage, ChatPage, NewChatMessage,
};
use crate::store::{ChatStore, WriteAdmission};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::deadline::Deadline;
use common::types::MessageId;
use sqlx::PgPool;
use std::time::Instant;
use tracing::{instrument, warn};
use uuid::Uuid;

const BACKEND: &str = "postgres";

#[derive(sqlx::FromRow)]
struct ChatMessageRow {
    stream_id: String,
    message_id: Uuid,
    sender_id: String,
    text: String,
    moderation_status: String,
    message_type: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<ChatMessageRow> for ChatMessage {
    type Error = ChatStoreError;

    fn try_from(row: ChatMessageRow) -> Result<Self, Self::Error> {
        Ok(ChatMessage {
            stream_id: row.stream_id,
            message_id: MessageId(row.message_id),
            sender_id: row.sender_id,
            text: row.text,
            moderation_status: row.moderation_status.parse()?,
            message_type: row.message_type.parse()?,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

fn into_messages(rows: Vec<ChatMessageRow>) -> Result<Vec<ChatMessage>, ChatStoreError> {
    rows.into_iter().map(ChatMessage::try_from).collect()
}

/// Chat store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgChatStore {
    pool: PgPool,
    admission: WriteAdmission,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool, max_inflight_writes: usize) -> Self {
        Self {
            pool,
            admission: WriteAdmission::new(max_inflight_writes),
        }
    }

    async fn insert(&self, message: NewChatMessage) -> Result<ChatMessage, ChatStoreError> {
        let stored = message.clone().into_stored(Utc::now());

        let inserted: Option<ChatMessageRow> = sqlx::query_as(
            r#"
            INSERT INTO chat_messages (
                stream_id, created_at, message_id, sender_id, text,
                moderation_status, message_type, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (stream_id, created_at, message_id) DO NOTHING
            RETURNING stream_id, message_id, sender_id, text,
                      moderation_status, message_type, created_at, expires_at
            "#,
        )
        .bind(&stored.stream_id)
        .bind(stored.created_at)
        .bind(stored.message_id.as_uuid())
        .bind(&stored.sender_id)
        .bind(&stored.text)
        .bind(stored.moderation_status.as_str())
        .bind(stored.message_type.as_str())
        .bind(stored.expires_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return ChatMessage::try_from(row);
        }

        // Key already taken: idempotent replay or a conflicting write
        let existing: ChatMessageRow = sqlx::query_as(
            r#"
            SELECT stream_id, message_id, sender_id, text,
                   moderation_status, message_type, created_at, expires_at
            FROM chat_messages
            WHERE stream_id = $1 AND created_at = $2 AND message_id = $3
            "#,
        )
        .bind(&stored.stream_id)
        .bind(stored.created_at)
        .bind(stored.message_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        let existing = ChatMessage::try_from(existing)?;
        if existing.same_content(&message) {
            Ok(existing)
        } else {
            Err(ChatStoreError::Conflict(format!(
                "{}/{}",
                existing.stream_id,
                existing.cursor()
            )))
        }
    }

    async fn create_admitted(
        &self,
        message: NewChatMessage,
        deadline: Deadline,
    ) -> Result<ChatMessage, ChatStoreError> {
        message.validate()?;
        let _permit = self.admission.try_admit()?;
        metrics::set_chat_inflight_writes(BACKEND, self.admission.in_flight());

        deadline
            .run(self.insert(message))
            .await
            .map_err(ChatStoreError::write_timeout)?
    }

    async fn fetch_page(
        &self,
        stream_id: &str,
        limit: usize,
        since: Option<ChatCursor>,
    ) -> Result<Vec<ChatMessage>, ChatStoreError> {
        // A timestamp-only cursor compares against the nil UUID, the
        // smallest id, which excludes every row at that timestamp.
        let cursor_ts = since.map(|c| c.timestamp);
        let cursor_id = since
            .and_then(|c| c.message_id)
            .map_or_else(Uuid::nil, |id| id.as_uuid());

        let rows: Vec<ChatMessageRow> = sqlx::query_as(
            r#"
            SELECT stream_id, message_id, sender_id, text,
                   moderation_status, message_type, created_at, expires_at
            FROM chat_messages
            WHERE stream_id = $1
              AND ($2::timestamptz IS NULL OR (created_at, message_id) < ($2, $3))
            ORDER BY created_at DESC, message_id DESC
            LIMIT $4
            "#,
        )
        .bind(stream_id)
        .bind(cursor_ts)
        .bind(cursor_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn fetch_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatStoreError> {
        let rows: Vec<ChatMessageRow> = sqlx::query_as(
            r#"
            SELECT stream_id, message_id, sender_id, text,
                   moderation_status, message_type, created_at, expires_at
            FROM chat_messages
            WHERE stream_id = $1
              AND created_at >= $2
              AND created_at < $3
            ORDER BY created_at DESC, message_id DESC
            LIMIT $4
            "#,
        )
        .bind(stream_id)
        .bind(from)
        .bind(to)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    #[instrument(skip_all, fields(stream_id = %message.stream_id))]
    async fn create(
        &self,
        message: NewChatMessage,
        deadline: Deadline,
    ) -> Result<ChatMessage, ChatStoreError> {
        let start = Instant::now();

        let result = self.create_admitted(message, deadline).await;

        let status = match &result {
            Ok(_) => "success",
            Err(e @ ChatStoreError::Database(_)) => {
                warn!(target: "sc.chat.store", error = %e, "Chat write failed");
                e.error_code()
            }
            Err(e) => e.error_code(),
        };
        metrics::record_chat_write(BACKEND, status, start.elapsed());
        result
    }

    #[instrument(skip_all, fields(stream_id = %stream_id, limit = limit))]
    async fn list_by_stream(
        &self,
        stream_id: &str,
        limit: usize,
        since: Option<ChatCursor>,
        deadline: Deadline,
    ) -> Result<ChatPage, ChatStoreError> {
        let start = Instant::now();
        let limit = effective_limit(limit);

        let result = if limit == 0 {
            Ok(ChatPage::from_messages(Vec::new(), 0))
        } else {
            deadline
                .run(self.fetch_page(stream_id, limit, since))
                .await
                .map_err(ChatStoreError::read_timeout)
                .and_then(|r| r)
                .map(|messages| ChatPage::from_messages(messages, limit))
        };

        let status = result.as_ref().map_or_else(|e| e.error_code(), |_| "success");
        if let Err(e @ ChatStoreError::Database(_)) = &result {
            warn!(target: "sc.chat.store", error = %e, "Chat history read failed");
        }
        metrics::record_chat_read(BACKEND, "list_by_stream", status, start.elapsed());
        result
    }

    #[instrument(skip_all, fields(stream_id = %stream_id, limit = limit))]
    async fn list_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        deadline: Deadline,
    ) -> Result<Vec<ChatMessage>, ChatStoreError> {
        let start = Instant::now();
        let limit = effective_limit(limit);

        let result = if limit == 0 || from >= to {
            Ok(Vec::new())
        } else {
            deadline
                .run(self.fetch_range(stream_id, from, to, limit))
                .await
                .map_err(ChatStoreError::read_timeout)
                .and_then(|r| r)
        };

        let status = result.as_ref().map_or_else(|e| e.error_code(), |_| "success");
        metrics::record_chat_read(BACKEND, "list_range", status, start.elapsed());
        result
    }

    #[instrument(skip_all)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, ChatStoreError> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_create_and_page(pool: PgPool) {
        let store = PgChatStore::new(pool, 16);
        let base = Utc::now() - chrono::Duration::minutes(10);

        for i in 0..20 {
            let msg = NewChatMessage::text("X", "alice", format!("message {i}"))
                .at(base + chrono::Duration::seconds(i));
            store.create(msg, deadline()).await.unwrap();
        }

        let page = store.list_by_stream("X", 8, None, deadline()).await.unwrap();
        assert_eq!(page.messages.len(), 8);
        assert_eq!(page.messages[0].text, "message 19");

        let next = store
            .list_by_stream("X", 8, page.next_cursor, deadline())
            .await
            .unwrap();
        assert_eq!(next.messages[0].text, "message 11");
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_rewrite_and_conflict(pool: PgPool) {
        let store = PgChatStore::new(pool, 16);
        let msg = NewChatMessage::text("X", "alice", "hello");

        let first = store.create(msg.clone(), deadline()).await.unwrap();
        let replay = store.create(msg.clone(), deadline()).await.unwrap();
        assert_eq!(first, replay);

        let mut forged = msg;
        forged.text = "changed".to_string();
        let err = store.create(forged, deadline()).await.unwrap_err();
        assert!(matches!(err, ChatStoreError::Conflict(_)));
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_range_and_purge(pool: PgPool) {
        let store = PgChatStore::new(pool, 16);
        let old = Utc::now() - chrono::Duration::days(40);

        for i in 0..5 {
            let msg = NewChatMessage::text("X", "alice", format!("old {i}"))
                .at(old + chrono::Duration::seconds(i));
            store.create(msg, deadline()).await.unwrap();
        }
        store
            .create(NewChatMessage::text("X", "bob", "fresh"), deadline())
            .await
            .unwrap();

        let range = store
            .list_range(
                "X",
                old + chrono::Duration::seconds(1),
                old + chrono::Duration::seconds(3),
                50,
                deadline(),
            )
            .await
            .unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].text, "old 2");

        // Backdated rows expire a TTL after the write, like the fresh one
        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);
        let page = store.list_by_stream("X", 50, None, deadline()).await.unwrap();
        assert_eq!(page.messages.len(), 6);

        let past_ttl = Utc::now() + chrono::Duration::days(30) + chrono::Duration::minutes(1);
        assert_eq!(store.purge_expired(past_ttl).await.unwrap(), 6);
    }
}
