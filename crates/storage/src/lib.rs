use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{Channel, ContentType, ConversationId, MessageId, QueueId, SenderType},
    protocol::AttachmentRef,
};

/// Durable local store for not-yet-confirmed sends. Entries survive process
/// restarts so a reload can resume draining where the previous session
/// stopped.
#[derive(Clone)]
pub struct OutboxStorage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Queued,
    Sending,
    Failed,
}

impl OutboxStatus {
    fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Queued => "queued",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "sending" => OutboxStatus::Sending,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::Queued,
        }
    }
}

/// The send request persisted with each entry. Carries the provisional id so
/// the reconciler can still correlate after a reload, and the channel so the
/// delivery gateway can be invoked without a summary lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSend {
    pub provisional_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_type: SenderType,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub channel: Channel,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub queue_id: QueueId,
    pub conversation_id: ConversationId,
    pub payload: PendingSend,
    pub record_id: Option<MessageId>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

const ENTRY_COLUMNS: &str =
    "queue_id, conversation_id, payload, record_id, status, retry_count, queued_at, last_error";

impl OutboxStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Persists a new entry. Must complete before the caller treats the
    /// optimistic message as handed off to the outbox.
    pub async fn enqueue(&self, queue_id: &QueueId, payload: &PendingSend) -> Result<()> {
        let encoded = serde_json::to_string(payload).context("failed to encode outbox payload")?;
        sqlx::query(
            "INSERT INTO outbox_entries (queue_id, conversation_id, payload, status, retry_count, queued_at)
             VALUES (?, ?, ?, 'queued', 0, ?)",
        )
        .bind(queue_id.as_str())
        .bind(payload.conversation_id.as_str())
        .bind(encoded)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Oldest queued entry, FIFO by enqueue time.
    pub async fn next_queued(&self) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM outbox_entries
             WHERE status = 'queued'
             ORDER BY queued_at ASC, rowid ASC
             LIMIT 1",
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(entry_from_row).transpose()
    }

    pub async fn entry(&self, queue_id: &QueueId) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE queue_id = ?",
        ))
        .bind(queue_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(entry_from_row).transpose()
    }

    pub async fn mark_sending(&self, queue_id: &QueueId) -> Result<()> {
        sqlx::query("UPDATE outbox_entries SET status = 'sending' WHERE queue_id = ?")
            .bind(queue_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transient failure: back to the queue for the next drain pass. The
    /// retry counter is bumped in SQL so it never regresses.
    pub async fn requeue(&self, queue_id: &QueueId, last_error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_entries
             SET status = 'queued', retry_count = retry_count + 1, last_error = ?
             WHERE queue_id = ?",
        )
        .bind(last_error)
        .bind(queue_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal failure: the entry stops auto-retrying until a manual reset.
    pub async fn mark_failed(&self, queue_id: &QueueId, last_error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_entries
             SET status = 'failed', retry_count = retry_count + 1, last_error = ?
             WHERE queue_id = ?",
        )
        .bind(last_error)
        .bind(queue_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records the authoritative id once the backend has created the record,
    /// so a later retry re-delivers instead of creating a duplicate.
    pub async fn attach_record_id(&self, queue_id: &QueueId, record_id: &MessageId) -> Result<()> {
        sqlx::query("UPDATE outbox_entries SET record_id = ? WHERE queue_id = ?")
            .bind(record_id.as_str())
            .bind(queue_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, queue_id: &QueueId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outbox_entries WHERE queue_id = ?")
            .bind(queue_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_failed(&self) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM outbox_entries
             WHERE status = 'failed'
             ORDER BY queued_at ASC, rowid ASC",
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// Manual retry control: failed entries go back to the queue with a
    /// fresh retry budget.
    pub async fn reset_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox_entries
             SET status = 'queued', retry_count = 0, last_error = NULL
             WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear_failed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox_entries WHERE status = 'failed'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Startup recovery: a crash mid-send leaves entries stuck in `sending`;
    /// resetting them to `queued` makes the interruption indistinguishable
    /// from a pending send.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE outbox_entries SET status = 'queued' WHERE status = 'sending'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_entries WHERE status != 'failed'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> Result<OutboxEntry> {
    let payload: PendingSend = serde_json::from_str(&row.get::<String, _>(2))
        .context("failed to decode outbox payload")?;
    Ok(OutboxEntry {
        queue_id: QueueId::new(row.get::<String, _>(0)),
        conversation_id: ConversationId::new(row.get::<String, _>(1)),
        payload,
        record_id: row.get::<Option<String>, _>(3).map(MessageId::new),
        status: OutboxStatus::parse(&row.get::<String, _>(4)),
        retry_count: row.get::<i64, _>(5) as u32,
        queued_at: row.get::<DateTime<Utc>, _>(6),
        last_error: row.get::<Option<String>, _>(7),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
