use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

use shared::domain::{MessageId, SenderId};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, body, display_name, avatar_ref, show_avatar, show_timestamp, created_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Failures callers are expected to tell apart. Everything else surfaces as a
/// plain `anyhow::Error`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

/// A message row exactly as persisted: grouping flags are integers and the
/// creation instant is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: SenderId,
    pub body: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub show_avatar: i64,
    pub show_timestamp: i64,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: SenderId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub show_avatar: bool,
    pub show_timestamp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    AlreadyRemoved,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens a separate database.
        let max_connections = if database_url == "sqlite::memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
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
            .map_err(classify)
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn append(&self, message: &NewMessage) -> Result<MessageId> {
        let rec = sqlx::query(
            "INSERT INTO messages (sender_id, body, display_name, avatar_ref, show_avatar, show_timestamp, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.sender_id.as_str())
        .bind(&message.body)
        .bind(&message.display_name)
        .bind(message.avatar_ref.as_deref())
        .bind(i64::from(message.show_avatar))
        .bind(i64::from(message.show_timestamp))
        .bind(message.timestamp.timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
        .context("failed to append message")?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    pub async fn update(&self, message_id: MessageId, body: &str) -> Result<()> {
        let result = sqlx::query("UPDATE messages SET body = ? WHERE id = ?")
            .bind(body)
            .bind(message_id.0)
            .execute(&self.pool)
            .await
            .map_err(classify)
            .with_context(|| format!("failed to update message {message_id}"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(message_id).into());
        }
        Ok(())
    }

    pub async fn update_with_grouping(
        &self,
        message_id: MessageId,
        body: &str,
        show_avatar: bool,
        show_timestamp: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages SET body = ?, show_avatar = ?, show_timestamp = ? WHERE id = ?",
        )
        .bind(body)
        .bind(i64::from(show_avatar))
        .bind(i64::from(show_timestamp))
        .bind(message_id.0)
        .execute(&self.pool)
        .await
        .map_err(classify)
        .with_context(|| format!("failed to update message {message_id}"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(message_id).into());
        }
        Ok(())
    }

    /// Deletes one message. An id that was assigned once but is gone now is
    /// reported as `AlreadyRemoved`; an id never assigned is `NotFound`.
    pub async fn remove(&self, message_id: MessageId) -> Result<RemoveOutcome> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await
            .map_err(classify)
            .with_context(|| format!("failed to remove message {message_id}"))?;
        if result.rows_affected() > 0 {
            return Ok(RemoveOutcome::Removed);
        }

        let highest_assigned: Option<i64> =
            sqlx::query_scalar("SELECT seq FROM sqlite_sequence WHERE name = 'messages'")
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)
                .context("failed to read message id sequence")?;
        match highest_assigned {
            Some(seq) if message_id.0 > 0 && message_id.0 <= seq => Ok(RemoveOutcome::AlreadyRemoved),
            _ => Err(StoreError::NotFound(message_id).into()),
        }
    }

    pub async fn get(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)
            .with_context(|| format!("failed to load message {message_id}"))?;
        Ok(row.map(|r| stored_message(&r)))
    }

    /// Reads the `start`-th through `end`-th oldest messages, 1-based and
    /// inclusive. A `start` of zero reads from the first message.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Vec<StoredMessage>> {
        let first_rank = start.max(1);
        if end < first_rank {
            return Ok(Vec::new());
        }
        let offset = first_rank - 1;
        let limit = end - offset;

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY id ASC LIMIT ? OFFSET ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
        .with_context(|| format!("failed to read messages {start}..={end}"))?;

        Ok(rows.iter().map(stored_message).collect())
    }

    pub async fn count(&self) -> Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
            .context("failed to count messages")?;
        Ok(u64::try_from(total).unwrap_or_default())
    }
}

fn stored_message(r: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        sender_id: SenderId(r.get::<String, _>(1)),
        body: r.get::<String, _>(2),
        display_name: r.get::<String, _>(3),
        avatar_ref: r.get::<Option<String>, _>(4),
        show_avatar: r.get::<i64, _>(5),
        show_timestamp: r.get::<i64, _>(6),
        created_at_ms: r.get::<i64, _>(7),
    }
}

fn classify(err: sqlx::Error) -> anyhow::Error {
    match err {
        err @ (sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)) => StoreError::Unavailable(err.to_string()).into(),
        other => other.into(),
    }
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
