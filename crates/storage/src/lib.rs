use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{MessageId, MessageKind, UserId},
    error::{ApiException, ErrorCode},
    protocol::LocationPayload,
};

/// Cap on the location-only history variant.
pub const LOCATION_HISTORY_LIMIT: u32 = 20;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Durable unit of a conversation. Immutable once appended, except the
/// read flag which only ever flips false to true.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub location: Option<LocationPayload>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Storage {
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

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Appends a message, assigning `id` and `created_at` at insertion time.
    /// Location messages must carry a payload with in-range coordinates;
    /// anything else is rejected before touching the database.
    pub async fn append_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        kind: MessageKind,
        body: &str,
        location: Option<&LocationPayload>,
    ) -> Result<StoredMessage> {
        if body.trim().is_empty() {
            bail!(ApiException::new(
                ErrorCode::Validation,
                "message body cannot be empty"
            ));
        }

        let location_json = match (kind, location) {
            (MessageKind::Location, Some(payload)) => {
                payload.validate()?;
                Some(serde_json::to_string(payload)?)
            }
            (MessageKind::Location, None) => bail!(ApiException::new(
                ErrorCode::Validation,
                "location message requires location data"
            )),
            // A text message never stores coordinates, even if the client sent some.
            (MessageKind::Text, _) => None,
        };

        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (sender_id, receiver_id, message, type, location_data, created_at, is_read)
             VALUES (?, ?, ?, ?, ?, ?, 0) RETURNING id",
        )
        .bind(sender_id.0)
        .bind(receiver_id.0)
        .bind(body)
        .bind(match kind {
            MessageKind::Text => "text",
            MessageKind::Location => "location",
        })
        .bind(location_json.as_deref())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            sender_id,
            receiver_id,
            body: body.to_string(),
            kind,
            location: match kind {
                MessageKind::Location => location.cloned(),
                MessageKind::Text => None,
            },
            created_at,
            is_read: false,
        })
    }

    /// Every message between the pair, in either direction, ascending by
    /// `(created_at, id)`. An unknown pair yields an empty list.
    pub async fn conversation_history(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, message, type, location_data, created_at, is_read
             FROM messages
             WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
             ORDER BY created_at ASC, id ASC",
        )
        .bind(user_a.0)
        .bind(user_b.0)
        .bind(user_b.0)
        .bind(user_a.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Most recent location shares for the pair, newest first.
    pub async fn location_history(
        &self,
        user_a: UserId,
        user_b: UserId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, message, type, location_data, created_at, is_read
             FROM messages
             WHERE ((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))
               AND type = 'location' AND location_data IS NOT NULL
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(user_a.0)
        .bind(user_b.0)
        .bind(user_b.0)
        .bind(user_a.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Flips every unread message from `counterpart_id` to `recipient_id` to
    /// read, returning the number of rows that changed. Idempotent.
    pub async fn mark_read(&self, recipient_id: UserId, counterpart_id: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1
             WHERE receiver_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(recipient_id.0)
        .bind(counterpart_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Unread messages addressed to the recipient, across all counterparts.
    pub async fn unread_count(&self, recipient_id: UserId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE receiver_id = ? AND is_read = 0")
                .bind(recipient_id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage> {
    let kind = match row.get::<String, _>(4).as_str() {
        "location" => MessageKind::Location,
        _ => MessageKind::Text,
    };
    let location = row
        .get::<Option<String>, _>(5)
        .map(|raw| serde_json::from_str::<LocationPayload>(&raw))
        .transpose()
        .context("stored location_data is not valid JSON")?;
    Ok(StoredMessage {
        message_id: MessageId(row.get::<i64, _>(0)),
        sender_id: UserId(row.get::<i64, _>(1)),
        receiver_id: UserId(row.get::<i64, _>(2)),
        body: row.get::<String, _>(3),
        kind,
        location,
        created_at: row.get::<DateTime<Utc>, _>(6),
        is_read: row.get::<bool, _>(7),
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
