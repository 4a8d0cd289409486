use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parley_core::{message_timestamp_now, DeliveryStatus, Message};
use sqlx::FromRow;

use crate::StoragePool;

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    message_id: i64,
    sender: String,
    receiver: String,
    body: String,
    sent_at: DateTime<Utc>,
    status: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let status: DeliveryStatus = row
            .status
            .parse()
            .map_err(|err: String| anyhow!("message {}: {err}", row.message_id))?;
        Ok(Message {
            id: row.message_id,
            sender: row.sender,
            receiver: row.receiver,
            text: row.body,
            timestamp: row.sent_at,
            status,
        })
    }
}

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
        status: DeliveryStatus,
    ) -> Result<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (sender, receiver, body, sent_at, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING message_id, sender, receiver, body, sent_at, status
            "#,
        )
        .bind(sender)
        .bind(receiver)
        .bind(text)
        .bind(message_timestamp_now())
        .bind(status.as_str())
        .fetch_one(self.pool.pool())
        .await?;
        row.try_into()
    }

    pub async fn find_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT message_id, sender, receiver, body, sent_at, status
            FROM messages
            WHERE ((sender = $1 AND receiver = $2) OR (sender = $2 AND receiver = $1))
              AND sent_at = $3
            ORDER BY message_id ASC
            LIMIT 1
            "#,
        )
        .bind(sender)
        .bind(receiver)
        .bind(timestamp)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Message::try_from).transpose()
    }

    /// Flags the earliest matching message that is still `sent` as delivered.
    /// Returns whether any message from `sender` carries `timestamp`.
    pub async fn mark_delivered(&self, sender: &str, timestamp: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE messages
            SET status = 'delivered'
            WHERE message_id = (
                SELECT message_id
                FROM messages
                WHERE sender = $1 AND sent_at = $2
                ORDER BY (status = 'delivered') ASC, message_id ASC
                LIMIT 1
                FOR UPDATE
            )
            RETURNING message_id
            "#,
        )
        .bind(sender)
        .bind(timestamp)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(updated.is_some())
    }

    pub async fn delete_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let deleted = sqlx::query_scalar::<_, i64>(
            r#"
            DELETE FROM messages
            WHERE message_id = (
                SELECT message_id
                FROM messages
                WHERE ((sender = $1 AND receiver = $2) OR (sender = $2 AND receiver = $1))
                  AND sent_at = $3
                ORDER BY message_id ASC
                LIMIT 1
                FOR UPDATE
            )
            RETURNING message_id
            "#,
        )
        .bind(sender)
        .bind(receiver)
        .bind(timestamp)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(deleted.is_some())
    }

    pub async fn history(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT message_id, sender, receiver, body, sent_at, status
            FROM messages
            WHERE (sender = $1 AND receiver = $2) OR (sender = $2 AND receiver = $1)
            ORDER BY sent_at ASC, message_id ASC
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_all(self.pool.pool())
        .await?
        .into_iter()
        .map(Message::try_from)
        .collect()
    }
}
