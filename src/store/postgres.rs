#![forbid(unsafe_code)]

// PostgreSQL-backed ChatStore. Access is granted through membership of the
// server that owns the channel.

use super::{ChannelId, ChannelKind, ChatStore, StoreError, StoredMessage};
use crate::auth::Principal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    channel_id: i64,
    author_email: String,
    author_display_name: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for StoredMessage {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            channel_id: row.channel_id,
            author_email: row.author_email,
            author_display_name: row.author_display_name,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn channel_kind(&self, channel_id: ChannelId) -> Result<Option<ChannelKind>, StoreError> {
        let kind = sqlx::query_scalar::<_, String>("SELECT kind FROM channels WHERE id = $1")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;

        kind.map(|k| {
            ChannelKind::parse(&k)
                .ok_or_else(|| StoreError::InvalidData(format!("channel {channel_id} has kind {k:?}")))
        })
        .transpose()
    }

    async fn has_access(&self, principal: &Principal, channel_id: ChannelId) -> Result<bool, StoreError> {
        let allowed: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM channels c
                JOIN server_members m ON m.server_id = c.server_id
                WHERE c.id = $1 AND m.user_email = $2
            )",
        )
        .bind(channel_id)
        .bind(&principal.email)
        .fetch_one(&self.pool)
        .await?;
        Ok(allowed)
    }

    async fn save_message(
        &self,
        channel_id: ChannelId,
        author: &Principal,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "WITH inserted AS (
                INSERT INTO channel_messages (channel_id, author_email, content)
                VALUES ($1, $2, $3)
                RETURNING id, channel_id, author_email, content, created_at
            )
            SELECT i.id, i.channel_id, i.author_email,
                   COALESCE(u.display_name, '') AS author_display_name,
                   i.content, i.created_at
            FROM inserted i
            LEFT JOIN users u ON u.email = i.author_email",
        )
        .bind(channel_id)
        .bind(&author.email)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn recent_messages(&self, channel_id: ChannelId, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT m.id, m.channel_id, m.author_email,
                    COALESCE(u.display_name, '') AS author_display_name,
                    m.content, m.created_at
             FROM channel_messages m
             LEFT JOIN users u ON u.email = m.author_email
             WHERE m.channel_id = $1
             ORDER BY m.id DESC
             LIMIT $2",
        )
        .bind(channel_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<StoredMessage> = rows.into_iter().map(StoredMessage::from).collect();
        messages.reverse();
        Ok(messages)
    }
}
