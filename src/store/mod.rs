#![forbid(unsafe_code)]

// Store module - persistence and access-control collaborators consumed by the gateway

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::auth::Principal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ChannelId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Text,
    Voice,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Text => "text",
            ChannelKind::Voice => "voice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(ChannelKind::Text),
            "voice" => Some(ChannelKind::Voice),
            _ => None,
        }
    }
}

/// A persisted chat message. Ids are assigned by the store and increase monotonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub channel_id: ChannelId,
    pub author_email: String,
    pub author_display_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Everything the relay needs from the outside world: channel lookup, access
/// decisions and message persistence. Implementations serialize their own writes.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Returns `None` when the channel does not exist.
    async fn channel_kind(&self, channel_id: ChannelId) -> Result<Option<ChannelKind>, StoreError>;

    async fn has_access(&self, principal: &Principal, channel_id: ChannelId) -> Result<bool, StoreError>;

    async fn save_message(
        &self,
        channel_id: ChannelId,
        author: &Principal,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Most recent messages of a channel, oldest first.
    async fn recent_messages(&self, channel_id: ChannelId, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_round_trips_through_text() {
        for kind in [ChannelKind::Text, ChannelKind::Voice] {
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::parse("video"), None);
    }
}
