#![forbid(unsafe_code)]

use super::protocol::ServerEvent;
use crate::room::RoomError;
use crate::store::StoreError;
use thiserror::Error;

/// Rejections reported to the originating connection as `{type:"error"}` events.
/// None of them closes the connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("channel id required")]
    InvalidChannel,

    #[error("channel and content required")]
    InvalidMessage,

    #[error("voice channel required")]
    VoiceInvalid,

    #[error("channel not found")]
    NotFound,

    #[error("no access to channel")]
    Forbidden,

    #[error("subscribe before sending")]
    NotSubscribed,

    #[error("message too long (max {max} characters)")]
    TooLong { max: usize },

    #[error("join a voice channel before signaling")]
    VoiceNotJoined,

    #[error("signal target is not in the room")]
    VoiceTargetMissing,

    #[error("unsupported event type")]
    UnsupportedEvent,

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidChannel => "invalid_channel",
            GatewayError::InvalidMessage => "invalid_message",
            GatewayError::VoiceInvalid => "voice_invalid",
            GatewayError::NotFound => "not_found",
            GatewayError::Forbidden => "forbidden",
            GatewayError::NotSubscribed => "not_subscribed",
            GatewayError::TooLong { .. } => "too_long",
            GatewayError::VoiceNotJoined => "voice_not_joined",
            GatewayError::VoiceTargetMissing => "voice_target_missing",
            GatewayError::UnsupportedEvent => "unsupported_event",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Client-facing event. Internal causes stay in the server log.
    pub fn to_event(&self) -> ServerEvent {
        match self {
            GatewayError::Internal(_) => ServerEvent::error(self.code(), "internal server error"),
            other => ServerEvent::error(other.code(), other.to_string()),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::Internal(e.into())
    }
}

impl From<RoomError> for GatewayError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::TargetMissing => GatewayError::VoiceTargetMissing,
            RoomError::NotJoined | RoomError::ConnectionClosed => GatewayError::VoiceNotJoined,
        }
    }
}
