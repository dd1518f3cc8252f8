#![forbid(unsafe_code)]

// Signaling protocol - JSON events exchanged over the WebSocket

use super::outbound::Frame;
use crate::store::{ChannelId, StoredMessage};
use crate::turn::IceServer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// A `channelId` as the client sent it. Anything that is not an integer
/// decodes to [`ChannelRef::Invalid`] so the handler can answer with its own
/// validation code instead of rejecting the whole event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRef {
    Id(ChannelId),
    Invalid,
}

impl ChannelRef {
    /// The referenced channel, if it is a usable (positive) id.
    pub fn id(self) -> Option<ChannelId> {
        match self {
            ChannelRef::Id(id) if id > 0 => Some(id),
            _ => None,
        }
    }
}

impl From<ChannelId> for ChannelRef {
    fn from(id: ChannelId) -> Self {
        ChannelRef::Id(id)
    }
}

impl<'de> Deserialize<'de> for ChannelRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value.as_i64().map_or(ChannelRef::Invalid, ChannelRef::Id))
    }
}

impl Serialize for ChannelRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ChannelRef::Id(id) => serializer.serialize_i64(*id),
            ChannelRef::Invalid => serializer.serialize_none(),
        }
    }
}

// Non-string content or target reads as empty, which the handlers reject.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        _ => String::new(),
    })
}

/// Client-to-Server events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Start receiving chat messages for a channel
    #[serde(rename = "subscribe", rename_all = "camelCase")]
    Subscribe {
        #[serde(default)]
        channel_id: Option<ChannelRef>,
    },
    #[serde(rename = "unsubscribe", rename_all = "camelCase")]
    Unsubscribe {
        #[serde(default)]
        channel_id: Option<ChannelRef>,
    },
    /// Post a chat message to a subscribed channel
    #[serde(rename = "message", rename_all = "camelCase")]
    Message {
        #[serde(default)]
        channel_id: Option<ChannelRef>,
        #[serde(default, deserialize_with = "lenient_string")]
        content: String,
    },
    #[serde(rename = "voice:join", rename_all = "camelCase")]
    VoiceJoin {
        #[serde(default)]
        channel_id: Option<ChannelRef>,
    },
    #[serde(rename = "voice:leave", rename_all = "camelCase")]
    VoiceLeave {
        #[serde(default)]
        channel_id: Option<ChannelRef>,
    },
    /// Opaque negotiation payload for one participant of the sender's room
    #[serde(rename = "voice:signal", rename_all = "camelCase")]
    VoiceSignal {
        #[serde(default)]
        channel_id: Option<ChannelRef>,
        #[serde(default, deserialize_with = "lenient_string")]
        target: String,
        #[serde(default)]
        payload: Value,
    },
    /// Any event type this server does not understand
    #[serde(other)]
    Unsupported,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Subscribe { .. } => "subscribe",
            ClientEvent::Unsubscribe { .. } => "unsubscribe",
            ClientEvent::Message { .. } => "message",
            ClientEvent::VoiceJoin { .. } => "voice:join",
            ClientEvent::VoiceLeave { .. } => "voice:leave",
            ClientEvent::VoiceSignal { .. } => "voice:signal",
            ClientEvent::Unsupported => "unsupported",
        }
    }
}

/// Decodes one inbound text frame.
///
/// Text that is not a JSON object is a protocol violation and is returned as an
/// error. An object whose `type` is missing or unknown decodes to
/// [`ClientEvent::Unsupported`]; ill-typed fields of a known event are kept
/// for the handler to reject.
pub fn decode_client_event(text: &str) -> Result<ClientEvent, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(serde::de::Error::custom("event must be a JSON object"));
    }
    Ok(serde_json::from_value(value).unwrap_or_else(|e| {
        debug!("Event does not match any known shape: {}", e);
        ClientEvent::Unsupported
    }))
}

/// Server-to-Client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Chat message broadcast to channel subscribers
    #[serde(rename = "message", rename_all = "camelCase")]
    Message {
        channel_id: ChannelId,
        message: MessageView,
    },
    /// Subscription accepted, with the channel's recent history
    #[serde(rename = "subscribed", rename_all = "camelCase")]
    Subscribed {
        channel_id: ChannelId,
        history: Vec<MessageView>,
    },
    #[serde(rename = "unsubscribed", rename_all = "camelCase")]
    Unsubscribed {
        channel_id: ChannelId,
    },
    #[serde(rename = "error")]
    Error {
        code: String,
        error: String,
    },
    /// Reply to the joiner: everyone else in the room plus its own identity
    #[serde(rename = "voice:participants", rename_all = "camelCase")]
    VoiceParticipants {
        channel_id: ChannelId,
        participants: Vec<ParticipantView>,
        #[serde(rename = "self")]
        me: ParticipantView,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
    },
    #[serde(rename = "voice:peer-joined", rename_all = "camelCase")]
    VoicePeerJoined {
        channel_id: ChannelId,
        peer: ParticipantView,
    },
    #[serde(rename = "voice:peer-left", rename_all = "camelCase")]
    VoicePeerLeft {
        channel_id: ChannelId,
        peer: ParticipantView,
    },
    #[serde(rename = "voice:signal", rename_all = "camelCase")]
    VoiceSignal {
        channel_id: ChannelId,
        signal: SignalView,
    },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            error: message.into(),
        }
    }

    /// Serializes once; the resulting frame can be shared by any number of queues.
    pub fn encode(&self) -> Option<Frame> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize server event: {}", e);
                None
            }
        }
    }
}

/// Voice participant as seen by other clients. `id` is the ephemeral
/// per-membership handle used to address signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalView {
    pub from: String,
    pub email: String,
    pub display_name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: i64,
    pub channel_id: ChannelId,
    pub author_email: String,
    pub author_display_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for MessageView {
    fn from(msg: StoredMessage) -> Self {
        Self {
            id: msg.id,
            channel_id: msg.channel_id,
            author_email: msg.author_email,
            author_display_name: msg.author_display_name,
            content: msg.content,
            created_at: msg.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_known_events() {
        assert_eq!(
            decode_client_event(r#"{"type":"subscribe","channelId":7}"#).unwrap(),
            ClientEvent::Subscribe { channel_id: Some(ChannelRef::Id(7)) }
        );
        assert_eq!(
            decode_client_event(r#"{"type":"message","channelId":7,"content":"hi"}"#).unwrap(),
            ClientEvent::Message { channel_id: Some(ChannelRef::Id(7)), content: "hi".into() }
        );
        assert_eq!(
            decode_client_event(r#"{"type":"voice:join"}"#).unwrap(),
            ClientEvent::VoiceJoin { channel_id: None }
        );
    }

    #[test]
    fn test_signal_payload_is_kept_verbatim() {
        let raw = json!({
            "type": "voice:signal",
            "target": "abc",
            "payload": {"kind": "candidate", "candidate": {"sdpMid": "0", "extra": [1, 2, {"x": null}]}}
        });
        match decode_client_event(&raw.to_string()).unwrap() {
            ClientEvent::VoiceSignal { target, payload, channel_id } => {
                assert_eq!(target, "abc");
                assert_eq!(channel_id, None);
                assert_eq!(payload, raw["payload"]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_types_are_unsupported() {
        assert_eq!(decode_client_event(r#"{"type":"typing"}"#).unwrap(), ClientEvent::Unsupported);
        assert_eq!(decode_client_event(r#"{"content":"no type"}"#).unwrap(), ClientEvent::Unsupported);
        assert_eq!(decode_client_event(r#"{"type":42}"#).unwrap(), ClientEvent::Unsupported);
    }

    #[test]
    fn test_ill_typed_fields_keep_the_event_kind() {
        assert_eq!(
            decode_client_event(r#"{"type":"subscribe","channelId":"seven"}"#).unwrap(),
            ClientEvent::Subscribe { channel_id: Some(ChannelRef::Invalid) }
        );
        assert_eq!(
            decode_client_event(r#"{"type":"voice:join","channelId":2.5}"#).unwrap(),
            ClientEvent::VoiceJoin { channel_id: Some(ChannelRef::Invalid) }
        );
        assert_eq!(
            decode_client_event(r#"{"type":"message","channelId":1,"content":{"text":"hi"}}"#).unwrap(),
            ClientEvent::Message { channel_id: Some(ChannelRef::Id(1)), content: String::new() }
        );
        match decode_client_event(r#"{"type":"voice:signal","channelId":null,"target":7}"#).unwrap() {
            ClientEvent::VoiceSignal { channel_id, target, .. } => {
                assert_eq!(channel_id, None);
                assert!(target.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_channel_ref_usable_ids() {
        assert_eq!(ChannelRef::Id(3).id(), Some(3));
        assert_eq!(ChannelRef::Id(0).id(), None);
        assert_eq!(ChannelRef::Id(-4).id(), None);
        assert_eq!(ChannelRef::Invalid.id(), None);
    }

    #[test]
    fn test_non_object_frames_are_rejected() {
        assert!(decode_client_event("not json").is_err());
        assert!(decode_client_event("[1,2,3]").is_err());
        assert!(decode_client_event("\"subscribe\"").is_err());
    }

    #[test]
    fn test_participants_event_shape() {
        let me = ParticipantView { id: "p2".into(), email: "b@x".into(), display_name: "B".into() };
        let event = ServerEvent::VoiceParticipants {
            channel_id: 3,
            participants: vec![ParticipantView { id: "p1".into(), email: "a@x".into(), display_name: "A".into() }],
            me,
            ice_servers: vec![],
        };
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "voice:participants");
        assert_eq!(value["channelId"], 3);
        assert_eq!(value["self"]["id"], "p2");
        assert_eq!(value["participants"][0]["displayName"], "A");
        assert!(value.get("iceServers").is_none());
    }

    #[test]
    fn test_error_event_shape() {
        let value: Value = serde_json::from_str(&ServerEvent::error("too_long", "message too long").encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "error", "code": "too_long", "error": "message too long"}));
    }
}
