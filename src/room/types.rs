#![forbid(unsafe_code)]

use crate::signaling::outbound::Outbound;
use crate::signaling::protocol::ParticipantView;
use crate::store::ChannelId;
use thiserror::Error;

/// Voice rooms are keyed by their channel id.
pub type RoomId = ChannelId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("signal target is not in the room")]
    TargetMissing,

    #[error("connection is not a member of the room")]
    NotJoined,

    #[error("connection is closing")]
    ConnectionClosed,
}

/// One connection's membership in a voice room
#[derive(Clone)]
pub struct Participant {
    /// Ephemeral handle, fresh on every join
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub outbound: Outbound,
    pub(crate) seq: u64,
}

impl Participant {
    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            id: self.id.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// A participant removed from a room, with the queues that should hear about it.
pub struct Departure {
    pub room_id: RoomId,
    pub peer: ParticipantView,
    pub remaining: Vec<Outbound>,
    pub room_closed: bool,
}

pub struct JoinOutcome {
    pub room_id: RoomId,
    pub me: ParticipantView,
    /// Everyone else in the room, in join order
    pub participants: Vec<ParticipantView>,
    /// False when the connection was already in this room
    pub newly_joined: bool,
    /// Existing members to tell about the newcomer. Empty on a repeated join.
    pub notify: Vec<Outbound>,
    /// Set when joining moved the connection out of another room
    pub departed: Option<Departure>,
}
