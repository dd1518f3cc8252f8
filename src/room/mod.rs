#![forbid(unsafe_code)]

// Room module - voice room membership and directed signal relay
pub mod types;

pub use types::{Departure, JoinOutcome, Participant, RoomError, RoomId};

use crate::signaling::connection::{Connection, ConnectionId};
use crate::signaling::protocol::{ParticipantView, ServerEvent, SignalView};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct Room {
    participants: HashMap<String, Participant>,
    next_seq: u64,
}

impl Room {
    fn others(&self, participant_id: &str) -> Vec<&Participant> {
        let mut others: Vec<_> = self
            .participants
            .values()
            .filter(|p| p.id != participant_id)
            .collect();
        others.sort_by_key(|p| p.seq);
        others
    }
}

struct Membership {
    room_id: RoomId,
    participant_id: String,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<RoomId, Room>,
    memberships: HashMap<ConnectionId, Membership>,
}

impl Registry {
    /// Removes the connection's membership, deleting its room if it empties.
    fn detach(&mut self, connection_id: ConnectionId) -> Option<Departure> {
        let membership = self.memberships.remove(&connection_id)?;
        let room = self.rooms.get_mut(&membership.room_id)?;
        let participant = room.participants.remove(&membership.participant_id)?;

        let remaining: Vec<_> = room
            .others(&participant.id)
            .into_iter()
            .map(|p| p.outbound.clone())
            .collect();
        let room_closed = room.participants.is_empty();
        if room_closed {
            self.rooms.remove(&membership.room_id);
            info!("Voice room {} is empty, cleaning up", membership.room_id);
        }

        info!(
            "Participant {} ({}) left voice room {}",
            participant.id, participant.email, membership.room_id
        );

        Some(Departure {
            room_id: membership.room_id,
            peer: participant.view(),
            remaining,
            room_closed,
        })
    }
}

/// Registry of voice rooms.
///
/// A connection is in at most one room at a time. All bookkeeping happens
/// under a single mutex that is never held while enqueueing to a connection;
/// callers deliver the notifications carried by [`JoinOutcome`] and
/// [`Departure`] after the registry has been updated.
#[derive(Default)]
pub struct RoomManager {
    registry: StdMutex<Registry>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds the connection to a room.
    ///
    /// Joining the room the connection is already in returns the current
    /// snapshot and nothing to notify. Joining a different room first leaves
    /// the old one; the returned [`JoinOutcome::departed`] carries that exit.
    pub fn join(&self, room_id: RoomId, conn: &Connection) -> Result<JoinOutcome, RoomError> {
        let mut registry = self.registry();

        // Checked under the lock so a closing connection cannot re-enter
        // after teardown has already detached it.
        if conn.is_closed() {
            return Err(RoomError::ConnectionClosed);
        }

        let mut departed = None;
        if let Some(existing) = registry.memberships.get(&conn.id()) {
            if existing.room_id == room_id {
                let participant_id = existing.participant_id.clone();
                if let Some(me) = registry
                    .rooms
                    .get(&room_id)
                    .and_then(|room| room.participants.get(&participant_id))
                {
                    let room = &registry.rooms[&room_id];
                    debug!("Connection {} already in voice room {}", conn.id(), room_id);
                    return Ok(JoinOutcome {
                        room_id,
                        me: me.view(),
                        participants: room.others(&participant_id).into_iter().map(Participant::view).collect(),
                        newly_joined: false,
                        notify: Vec::new(),
                        departed: None,
                    });
                }
            }
            departed = registry.detach(conn.id());
        }

        let room = registry.rooms.entry(room_id).or_default();

        let mut participant_id = Uuid::new_v4().simple().to_string();
        while room.participants.contains_key(&participant_id) {
            participant_id = Uuid::new_v4().simple().to_string();
        }

        let existing = room.others(&participant_id);
        let participants: Vec<ParticipantView> = existing.iter().map(|p| p.view()).collect();
        let notify = existing.iter().map(|p| p.outbound.clone()).collect();

        let principal = conn.principal();
        let participant = Participant {
            id: participant_id.clone(),
            email: principal.email.clone(),
            display_name: principal.display_name.clone(),
            outbound: conn.outbound().clone(),
            seq: room.next_seq,
        };
        room.next_seq += 1;
        let me = participant.view();
        room.participants.insert(participant_id.clone(), participant);

        registry.memberships.insert(
            conn.id(),
            Membership {
                room_id,
                participant_id: participant_id.clone(),
            },
        );

        info!(
            "Participant {} ({}) joined voice room {}",
            participant_id, principal.email, room_id
        );

        Ok(JoinOutcome {
            room_id,
            me,
            participants,
            newly_joined: true,
            notify,
            departed,
        })
    }

    /// Leaves `room_id`. Returns `None` if the connection was not in that room.
    pub fn leave(&self, room_id: RoomId, connection_id: ConnectionId) -> Option<Departure> {
        let mut registry = self.registry();
        match registry.memberships.get(&connection_id) {
            Some(m) if m.room_id == room_id => registry.detach(connection_id),
            _ => None,
        }
    }

    /// Leaves whatever room the connection is in. Used on teardown.
    pub fn leave_any(&self, connection_id: ConnectionId) -> Option<Departure> {
        self.registry().detach(connection_id)
    }

    /// Forwards an opaque payload to one participant of `room_id`.
    ///
    /// The target is resolved first, so signalling a participant that left
    /// (or a room that no longer exists) reports `TargetMissing` regardless of
    /// the sender's own state.
    pub fn signal(
        &self,
        room_id: RoomId,
        sender: ConnectionId,
        target: &str,
        payload: Value,
    ) -> Result<(), RoomError> {
        let (target_queue, signal) = {
            let registry = self.registry();
            let room = registry.rooms.get(&room_id).ok_or(RoomError::TargetMissing)?;
            let target = room.participants.get(target).ok_or(RoomError::TargetMissing)?;

            let from = registry
                .memberships
                .get(&sender)
                .filter(|m| m.room_id == room_id)
                .and_then(|m| room.participants.get(&m.participant_id))
                .ok_or(RoomError::NotJoined)?;

            (
                target.outbound.clone(),
                SignalView {
                    from: from.id.clone(),
                    email: from.email.clone(),
                    display_name: from.display_name.clone(),
                    payload,
                },
            )
        };

        target_queue.send_event(&ServerEvent::VoiceSignal {
            channel_id: room_id,
            signal,
        });
        Ok(())
    }

    /// The room and ephemeral id the connection currently holds.
    pub fn membership(&self, connection_id: ConnectionId) -> Option<(RoomId, String)> {
        self.registry()
            .memberships
            .get(&connection_id)
            .map(|m| (m.room_id, m.participant_id.clone()))
    }

    #[cfg(test)]
    pub fn participants_in(&self, room_id: RoomId) -> Vec<ParticipantView> {
        let registry = self.registry();
        registry
            .rooms
            .get(&room_id)
            .map(|room| room.others("").into_iter().map(Participant::view).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn contains_room(&self, room_id: RoomId) -> bool {
        self.registry().rooms.contains_key(&room_id)
    }

    pub fn room_count(&self) -> usize {
        self.registry().rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.registry().memberships.len()
    }

    pub fn participant_count_for_room(&self, room_id: RoomId) -> usize {
        self.registry()
            .rooms
            .get(&room_id)
            .map_or(0, |room| room.participants.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use serde_json::json;

    fn conn(email: &str) -> Connection {
        Connection::new(Principal::new(email, email.split('@').next().unwrap_or(email)), 16)
    }

    fn drain(conn: &Connection) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Some(frame) = conn.outbound().try_recv() {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }

    #[test]
    fn test_second_joiner_sees_first() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let b = conn("b@example.com");

        let first = rooms.join(3, &a).unwrap();
        assert!(first.participants.is_empty());
        assert!(first.notify.is_empty());

        let second = rooms.join(3, &b).unwrap();
        assert_eq!(second.participants, vec![first.me.clone()]);
        assert_eq!(second.notify.len(), 1);
        assert_ne!(second.me.id, first.me.id);
        assert!(!second.participants.iter().any(|p| p.id == second.me.id));
        assert_eq!(rooms.participant_count_for_room(3), 2);
    }

    #[test]
    fn test_repeated_join_is_idempotent() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let b = conn("b@example.com");
        rooms.join(3, &a).unwrap();

        let first = rooms.join(3, &b).unwrap();
        let again = rooms.join(3, &b).unwrap();
        assert!(first.newly_joined);
        assert!(!again.newly_joined);
        assert_eq!(first.me, again.me);
        assert_eq!(first.participants, again.participants);
        assert!(again.notify.is_empty());
        assert_eq!(rooms.participant_count_for_room(3), 2);
    }

    #[test]
    fn test_last_leave_deletes_room() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let joined = rooms.join(3, &a).unwrap();

        let departure = rooms.leave(3, a.id()).unwrap();
        assert_eq!(departure.peer, joined.me);
        assert!(departure.room_closed);
        assert!(departure.remaining.is_empty());
        assert!(!rooms.contains_room(3));
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.leave(3, a.id()).is_none());
    }

    #[test]
    fn test_leave_other_room_is_noop() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        rooms.join(3, &a).unwrap();
        assert!(rooms.leave(4, a.id()).is_none());
        assert_eq!(rooms.participant_count_for_room(3), 1);
    }

    #[test]
    fn test_joining_another_room_leaves_the_first() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let b = conn("b@example.com");
        rooms.join(3, &a).unwrap();
        let old = rooms.join(3, &b).unwrap();

        let moved = rooms.join(4, &b).unwrap();
        let departed = moved.departed.expect("implicit leave");
        assert_eq!(departed.room_id, 3);
        assert_eq!(departed.peer, old.me);
        assert_eq!(departed.remaining.len(), 1);
        assert!(!departed.room_closed);
        assert_ne!(moved.me.id, old.me.id);
        assert_eq!(rooms.membership(b.id()).map(|m| m.0), Some(4));
        assert_eq!(rooms.participant_count_for_room(3), 1);
    }

    #[test]
    fn test_rejoin_gets_fresh_identity() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let first = rooms.join(3, &a).unwrap();
        rooms.leave(3, a.id()).unwrap();
        let second = rooms.join(3, &a).unwrap();
        assert_ne!(first.me.id, second.me.id);
    }

    #[test]
    fn test_signal_reaches_only_target() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let b = conn("b@example.com");
        let c = conn("c@example.com");
        let a_id = rooms.join(3, &a).unwrap().me;
        let b_id = rooms.join(3, &b).unwrap().me;
        rooms.join(3, &c).unwrap();

        let payload = json!({"kind": "offer", "sdp": {"type": "offer", "sdp": "v=0"}, "extra": [1, 2]});
        rooms.signal(3, a.id(), &b_id.id, payload.clone()).unwrap();

        let events = drain(&b);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "voice:signal");
        assert_eq!(events[0]["signal"]["from"], a_id.id.as_str());
        assert_eq!(events[0]["signal"]["email"], "a@example.com");
        assert_eq!(events[0]["signal"]["payload"], payload);
        assert!(drain(&a).is_empty());
        assert!(drain(&c).is_empty());
    }

    #[test]
    fn test_signal_to_departed_target_is_missing() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let x = conn("x@example.com");
        let old = rooms.join(3, &a).unwrap().me;
        rooms.leave(3, a.id()).unwrap();

        assert_eq!(
            rooms.signal(3, x.id(), &old.id, json!({})),
            Err(RoomError::TargetMissing)
        );
    }

    #[test]
    fn test_signal_from_non_member_is_rejected() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        let x = conn("x@example.com");
        let target = rooms.join(3, &a).unwrap().me;
        assert_eq!(
            rooms.signal(3, x.id(), &target.id, json!({})),
            Err(RoomError::NotJoined)
        );
        assert_eq!(
            rooms.signal(3, x.id(), "ghost", json!({})),
            Err(RoomError::TargetMissing)
        );
    }

    #[test]
    fn test_closed_connection_cannot_join() {
        let rooms = RoomManager::new();
        let a = conn("a@example.com");
        assert!(a.begin_close());
        assert_eq!(rooms.join(3, &a).err(), Some(RoomError::ConnectionClosed));
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_participants_listed_in_join_order() {
        let rooms = RoomManager::new();
        let conns: Vec<_> = (0..5).map(|i| conn(&format!("u{i}@example.com"))).collect();
        let ids: Vec<_> = conns.iter().map(|c| rooms.join(9, c).unwrap().me.id).collect();
        let listed: Vec<_> = rooms.participants_in(9).into_iter().map(|p| p.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_concurrent_join_leave_leaves_no_rooms() {
        let rooms = std::sync::Arc::new(RoomManager::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let rooms = rooms.clone();
            tasks.push(tokio::spawn(async move {
                let c = conn(&format!("u{i}@example.com"));
                rooms.join(i % 4, &c).unwrap();
                tokio::task::yield_now().await;
                rooms.join((i + 1) % 4, &c).unwrap();
                rooms.leave_any(c.id()).unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.participant_count(), 0);
    }
}
