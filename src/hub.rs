#![forbid(unsafe_code)]

// Chat topic registry - channel id to subscribed connections, with fan-out

use crate::signaling::connection::{Connection, ConnectionId};
use crate::signaling::outbound::{Enqueued, Outbound};
use crate::signaling::protocol::ServerEvent;
use crate::store::ChannelId;
use std::collections::HashMap;
use std::sync::{RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Recipients whose queue was full and lost its oldest frame
    pub displaced: usize,
}

/// Holds only queue handles, never the connections themselves. Channels with
/// no subscribers are removed as soon as the last one leaves.
#[derive(Default)]
pub struct ChannelHub {
    channels: StdRwLock<HashMap<ChannelId, HashMap<ConnectionId, Outbound>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ChannelId, HashMap<ConnectionId, Outbound>>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ChannelId, HashMap<ConnectionId, Outbound>>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds the connection to a channel. Returns false if it was already
    /// subscribed or is closing.
    pub fn subscribe(&self, conn: &Connection, channel_id: ChannelId) -> bool {
        let mut channels = self.write();
        if conn.is_closed() {
            return false;
        }
        let added = channels
            .entry(channel_id)
            .or_default()
            .insert(conn.id(), conn.outbound().clone())
            .is_none();
        if added {
            debug!("Connection {} subscribed to channel {}", conn.id(), channel_id);
        }
        added
    }

    pub fn unsubscribe(&self, connection_id: ConnectionId, channel_id: ChannelId) -> bool {
        let mut channels = self.write();
        let Some(members) = channels.get_mut(&channel_id) else {
            return false;
        };
        let removed = members.remove(&connection_id).is_some();
        if members.is_empty() {
            channels.remove(&channel_id);
            debug!("Channel {} has no subscribers, removing", channel_id);
        }
        removed
    }

    /// Drops the connection from every channel. Returns how many it was in.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> usize {
        let mut channels = self.write();
        let mut removed = 0;
        channels.retain(|_, members| {
            if members.remove(&connection_id).is_some() {
                removed += 1;
            }
            !members.is_empty()
        });
        removed
    }

    /// Delivers the event to every current subscriber.
    ///
    /// The member list is copied under the read lock and the frame is pushed
    /// after it is released, so a slow recipient never holds up the registry.
    pub fn broadcast(&self, channel_id: ChannelId, event: &ServerEvent) -> Delivery {
        let targets: Vec<Outbound> = {
            let channels = self.read();
            match channels.get(&channel_id) {
                Some(members) => members.values().cloned().collect(),
                None => return Delivery::default(),
            }
        };

        let Some(frame) = event.encode() else {
            return Delivery::default();
        };

        let mut delivery = Delivery::default();
        for target in targets {
            match target.push(frame.clone()) {
                Enqueued::Queued => delivery.delivered += 1,
                Enqueued::DisplacedOldest => {
                    delivery.delivered += 1;
                    delivery.displaced += 1;
                }
                Enqueued::Discarded => {}
            }
        }
        delivery
    }

    pub fn subscriber_count(&self, channel_id: ChannelId) -> usize {
        self.read().get(&channel_id).map_or(0, HashMap::len)
    }

    pub fn channel_count(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use std::sync::Arc;

    fn conn(email: &str) -> Connection {
        Connection::new(Principal::new(email, "User"), 4)
    }

    fn event(n: i64) -> ServerEvent {
        ServerEvent::Unsubscribed { channel_id: n }
    }

    #[test]
    fn test_broadcast_reaches_subscribers_once() {
        let hub = ChannelHub::new();
        let a = conn("a@example.com");
        let b = conn("b@example.com");
        let outsider = conn("c@example.com");
        assert!(hub.subscribe(&a, 7));
        assert!(!hub.subscribe(&a, 7));
        hub.subscribe(&b, 7);
        hub.subscribe(&outsider, 8);

        let delivery = hub.broadcast(7, &event(1));
        assert_eq!(delivery.delivered, 2);
        assert_eq!(a.outbound().len(), 1);
        assert_eq!(b.outbound().len(), 1);
        assert!(outsider.outbound().is_empty());
    }

    #[test]
    fn test_empty_channels_are_removed() {
        let hub = ChannelHub::new();
        let a = conn("a@example.com");
        let b = conn("b@example.com");
        hub.subscribe(&a, 7);
        hub.subscribe(&b, 7);
        hub.subscribe(&a, 8);

        assert!(hub.unsubscribe(a.id(), 7));
        assert_eq!(hub.subscriber_count(7), 1);
        assert_eq!(hub.remove_connection(a.id()), 1);
        assert_eq!(hub.channel_count(), 1);
        assert!(hub.unsubscribe(b.id(), 7));
        assert_eq!(hub.channel_count(), 0);
        assert!(!hub.unsubscribe(b.id(), 7));
    }

    #[test]
    fn test_slow_subscriber_does_not_block_others() {
        let hub = ChannelHub::new();
        let slow = conn("slow@example.com");
        let fast = conn("fast@example.com");
        hub.subscribe(&slow, 1);
        hub.subscribe(&fast, 1);

        for n in 0..10 {
            hub.broadcast(1, &event(n));
            fast.outbound().try_recv();
        }
        assert_eq!(slow.outbound().len(), 4);
        assert_eq!(slow.outbound().dropped(), 6);
        assert!(fast.outbound().is_empty());
    }

    #[test]
    fn test_closing_connection_cannot_subscribe() {
        let hub = ChannelHub::new();
        let a = conn("a@example.com");
        a.begin_close();
        assert!(!hub.subscribe(&a, 1));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_during_churn_never_duplicates() {
        let hub = Arc::new(ChannelHub::new());
        let steady = Arc::new(Connection::new(Principal::new("s@example.com", "S"), 1024));
        hub.subscribe(&steady, 5);

        let churn = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let c = conn(&format!("c{i}@example.com"));
                    hub.subscribe(&c, 5);
                    tokio::task::yield_now().await;
                    hub.remove_connection(c.id());
                }
            })
        };
        for n in 0..200 {
            hub.broadcast(5, &event(n));
            tokio::task::yield_now().await;
        }
        churn.await.unwrap();

        assert_eq!(steady.outbound().len(), 200);
        assert_eq!(hub.subscriber_count(5), 1);
    }
}
