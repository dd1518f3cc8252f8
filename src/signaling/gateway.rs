#![forbid(unsafe_code)]

// Session gateway - validates client events and applies them to the hub,
// the voice rooms and the store

use super::connection::{Connection, ConnectionId};
use super::error::GatewayError;
use super::protocol::{ChannelRef, ClientEvent, MessageView, ServerEvent};
use crate::auth::Principal;
use crate::config::Limits;
use crate::hub::ChannelHub;
use crate::metrics::{RegistrySizes, ServerMetrics};
use crate::room::{Departure, RoomId, RoomManager};
use crate::store::{ChannelId, ChannelKind, ChatStore};
use crate::turn::IceDirectory;
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock as StdRwLock};
use tracing::{debug, error, info};

type GatewayResult = Result<(), GatewayError>;

fn positive(channel_id: Option<ChannelRef>) -> Option<ChannelId> {
    channel_id.and_then(ChannelRef::id)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

pub struct Gateway {
    hub: ChannelHub,
    rooms: RoomManager,
    store: Arc<dyn ChatStore>,
    ice: IceDirectory,
    metrics: ServerMetrics,
    limits: Limits,
    connections: StdRwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Gateway {
    pub fn new(store: Arc<dyn ChatStore>, ice: IceDirectory, metrics: ServerMetrics, limits: Limits) -> Self {
        Self {
            hub: ChannelHub::new(),
            rooms: RoomManager::new(),
            store,
            ice,
            metrics,
            limits,
            connections: StdRwLock::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    /// Registers a new connection for an authenticated principal.
    pub fn open(&self, principal: Principal) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(principal, self.limits.outbound_capacity));
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.id(), conn.clone());
        self.metrics.inc_connections_total();
        conn
    }

    /// Handles one inbound event to completion.
    ///
    /// Rejections and panics are reported to this connection only, as an
    /// error event; the connection stays open.
    pub async fn handle(&self, conn: &Connection, event: ClientEvent) {
        let name = event.name();
        match AssertUnwindSafe(self.dispatch(conn, event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.reject(conn, name, err),
            Err(panic) => {
                error!(
                    "Panic while handling {} from {}: {}",
                    name,
                    conn.id(),
                    panic_message(&*panic)
                );
                self.reject(conn, name, GatewayError::Internal(anyhow::anyhow!("handler panicked")));
            }
        }
    }

    /// Answers a frame the protocol has no use for (binary data).
    pub fn reject_unsupported(&self, conn: &Connection) {
        self.reject(conn, "binary", GatewayError::UnsupportedEvent);
    }

    fn reject(&self, conn: &Connection, event: &str, err: GatewayError) {
        match &err {
            GatewayError::Internal(cause) => {
                error!("Failed to handle {} from {}: {:#}", event, conn.id(), cause);
            }
            other => debug!("Rejected {} from {}: {}", event, conn.id(), other),
        }
        self.metrics.inc_errors();
        conn.send(&err.to_event());
    }

    async fn dispatch(&self, conn: &Connection, event: ClientEvent) -> GatewayResult {
        match event {
            ClientEvent::Subscribe { channel_id } => self.subscribe(conn, channel_id).await,
            ClientEvent::Unsubscribe { channel_id } => self.unsubscribe(conn, channel_id),
            ClientEvent::Message { channel_id, content } => self.post_message(conn, channel_id, &content).await,
            ClientEvent::VoiceJoin { channel_id } => self.voice_join(conn, channel_id).await,
            ClientEvent::VoiceLeave { channel_id } => self.voice_leave(conn, channel_id).await,
            ClientEvent::VoiceSignal { channel_id, target, payload } => {
                self.voice_signal(conn, channel_id, &target, payload).await
            }
            ClientEvent::Unsupported => Err(GatewayError::UnsupportedEvent),
        }
    }

    async fn subscribe(&self, conn: &Connection, channel_id: Option<ChannelRef>) -> GatewayResult {
        let channel_id = positive(channel_id).ok_or(GatewayError::InvalidChannel)?;

        if self.store.channel_kind(channel_id).await?.is_none() {
            return Err(GatewayError::NotFound);
        }
        if !self.store.has_access(conn.principal(), channel_id).await? {
            return Err(GatewayError::Forbidden);
        }
        if conn.is_subscribed(channel_id) {
            return Ok(());
        }

        // History is read before joining the hub so no message can appear both
        // in the backlog and as a live event.
        let history = self
            .store
            .recent_messages(channel_id, self.limits.history_limit)
            .await?;

        if !conn.add_subscription(channel_id) || !self.hub.subscribe(conn, channel_id) {
            return Ok(());
        }

        conn.send(&ServerEvent::Subscribed {
            channel_id,
            history: history.into_iter().map(MessageView::from).collect(),
        });
        Ok(())
    }

    fn unsubscribe(&self, conn: &Connection, channel_id: Option<ChannelRef>) -> GatewayResult {
        let channel_id = positive(channel_id).ok_or(GatewayError::InvalidChannel)?;
        if conn.remove_subscription(channel_id) {
            self.hub.unsubscribe(conn.id(), channel_id);
            conn.send(&ServerEvent::Unsubscribed { channel_id });
        }
        Ok(())
    }

    async fn post_message(&self, conn: &Connection, channel_id: Option<ChannelRef>, content: &str) -> GatewayResult {
        let content = content.trim();
        let channel_id = positive(channel_id).ok_or(GatewayError::InvalidMessage)?;
        if content.is_empty() {
            return Err(GatewayError::InvalidMessage);
        }
        if !conn.is_subscribed(channel_id) {
            return Err(GatewayError::NotSubscribed);
        }
        let max = self.limits.max_message_chars;
        if content.chars().count() > max {
            return Err(GatewayError::TooLong { max });
        }

        let mut stored = self.store.save_message(channel_id, conn.principal(), content).await?;
        if stored.author_display_name.is_empty() {
            stored.author_display_name = conn.principal().display_name.clone();
        }
        self.metrics.inc_chat_messages();

        let delivery = self.hub.broadcast(
            channel_id,
            &ServerEvent::Message {
                channel_id,
                message: stored.into(),
            },
        );
        debug!(
            "Message from {} in channel {} delivered to {} subscriber(s)",
            conn.id(),
            channel_id,
            delivery.delivered
        );
        Ok(())
    }

    /// Resolves a voice channel the principal may use.
    async fn voice_channel(&self, conn: &Connection, channel_id: Option<ChannelRef>) -> Result<RoomId, GatewayError> {
        let channel_id = positive(channel_id).ok_or(GatewayError::VoiceInvalid)?;
        match self.store.channel_kind(channel_id).await? {
            None => return Err(GatewayError::NotFound),
            Some(ChannelKind::Text) => return Err(GatewayError::VoiceInvalid),
            Some(ChannelKind::Voice) => {}
        }
        if !self.store.has_access(conn.principal(), channel_id).await? {
            return Err(GatewayError::Forbidden);
        }
        Ok(channel_id)
    }

    async fn voice_join(&self, conn: &Connection, channel_id: Option<ChannelRef>) -> GatewayResult {
        let room_id = self.voice_channel(conn, channel_id).await?;
        let outcome = self.rooms.join(room_id, conn)?;

        if let Some(departure) = outcome.departed {
            self.announce_departure(departure);
        }

        if outcome.newly_joined {
            self.metrics.inc_voice_joins();
            let joined = ServerEvent::VoicePeerJoined {
                channel_id: room_id,
                peer: outcome.me.clone(),
            };
            if let Some(frame) = joined.encode() {
                for peer in &outcome.notify {
                    peer.push(frame.clone());
                }
            }
        }

        let ice_servers = self.ice.servers_for(&outcome.me.id);
        conn.send(&ServerEvent::VoiceParticipants {
            channel_id: room_id,
            participants: outcome.participants,
            me: outcome.me,
            ice_servers,
        });
        Ok(())
    }

    async fn voice_leave(&self, conn: &Connection, channel_id: Option<ChannelRef>) -> GatewayResult {
        let room_id = self.voice_channel(conn, channel_id).await?;
        if let Some(departure) = self.rooms.leave(room_id, conn.id()) {
            self.announce_departure(departure);
        }
        Ok(())
    }

    async fn voice_signal(
        &self,
        conn: &Connection,
        channel_id: Option<ChannelRef>,
        target: &str,
        payload: Value,
    ) -> GatewayResult {
        // channelId is optional here, but if present it must be usable.
        let requested = match channel_id {
            None => None,
            Some(reference) => Some(reference.id().ok_or(GatewayError::VoiceInvalid)?),
        };
        let (room_id, _) = self
            .rooms
            .membership(conn.id())
            .ok_or(GatewayError::VoiceNotJoined)?;
        if requested.is_some_and(|requested| requested != room_id) {
            return Err(GatewayError::VoiceNotJoined);
        }
        if target.is_empty() {
            return Err(GatewayError::VoiceTargetMissing);
        }

        self.voice_channel(conn, Some(room_id.into())).await?;
        self.rooms.signal(room_id, conn.id(), target, payload)?;
        self.metrics.inc_signals_relayed();
        Ok(())
    }

    fn announce_departure(&self, departure: Departure) {
        self.metrics.inc_voice_leaves();
        let left = ServerEvent::VoicePeerLeft {
            channel_id: departure.room_id,
            peer: departure.peer,
        };
        if let Some(frame) = left.encode() {
            for peer in &departure.remaining {
                peer.push(frame.clone());
            }
        }
    }

    /// Tears the connection down. Safe to call from any number of places; only
    /// the first call does the work.
    pub fn disconnect(&self, conn: &Connection) {
        if !conn.begin_close() {
            return;
        }

        if let Some(departure) = self.rooms.leave_any(conn.id()) {
            self.announce_departure(departure);
        }
        let channels = self.hub.remove_connection(conn.id());
        conn.clear_subscriptions();
        conn.outbound().close();
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn.id());

        info!(
            "Connection {} ({}) closed, left {} channel(s)",
            conn.id(),
            conn.principal().email,
            channels
        );
    }

    /// Closes every live connection of a principal, e.g. on logout.
    pub fn disconnect_user(&self, email: &str) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.principal().email == email)
            .cloned()
            .collect();

        for conn in &targets {
            self.disconnect(conn);
        }
        if !targets.is_empty() {
            info!("Disconnected {} connection(s) for {}", targets.len(), email);
        }
        targets.len()
    }

    /// Closes every live connection. Used on process shutdown.
    pub fn shutdown(&self) -> usize {
        let all: Vec<Arc<Connection>> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for conn in &all {
            self.disconnect(conn);
        }
        info!("Closed {} connection(s) on shutdown", all.len());
        all.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn sizes(&self) -> RegistrySizes {
        RegistrySizes {
            connections: self.connection_count(),
            channels: self.hub.channel_count(),
            rooms: self.rooms.room_count(),
            participants: self.rooms.participant_count(),
        }
    }
}
