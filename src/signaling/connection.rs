#![forbid(unsafe_code)]

// WebSocket connection handling for individual clients

use super::gateway::Gateway;
use super::outbound::{Enqueued, Outbound};
use super::protocol::{decode_client_event, ServerEvent};
use crate::auth::Principal;
use crate::config::HeartbeatConfig;
use crate::store::ChannelId;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// One live client session.
///
/// The hub and voice registries only hold this connection's id and a clone of
/// its outbound queue; the connection itself is owned by its socket task.
pub struct Connection {
    id: ConnectionId,
    principal: Principal,
    subscriptions: StdMutex<HashSet<ChannelId>>,
    outbound: Outbound,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(principal: Principal, outbound_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            subscriptions: StdMutex::new(HashSet::new()),
            outbound: Outbound::new(outbound_capacity),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn send(&self, event: &ServerEvent) -> Enqueued {
        self.outbound.send_event(event)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashSet<ChannelId>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_subscribed(&self, channel_id: ChannelId) -> bool {
        self.subscriptions().contains(&channel_id)
    }

    /// Returns false if the channel was already subscribed.
    pub fn add_subscription(&self, channel_id: ChannelId) -> bool {
        self.subscriptions().insert(channel_id)
    }

    pub fn remove_subscription(&self, channel_id: ChannelId) -> bool {
        self.subscriptions().remove(&channel_id)
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.subscriptions().clear();
    }

    /// Marks the connection closed. Only the first caller gets `true` and
    /// performs teardown.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Runs teardown if the socket task unwinds before reaching it.
struct DisconnectGuard {
    gateway: Arc<Gateway>,
    conn: Arc<Connection>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.gateway.disconnect(&self.conn);
    }
}

/// Serves one upgraded WebSocket until the client goes away, misses its
/// liveness deadline, or is disconnected by the server.
pub async fn handle_connection(
    socket: WebSocket,
    principal: Principal,
    gateway: Arc<Gateway>,
    heartbeat: HeartbeatConfig,
    _permit: OwnedSemaphorePermit,
) {
    let conn = gateway.open(principal);
    let _conn_guard = gateway.metrics().connection_active_guard();
    let _disconnect = DisconnectGuard {
        gateway: gateway.clone(),
        conn: conn.clone(),
    };

    info!(
        "New WebSocket connection {} for {}",
        conn.id(),
        conn.principal().email
    );

    let (ws_sender, ws_receiver) = socket.split();

    let mut write_task = tokio::spawn(write_loop(
        ws_sender,
        conn.outbound().clone(),
        heartbeat,
        gateway.clone(),
        conn.id(),
    ));

    let write_finished = tokio::select! {
        _ = read_loop(ws_receiver, &conn, &gateway, heartbeat.pong_wait) => false,
        _ = &mut write_task => true,
    };

    gateway.disconnect(&conn);

    if !write_finished {
        // The closed queue makes the write task send a close frame and exit.
        if tokio::time::timeout(heartbeat.write_wait, &mut write_task).await.is_err() {
            debug!("Write task for {} did not finish in time, aborting", conn.id());
            write_task.abort();
        }
    }

    info!("Connection handler finished for {}", conn.id());
}

/// Decodes frames and hands them to the gateway one at a time, so events from
/// one client are handled strictly in arrival order.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    conn: &Arc<Connection>,
    gateway: &Gateway,
    pong_wait: Duration,
) {
    loop {
        // Any frame, pongs included, refreshes the liveness deadline.
        let msg = match tokio::time::timeout(pong_wait, receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Read error on {}: {}", conn.id(), e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Liveness deadline missed for {}", conn.id());
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                gateway.metrics().inc_frames_received();
                let event = match decode_client_event(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Malformed frame from {}: {}", conn.id(), e);
                        break;
                    }
                };

                let start = Instant::now();
                gateway.handle(conn, event).await;
                gateway.metrics().observe_event_handling(start.elapsed());
            }
            Message::Binary(_) => {
                gateway.metrics().inc_frames_received();
                gateway.reject_unsupported(conn);
            }
            Message::Close(_) => {
                info!("Client {} closed connection", conn.id());
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Drains the outbound queue to the socket and emits heartbeat pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    outbound: Outbound,
    heartbeat: HeartbeatConfig,
    gateway: Arc<Gateway>,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(heartbeat.ping_interval);
    ping.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(json) = frame else {
                    let _ = tokio::time::timeout(heartbeat.write_wait, sink.send(Message::Close(None))).await;
                    break;
                };
                match tokio::time::timeout(heartbeat.write_wait, sink.send(Message::Text((*json).clone().into()))).await {
                    Ok(Ok(())) => gateway.metrics().inc_frames_sent(),
                    Ok(Err(e)) => {
                        debug!("Write error on {}: {}", connection_id, e);
                        break;
                    }
                    Err(_) => {
                        warn!("Write deadline exceeded for {}", connection_id);
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let sent = tokio::time::timeout(heartbeat.write_wait, sink.send(Message::Ping(Default::default()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    warn!("Heartbeat failed for {}", connection_id);
                    break;
                }
            }
        }
    }

    gateway.metrics().add_frames_dropped(outbound.dropped());
    debug!("Write task finished for {}", connection_id);
}
