#![forbid(unsafe_code)]

// Signaling module - WebSocket chat and voice signaling server

pub mod connection;
pub mod error;
pub mod gateway;
pub mod outbound;
pub mod protocol;

use crate::auth;
use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::store::ChatStore;
use crate::turn::IceDirectory;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gateway::Gateway;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    gateway: Arc<Gateway>,
    config: Arc<ServerConfig>,
    tokens: Option<Arc<auth::TokenKeys>>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
}

impl SignalingServer {
    pub fn new(config: ServerConfig, store: Arc<dyn ChatStore>, metrics: ServerMetrics) -> Self {
        info!("Max connections: {}", config.max_connections);
        let tokens = config.jwt_secret.as_deref().map(|secret| Arc::new(auth::TokenKeys::new(secret)));
        if tokens.is_some() {
            info!("JWT authentication enabled");
        } else {
            warn!("JWT_SECRET not set, WebSocket upgrades will be refused");
        }

        let ice = IceDirectory::new(config.stun_urls.clone(), config.turn.clone());
        if ice.is_empty() {
            info!("No ICE servers configured (set STUN_URLS or TURN_URLS and TURN_SECRET)");
        }

        let gateway = Arc::new(Gateway::new(store, ice, metrics.clone(), config.limits));

        Self {
            gateway,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            tokens,
            metrics,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/auth/logout", post(logout_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds the configured port and serves until the listener fails.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        info!("Starting signaling server on {}", addr);
        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let sizes = server.gateway.sizes();
    Json(serde_json::json!({
        "status": "ok",
        "connections": sizes.connections,
        "channels": sizes.channels,
        "rooms": sizes.rooms,
        "participants": sizes.participants,
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by the optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.config.metrics_token.as_deref() {
        if auth::bearer_token(&headers, None) != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let body = server.metrics.render_prometheus(server.gateway.sizes());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// POST /api/auth/logout
///
/// Closes every live socket of the caller. The token itself stays valid until
/// it expires; revoking it is the issuer's job.
async fn logout_handler(
    State(server): State<SignalingServer>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, auth::AuthError> {
    let principal = auth::authenticate(&headers, params.token.as_deref(), server.tokens.as_deref())?;
    let closed = server.gateway.disconnect_user(&principal.email);
    Ok(Json(serde_json::json!({ "closed": closed })))
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let principal = match auth::authenticate(&headers, params.token.as_deref(), server.tokens.as_deref()) {
        Ok(principal) => principal,
        Err(e) => {
            warn!("Rejecting WebSocket upgrade: {}", e);
            return e.into_response();
        }
    };

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let heartbeat = server.config.heartbeat;
    ws.max_message_size(server.config.limits.max_frame_bytes)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, principal, server.gateway, heartbeat, permit)
        })
}
