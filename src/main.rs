#![forbid(unsafe_code)]

use anyhow::Result;
use echosphere_relay::config::ServerConfig;
use echosphere_relay::db;
use echosphere_relay::metrics::ServerMetrics;
use echosphere_relay::signaling::SignalingServer;
use echosphere_relay::store::{ChatStore, MemoryStore, PgStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echosphere_relay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Echosphere relay - Starting server");

    let config = ServerConfig::from_env();
    if let Some(ref tc) = config.turn {
        info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs);
    } else {
        info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)");
    }

    let store: Arc<dyn ChatStore> = match db::connect(config.database_url.as_deref()).await? {
        Some(pool) => Arc::new(PgStore::new(pool)),
        None => Arc::new(MemoryStore::with_default_workspace()),
    };

    let server = SignalingServer::new(config, store, ServerMetrics::new());
    let gateway = server.gateway().clone();

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            gateway.shutdown();
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
