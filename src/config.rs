#![forbid(unsafe_code)]

// Server configuration loaded from environment variables.

use crate::turn::TurnConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Heartbeat and write deadlines for every socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often the write task emits a ping frame
    pub ping_interval: Duration,
    /// Connection is closed if nothing arrives from the client within this window
    pub pong_wait: Duration,
    /// Deadline for a single frame write
    pub write_wait: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(45),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
        }
    }
}

/// Per-connection and per-message limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub outbound_capacity: usize,
    pub max_frame_bytes: usize,
    pub max_message_chars: usize,
    pub history_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            outbound_capacity: 32,
            max_frame_bytes: 64 * 1024,
            max_message_chars: 2000,
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub jwt_secret: Option<String>,
    pub database_url: Option<String>,
    pub metrics_token: Option<String>,
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnConfig>,
    pub heartbeat: HeartbeatConfig,
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            jwt_secret: None,
            database_url: None,
            metrics_token: None,
            stun_urls: Vec::new(),
            turn: None,
            heartbeat: HeartbeatConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut max_connections = parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let mut heartbeat = HeartbeatConfig {
            ping_interval: secs_or(&lookup, "WS_PING_INTERVAL_SECS", defaults.heartbeat.ping_interval),
            pong_wait: secs_or(&lookup, "WS_PONG_WAIT_SECS", defaults.heartbeat.pong_wait),
            write_wait: secs_or(&lookup, "WS_WRITE_WAIT_SECS", defaults.heartbeat.write_wait),
        };
        if heartbeat.ping_interval.is_zero() || heartbeat.ping_interval >= heartbeat.pong_wait {
            warn!(
                "Ping interval {:?} must be non-zero and shorter than pong wait {:?}, using defaults",
                heartbeat.ping_interval, heartbeat.pong_wait
            );
            heartbeat = HeartbeatConfig::default();
        }

        let limits = Limits {
            outbound_capacity: parse_or(&lookup, "WS_OUTBOUND_CAPACITY", defaults.limits.outbound_capacity).max(1),
            max_frame_bytes: parse_or(&lookup, "WS_MAX_FRAME_BYTES", defaults.limits.max_frame_bytes),
            max_message_chars: parse_or(&lookup, "CHAT_MAX_CHARS", defaults.limits.max_message_chars),
            history_limit: parse_or(&lookup, "CHAT_HISTORY_LIMIT", defaults.limits.history_limit),
        };

        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            max_connections,
            jwt_secret: non_empty(&lookup, "JWT_SECRET"),
            database_url: non_empty(&lookup, "DATABASE_URL"),
            metrics_token: non_empty(&lookup, "METRICS_TOKEN"),
            stun_urls: non_empty(&lookup, "STUN_URLS").map(|v| split_urls(&v)).unwrap_or_default(),
            turn: TurnConfig::from_lookup(&lookup),
            heartbeat,
            limits,
        }
    }
}

pub(crate) fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub(crate) fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Debug,
{
    match non_empty(lookup, key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using default {:?}", key, raw, default);
            default
        }),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parse_or(lookup, key, default.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 10_000);
        assert!(config.jwt_secret.is_none());
        assert!(config.turn.is_none());
        assert_eq!(config.heartbeat.ping_interval, Duration::from_secs(45));
        assert_eq!(config.heartbeat.pong_wait, Duration::from_secs(60));
        assert_eq!(config.limits.max_message_chars, 2000);
        assert_eq!(config.limits.outbound_capacity, 32);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "9000"),
            ("JWT_SECRET", "s3cret"),
            ("CHAT_MAX_CHARS", "500"),
            ("STUN_URLS", "stun:a.example:3478, stun:b.example:3478,"),
        ]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.limits.max_message_chars, 500);
        assert_eq!(config.stun_urls, vec!["stun:a.example:3478", "stun:b.example:3478"]);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "not-a-port"),
            ("MAX_CONNECTIONS", "0"),
            ("WS_OUTBOUND_CAPACITY", "0"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.limits.outbound_capacity, 1);
    }

    #[test]
    fn test_ping_must_be_shorter_than_pong_wait() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("WS_PING_INTERVAL_SECS", "90"),
            ("WS_PONG_WAIT_SECS", "60"),
        ]));
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
    }
}
