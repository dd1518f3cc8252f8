#![forbid(unsafe_code)]

// ICE server hints for voice participants.
// TURN entries use coturn's REST credential scheme (--use-auth-secret):
// username = "<expiry>:<participant id>", credential = base64(HMAC-SHA1(secret, username)).

use crate::config::{parse_or, split_urls};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub secret: String,
    pub ttl_secs: u64,
}

/// ICE server entry sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// Returns None unless both TURN_URLS and TURN_SECRET are set.
    pub fn from_lookup<F>(lookup: &F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let urls = split_urls(&lookup("TURN_URLS")?);
        let secret = lookup("TURN_SECRET").filter(|s| !s.is_empty())?;
        if urls.is_empty() {
            return None;
        }
        let ttl_secs = parse_or(lookup, "TURN_TTL", DEFAULT_TTL_SECS);
        Some(Self { urls, secret, ttl_secs })
    }

    pub fn credentials_for(&self, participant_id: &str) -> IceServer {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.credentials_at(participant_id, now)
    }

    fn credentials_at(&self, participant_id: &str, now_secs: u64) -> IceServer {
        let username = format!("{}:{participant_id}", now_secs + self.ttl_secs);

        let credential = HmacSha1::new_from_slice(self.secret.as_bytes())
            .map(|mut mac| {
                mac.update(username.as_bytes());
                base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
            })
            .ok();

        IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential,
        }
    }
}

/// Everything a voice participant needs to reach its peers.
#[derive(Debug, Clone, Default)]
pub struct IceDirectory {
    stun_urls: Vec<String>,
    turn: Option<TurnConfig>,
}

impl IceDirectory {
    pub fn new(stun_urls: Vec<String>, turn: Option<TurnConfig>) -> Self {
        Self { stun_urls, turn }
    }

    pub fn is_empty(&self) -> bool {
        self.stun_urls.is_empty() && self.turn.is_none()
    }

    pub fn servers_for(&self, participant_id: &str) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if let Some(turn) = &self.turn {
            servers.push(turn.credentials_for(participant_id));
        }
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn() -> TurnConfig {
        TurnConfig {
            urls: vec!["turn:turn.example:3478".into()],
            secret: "shared-secret".into(),
            ttl_secs: 600,
        }
    }

    #[test]
    fn test_username_carries_expiry_and_participant() {
        let server = turn().credentials_at("abc123", 1_000);
        assert_eq!(server.username.as_deref(), Some("1600:abc123"));
        assert!(server.credential.is_some());
    }

    #[test]
    fn test_credentials_are_deterministic_for_same_input() {
        let a = turn().credentials_at("p1", 42);
        let b = turn().credentials_at("p1", 42);
        let c = turn().credentials_at("p2", 42);
        assert_eq!(a.credential, b.credential);
        assert_ne!(a.credential, c.credential);
    }

    #[test]
    fn test_from_lookup_requires_urls_and_secret() {
        let only_urls = |k: &str| (k == "TURN_URLS").then(|| "turn:x:3478".to_string());
        assert!(TurnConfig::from_lookup(&only_urls).is_none());

        let both = |k: &str| match k {
            "TURN_URLS" => Some("turn:x:3478,turns:x:5349".to_string()),
            "TURN_SECRET" => Some("s".to_string()),
            _ => None,
        };
        let config = TurnConfig::from_lookup(&both).unwrap();
        assert_eq!(config.urls.len(), 2);
        assert_eq!(config.ttl_secs, DEFAULT_TTL_SECS);
    }

    #[test]
    fn test_directory_lists_stun_then_turn() {
        let directory = IceDirectory::new(vec!["stun:stun.example:3478".into()], Some(turn()));
        let servers = directory.servers_for("p1");
        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_none());
        assert!(servers[1].username.is_some());
        assert!(IceDirectory::default().servers_for("p1").is_empty());
    }
}
