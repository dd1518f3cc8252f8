#![forbid(unsafe_code)]

// In-memory ChatStore used when no database is configured and by tests.

use super::{ChannelId, ChannelKind, ChatStore, StoreError, StoredMessage};
use crate::auth::Principal;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;

pub const DEFAULT_TEXT_CHANNEL: ChannelId = 1;
pub const DEFAULT_VOICE_CHANNEL: ChannelId = 2;

struct Channel {
    name: String,
    kind: ChannelKind,
    /// `None` means every authenticated principal may use the channel.
    members: Option<HashSet<String>>,
}

#[derive(Default)]
struct State {
    channels: HashMap<ChannelId, Channel>,
    display_names: HashMap<String, String>,
    messages: HashMap<ChannelId, Vec<StoredMessage>>,
    next_message_id: i64,
    failing: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: StdMutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A "general" text channel and a "lounge" voice channel, open to everyone.
    pub fn with_default_workspace() -> Self {
        let store = Self::new();
        store.add_open_channel(DEFAULT_TEXT_CHANNEL, "general", ChannelKind::Text);
        store.add_open_channel(DEFAULT_VOICE_CHANNEL, "lounge", ChannelKind::Voice);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_open_channel(&self, id: ChannelId, name: &str, kind: ChannelKind) {
        self.lock().channels.insert(id, Channel { name: name.to_string(), kind, members: None });
    }

    /// Adds a channel restricted to explicitly granted principals.
    pub fn add_private_channel(&self, id: ChannelId, name: &str, kind: ChannelKind) {
        self.lock().channels.insert(id, Channel { name: name.to_string(), kind, members: Some(HashSet::new()) });
    }

    pub fn grant(&self, id: ChannelId, email: &str) {
        if let Some(channel) = self.lock().channels.get_mut(&id) {
            if let Some(members) = channel.members.as_mut() {
                members.insert(email.to_string());
            }
        }
    }

    pub fn revoke(&self, id: ChannelId, email: &str) {
        if let Some(channel) = self.lock().channels.get_mut(&id) {
            if let Some(members) = channel.members.as_mut() {
                members.remove(email);
            }
        }
    }

    /// Display name recorded for an author. Authors without one are stored with an empty name.
    pub fn set_display_name(&self, email: &str, display_name: &str) {
        self.lock().display_names.insert(email.to_string(), display_name.to_string());
    }

    /// Makes every call fail with `StoreError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn channel_name(&self, id: ChannelId) -> Option<String> {
        self.lock().channels.get(&id).map(|c| c.name.clone())
    }

    pub fn message_count(&self, id: ChannelId) -> usize {
        self.lock().messages.get(&id).map_or(0, Vec::len)
    }

    fn check(state: &State) -> Result<(), StoreError> {
        if state.failing {
            return Err(StoreError::Unavailable("memory store set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn channel_kind(&self, channel_id: ChannelId) -> Result<Option<ChannelKind>, StoreError> {
        let state = self.lock();
        Self::check(&state)?;
        Ok(state.channels.get(&channel_id).map(|c| c.kind))
    }

    async fn has_access(&self, principal: &Principal, channel_id: ChannelId) -> Result<bool, StoreError> {
        let state = self.lock();
        Self::check(&state)?;
        Ok(match state.channels.get(&channel_id) {
            Some(Channel { members: None, .. }) => true,
            Some(Channel { members: Some(members), .. }) => members.contains(&principal.email),
            None => false,
        })
    }

    async fn save_message(
        &self,
        channel_id: ChannelId,
        author: &Principal,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let mut state = self.lock();
        Self::check(&state)?;
        if !state.channels.contains_key(&channel_id) {
            return Err(StoreError::InvalidData(format!("unknown channel {channel_id}")));
        }

        state.next_message_id += 1;
        let message = StoredMessage {
            id: state.next_message_id,
            channel_id,
            author_email: author.email.clone(),
            author_display_name: state.display_names.get(&author.email).cloned().unwrap_or_default(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        state.messages.entry(channel_id).or_default().push(message.clone());
        Ok(message)
    }

    async fn recent_messages(&self, channel_id: ChannelId, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let state = self.lock();
        Self::check(&state)?;
        let messages = state.messages.get(&channel_id).map(Vec::as_slice).unwrap_or_default();
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}
