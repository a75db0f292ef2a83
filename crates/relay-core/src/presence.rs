//! Presence contract and the in-memory presence manager.
//!
//! Presence tracks which connections currently occupy a channel. Entries
//! expire after a TTL unless refreshed; the node refreshes entries for
//! its connected clients on an interval.

use crate::config::UserMappingFn;
use crate::errors::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use relay_protocol::ClientInfo;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// Presence counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceStats {
    /// Number of connections in the channel.
    pub num_clients: usize,
    /// Number of distinct users in the channel.
    pub num_users: usize,
}

/// Channel presence store.
#[async_trait]
pub trait PresenceManager: Send + Sync {
    /// Add or refresh a presence entry.
    async fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: ClientInfo,
    ) -> Result<(), Error>;

    /// Remove a presence entry.
    async fn remove_presence(
        &self,
        channel: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<(), Error>;

    /// Current presence entries keyed by client id.
    async fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, Error>;

    /// Presence counters for the channel.
    async fn presence_stats(&self, channel: &str) -> Result<PresenceStats, Error>;

    /// Release resources.
    async fn close(&self) -> Result<(), Error>;
}

/// Configuration of [`MemoryPresenceManager`].
#[derive(Clone)]
pub struct MemoryPresenceConfig {
    /// Entry lifetime without refresh.
    pub presence_ttl: Duration,
    /// Per-channel switch for the user-mapping index. When enabled the
    /// manager maintains user refcounts so `num_users` needs no scan.
    pub enable_user_mapping: Option<UserMappingFn>,
}

impl Default for MemoryPresenceConfig {
    fn default() -> Self {
        Self {
            presence_ttl: Duration::from_secs(60),
            enable_user_mapping: None,
        }
    }
}

struct Entry {
    info: ClientInfo,
    expires_at: Instant,
}

#[derive(Default)]
struct ChannelPresence {
    entries: HashMap<String, Entry>,
    // User refcounts, maintained only when user-mapping is enabled for
    // the channel.
    users: HashMap<String, usize>,
}

impl ChannelPresence {
    fn prune(&mut self, now: Instant, user_mapping: bool) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                if user_mapping {
                    decref(&mut self.users, &entry.info.user);
                }
            }
        }
    }
}

fn decref(users: &mut HashMap<String, usize>, user: &str) {
    if let Some(count) = users.get_mut(user) {
        *count -= 1;
        if *count == 0 {
            users.remove(user);
        }
    }
}

/// In-process presence manager.
pub struct MemoryPresenceManager {
    channels: DashMap<String, ChannelPresence>,
    config: MemoryPresenceConfig,
}

impl MemoryPresenceManager {
    /// Create a manager.
    #[must_use]
    pub fn new(config: MemoryPresenceConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
        }
    }

    fn user_mapping_enabled(&self, channel: &str) -> bool {
        self.config
            .enable_user_mapping
            .as_ref()
            .is_some_and(|f| f(channel))
    }
}

#[async_trait]
impl PresenceManager for MemoryPresenceManager {
    async fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: ClientInfo,
    ) -> Result<(), Error> {
        let user_mapping = self.user_mapping_enabled(channel);
        let mut presence = self.channels.entry(channel.to_string()).or_default();
        let now = Instant::now();
        presence.prune(now, user_mapping);

        let is_new = !presence.entries.contains_key(client_id);
        if is_new && user_mapping {
            *presence.users.entry(info.user.clone()).or_insert(0) += 1;
        }
        presence.entries.insert(
            client_id.to_string(),
            Entry {
                info,
                expires_at: now + self.config.presence_ttl,
            },
        );
        if is_new {
            debug!(channel = %channel, client = %client_id, "presence: member added");
        }
        Ok(())
    }

    async fn remove_presence(
        &self,
        channel: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<(), Error> {
        let user_mapping = self.user_mapping_enabled(channel);
        let mut remove_channel = false;
        if let Some(mut presence) = self.channels.get_mut(channel) {
            if presence.entries.remove(client_id).is_some() {
                if user_mapping {
                    decref(&mut presence.users, user_id);
                }
                debug!(channel = %channel, client = %client_id, "presence: member removed");
            }
            remove_channel = presence.entries.is_empty();
        }
        if remove_channel {
            self.channels
                .remove_if(channel, |_, p| p.entries.is_empty());
        }
        Ok(())
    }

    async fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, Error> {
        let user_mapping = self.user_mapping_enabled(channel);
        match self.channels.get_mut(channel) {
            Some(mut presence) => {
                presence.prune(Instant::now(), user_mapping);
                Ok(presence
                    .entries
                    .iter()
                    .map(|(id, e)| (id.clone(), e.info.clone()))
                    .collect())
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn presence_stats(&self, channel: &str) -> Result<PresenceStats, Error> {
        let user_mapping = self.user_mapping_enabled(channel);
        match self.channels.get_mut(channel) {
            Some(mut presence) => {
                presence.prune(Instant::now(), user_mapping);
                let num_clients = presence.entries.len();
                let num_users = if user_mapping {
                    presence.users.len()
                } else {
                    presence
                        .entries
                        .values()
                        .map(|e| e.info.user.as_str())
                        .collect::<HashSet<_>>()
                        .len()
                };
                Ok(PresenceStats {
                    num_clients,
                    num_users,
                })
            }
            None => Ok(PresenceStats::default()),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.channels.clear();
        Ok(())
    }
}
