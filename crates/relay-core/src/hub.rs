//! In-process index of connections and channel subscriptions.
//!
//! The hub maps channels to subscribed sessions, users to their
//! sessions, and client ids to sessions. It fans publications out to
//! subscribers but owns no session lifetime: sessions register on
//! connect and remove themselves on close.
//!
//! The maps are sharded reader/writer locks (`DashMap`). Fan-out never
//! writes under a shard guard: it snapshots the subscriber set, releases
//! the guard, then hands frames to each session, so a slow subscriber
//! cannot block subscribe/unsubscribe on the same shard.

use crate::batch::ChannelBatchConfig;
use crate::client::Client;
use crate::errors::Disconnect;
use crate::types::ChannelId;
use bytes::Bytes;
use dashmap::DashMap;
use relay_protocol::{codec, ClientInfo, Encoding, Publication, Push, Reply, StreamPosition};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Frames of one push, encoded at most once per protocol encoding.
struct PreparedPush {
    reply: Reply,
    json: Option<Bytes>,
    binary: Option<Bytes>,
}

impl PreparedPush {
    fn new(push: Push) -> Self {
        Self {
            reply: Reply::push(push),
            json: None,
            binary: None,
        }
    }

    fn frame(&mut self, encoding: Encoding) -> Option<Bytes> {
        let slot = match encoding {
            Encoding::Json => &mut self.json,
            Encoding::Binary => &mut self.binary,
        };
        if slot.is_none() {
            match codec::encode_reply(&self.reply, encoding) {
                Ok(data) => *slot = Some(data),
                Err(e) => {
                    warn!(error = %e, "failed to encode push");
                    return None;
                }
            }
        }
        slot.clone()
    }
}

/// Connection and subscription index of one node.
#[derive(Default)]
pub struct Hub {
    /// Sessions by client id.
    connections: DashMap<String, Arc<Client>>,
    /// Client ids by user id.
    users: DashMap<String, HashSet<String>>,
    /// Subscribed sessions by channel.
    subscriptions: DashMap<ChannelId, HashMap<String, Arc<Client>>>,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected session.
    pub(crate) fn add_client(&self, client: &Arc<Client>) {
        self.connections
            .insert(client.id().to_string(), client.clone());
        self.users
            .entry(client.user())
            .or_default()
            .insert(client.id().to_string());
        debug!(client = %client.id(), "hub: client added");
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub(crate) fn remove_client(&self, client: &Client) -> bool {
        let removed = self.connections.remove(client.id()).is_some();
        if removed {
            let user = client.user();
            if let Some(mut ids) = self.users.get_mut(&user) {
                ids.remove(client.id());
            }
            self.users.remove_if(&user, |_, ids| ids.is_empty());
            debug!(client = %client.id(), "hub: client removed");
        }
        removed
    }

    /// Add a channel subscription. Returns `true` when this is the first
    /// subscriber of the channel on this node.
    pub(crate) fn add_sub(&self, channel: &str, client: Arc<Client>) -> bool {
        let mut subs = self.subscriptions.entry(channel.to_string()).or_default();
        let first = subs.is_empty();
        subs.insert(client.id().to_string(), client);
        first
    }

    /// Remove a channel subscription. Returns `true` when the channel has
    /// no subscribers left on this node.
    pub(crate) fn remove_sub(&self, channel: &str, client_id: &str) -> bool {
        let mut last = false;
        if let Some(mut subs) = self.subscriptions.get_mut(channel) {
            subs.remove(client_id);
            last = subs.is_empty();
        }
        if last {
            self.subscriptions.remove_if(channel, |_, subs| subs.is_empty());
        }
        last
    }

    fn snapshot(&self, channel: &str) -> Vec<Arc<Client>> {
        self.subscriptions
            .get(channel)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fan a publication out to every local subscriber of the channel.
    pub fn broadcast_publication(
        &self,
        channel: &str,
        publication: &Publication,
        sp: Option<&StreamPosition>,
        batch: Option<&ChannelBatchConfig>,
    ) {
        let subscribers = self.snapshot(channel);
        if subscribers.is_empty() {
            return;
        }
        let mut prepared = PreparedPush::new(Push::publication(channel, publication.clone()));
        for client in subscribers {
            let Some(frame) = prepared.frame(client.encoding()) else {
                continue;
            };
            client.transmit_publication(channel, publication, sp, frame, batch);
        }
    }

    /// Fan a join event out to subscribers interested in membership.
    pub fn broadcast_join(&self, channel: &str, info: &ClientInfo) {
        let subscribers = self.snapshot(channel);
        if subscribers.is_empty() {
            return;
        }
        let mut prepared = PreparedPush::new(Push::join(channel, info.clone()));
        for client in subscribers {
            let Some(frame) = prepared.frame(client.encoding()) else {
                continue;
            };
            client.transmit_join_leave(channel, frame);
        }
    }

    /// Fan a leave event out to subscribers interested in membership.
    pub fn broadcast_leave(&self, channel: &str, info: &ClientInfo) {
        let subscribers = self.snapshot(channel);
        if subscribers.is_empty() {
            return;
        }
        let mut prepared = PreparedPush::new(Push::leave(channel, info.clone()));
        for client in subscribers {
            let Some(frame) = prepared.frame(client.encoding()) else {
                continue;
            };
            client.transmit_join_leave(channel, frame);
        }
    }

    /// Sessions of one user.
    pub(crate) fn user_clients(&self, user: &str) -> Vec<Arc<Client>> {
        let ids: Vec<String> = self
            .users
            .get(user)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|c| c.value().clone()))
            .collect()
    }

    /// Terminate every session of a user.
    pub async fn disconnect_user(&self, user: &str, disconnect: Disconnect) {
        for client in self.user_clients(user) {
            client.close(disconnect.clone()).await;
        }
    }

    /// Remove a user's subscription to a channel across their sessions.
    pub async fn unsubscribe_user(&self, user: &str, channel: &str) {
        for client in self.user_clients(user) {
            client.server_unsubscribe(channel).await;
        }
    }

    /// All registered sessions.
    pub(crate) fn clients(&self) -> Vec<Arc<Client>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of connected sessions.
    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct users with at least one session.
    #[must_use]
    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    /// Number of channels with at least one subscriber.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of subscribers of one channel.
    #[must_use]
    pub fn num_subscribers(&self, channel: &str) -> usize {
        self.subscriptions
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Channels with at least one subscriber.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every session with the given disconnect.
    pub async fn shutdown(&self, disconnect: Disconnect) {
        for client in self.clients() {
            client.close(disconnect.clone()).await;
        }
    }
}
