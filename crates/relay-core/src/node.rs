//! Process-wide coordinator.
//!
//! A `Node` owns the hub and the engine instances, runs the control
//! plane (heartbeats, cluster disconnect/unsubscribe) and the presence
//! refresh loop, and exposes the library's programmatic surface:
//! publish, disconnect, unsubscribe, presence, history, shutdown.

use crate::broker::{Broker, BrokerEventHandler, MemoryBroker, PublishOptions};
use crate::config::Config;
use crate::control::{
    decode_control, encode_control, ControlMessage, ControlPayload, NodeInfo,
};
use crate::errors::{Disconnect, Error};
use crate::history::{HistoryFilter, HistoryManager, MemoryHistoryManager};
use crate::hub::Hub;
use crate::presence::{
    MemoryPresenceConfig, MemoryPresenceManager, PresenceManager, PresenceStats,
};
use crate::types::{generate_client_id, validate_channel};
use relay_protocol::{ClientInfo, Publication, StreamPosition};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on draining sessions during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A process-wide messaging node.
pub struct Node {
    id: String,
    config: Config,
    hub: Hub,
    broker: RwLock<Arc<dyn Broker>>,
    presence_manager: RwLock<Arc<dyn PresenceManager>>,
    history_manager: RwLock<Arc<dyn HistoryManager>>,
    /// Known cluster nodes by uid, with last-heartbeat instants.
    nodes: Mutex<HashMap<String, (NodeInfo, Instant)>>,
    started_at: Instant,
    running: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node with in-memory engines. Engines can be replaced
    /// with [`Node::set_broker`] and friends before [`Node::run`].
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let history: Arc<dyn HistoryManager> = Arc::new(MemoryHistoryManager::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(history.clone()));
        let presence: Arc<dyn PresenceManager> =
            Arc::new(MemoryPresenceManager::new(MemoryPresenceConfig {
                presence_ttl: config.presence_ttl,
                enable_user_mapping: config.presence_user_mapping.clone(),
            }));
        Arc::new(Self {
            id: generate_client_id(),
            config,
            hub: Hub::new(),
            broker: RwLock::new(broker),
            presence_manager: RwLock::new(presence),
            history_manager: RwLock::new(history),
            nodes: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Node uid, unique per process.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The connection/subscription index.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Replace the broker. Must be called before [`Node::run`].
    pub fn set_broker(&self, broker: Arc<dyn Broker>) {
        *self.broker.write().unwrap() = broker;
    }

    /// Replace the presence manager. Must be called before [`Node::run`].
    pub fn set_presence_manager(&self, manager: Arc<dyn PresenceManager>) {
        *self.presence_manager.write().unwrap() = manager;
    }

    /// Replace the history manager. Must be called before [`Node::run`].
    pub fn set_history_manager(&self, manager: Arc<dyn HistoryManager>) {
        *self.history_manager.write().unwrap() = manager;
    }

    fn broker(&self) -> Arc<dyn Broker> {
        self.broker.read().unwrap().clone()
    }

    fn presence_manager(&self) -> Arc<dyn PresenceManager> {
        self.presence_manager.read().unwrap().clone()
    }

    fn history_manager(&self) -> Arc<dyn HistoryManager> {
        self.history_manager.read().unwrap().clone()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NodeClosed);
        }
        Ok(())
    }

    /// Start the broker event loop and the node's background tasks.
    ///
    /// # Errors
    ///
    /// Fails when the node was shut down or is already running.
    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        self.ensure_open()?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::Internal("node already running".into()));
        }
        let handler: Arc<dyn BrokerEventHandler> = self.clone();
        self.broker().run(handler).await?;
        info!(node = %self.id, name = %self.config.name, "node running");

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_heartbeat());
        tasks.push(self.spawn_presence_refresh());
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.node_info_publish_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else { return };
                if node.closed.load(Ordering::Acquire) {
                    return;
                }
                let message = ControlMessage {
                    uid: node.id.clone(),
                    payload: ControlPayload::Node(node.node_info()),
                };
                match encode_control(&message) {
                    Ok(data) => {
                        if let Err(e) = node.broker().publish_control(data).await {
                            warn!(error = %e, "node heartbeat publish failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "node heartbeat encode failed"),
                }
                // Drop nodes that missed three heartbeats.
                let deadline = Instant::now() - interval * 3;
                node.nodes
                    .lock()
                    .unwrap()
                    .retain(|_, (_, seen)| *seen > deadline);
            }
        })
    }

    fn spawn_presence_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.presence_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so fresh
            // subscriptions are not refreshed twice.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else { return };
                if node.closed.load(Ordering::Acquire) {
                    return;
                }
                let manager = node.presence_manager();
                for client in node.hub.clients() {
                    for channel in client.presence_channels() {
                        if let Err(e) = manager
                            .add_presence(&channel, client.id(), client.client_info())
                            .await
                        {
                            warn!(channel = %channel, error = %e, "presence refresh failed");
                        }
                    }
                }
            }
        })
    }

    /// Counters of this node for heartbeats and diagnostics.
    #[must_use]
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            num_clients: self.hub.num_clients(),
            num_users: self.hub.num_users(),
            num_channels: self.hub.num_channels(),
            uptime: self.started_at.elapsed().as_secs(),
        }
    }

    /// Known cluster nodes: this node plus every peer whose heartbeat is
    /// still fresh.
    #[must_use]
    pub fn info(&self) -> Vec<NodeInfo> {
        let mut result = vec![self.node_info()];
        let nodes = self.nodes.lock().unwrap();
        for (uid, (info, _)) in nodes.iter() {
            if uid != &self.id {
                result.push(info.clone());
            }
        }
        result
    }

    /// Publish data into a channel.
    ///
    /// The publication is written to history first when the channel has
    /// it, then delivered to subscribers on every interested node.
    ///
    /// # Errors
    ///
    /// Fails when the node is closed, the channel name is invalid, or
    /// the broker rejects the publish.
    pub async fn publish(&self, channel: &str, data: Vec<u8>) -> Result<StreamPosition, Error> {
        self.publish_with_info(channel, data, None).await
    }

    pub(crate) async fn publish_with_info(
        &self,
        channel: &str,
        data: Vec<u8>,
        info: Option<ClientInfo>,
    ) -> Result<StreamPosition, Error> {
        self.ensure_open()?;
        validate_channel(channel, self.config.channel_max_length)
            .map_err(Error::InvalidChannel)?;
        let opts = (self.config.get_channel_options)(channel);
        let publish_opts = PublishOptions {
            history_size: opts.history_size,
            history_ttl: opts.history_ttl,
            client_info: info,
            tags: None,
        };
        self.broker()
            .publish(channel, Publication::new(data), &publish_opts)
            .await
    }

    pub(crate) async fn broker_subscribe(&self, channel: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker().subscribe(channel).await
    }

    pub(crate) async fn broker_unsubscribe(&self, channel: &str) -> Result<(), Error> {
        self.broker().unsubscribe(channel).await
    }

    pub(crate) fn announce_join(&self, channel: &str, info: ClientInfo) {
        let broker = self.broker();
        let channel = channel.to_string();
        tokio::spawn(async move {
            if let Err(e) = broker.publish_join(&channel, info).await {
                warn!(channel = %channel, error = %e, "join publish failed");
            }
        });
    }

    pub(crate) fn announce_leave(&self, channel: &str, info: ClientInfo) {
        let broker = self.broker();
        let channel = channel.to_string();
        tokio::spawn(async move {
            if let Err(e) = broker.publish_leave(&channel, info).await {
                warn!(channel = %channel, error = %e, "leave publish failed");
            }
        });
    }

    pub(crate) async fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: ClientInfo,
    ) -> Result<(), Error> {
        self.presence_manager()
            .add_presence(channel, client_id, info)
            .await
    }

    pub(crate) async fn remove_presence(
        &self,
        channel: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<(), Error> {
        self.presence_manager()
            .remove_presence(channel, client_id, user_id)
            .await
    }

    /// Current presence entries of a channel.
    ///
    /// # Errors
    ///
    /// Fails when the node is closed or the presence backend errors.
    pub async fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, Error> {
        self.ensure_open()?;
        self.presence_manager().presence(channel).await
    }

    /// Presence counters of a channel.
    ///
    /// # Errors
    ///
    /// Fails when the node is closed or the presence backend errors.
    pub async fn presence_stats(&self, channel: &str) -> Result<PresenceStats, Error> {
        self.ensure_open()?;
        self.presence_manager().presence_stats(channel).await
    }

    /// Read channel history.
    ///
    /// # Errors
    ///
    /// Fails when the node is closed or the history backend errors.
    pub async fn history(
        &self,
        channel: &str,
        filter: &HistoryFilter,
    ) -> Result<(Vec<Publication>, StreamPosition), Error> {
        self.ensure_open()?;
        self.history_manager().history(channel, filter).await
    }

    /// Discard a channel's history stream.
    ///
    /// # Errors
    ///
    /// Fails when the node is closed or the history backend errors.
    pub async fn remove_history(&self, channel: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.history_manager().remove_history(channel).await
    }

    /// Terminate every session of a user, cluster-wide.
    ///
    /// # Errors
    ///
    /// Fails when the node is closed or the control publish fails; local
    /// sessions are closed regardless.
    pub async fn disconnect_user(&self, user: &str, disconnect: Disconnect) -> Result<(), Error> {
        self.ensure_open()?;
        self.hub.disconnect_user(user, disconnect.clone()).await;
        let message = ControlMessage {
            uid: self.id.clone(),
            payload: ControlPayload::Disconnect {
                user: user.to_string(),
                code: disconnect.code,
                reason: disconnect.reason,
                reconnect: disconnect.reconnect,
            },
        };
        self.broker().publish_control(encode_control(&message)?).await
    }

    /// Remove a user's subscription to a channel, cluster-wide.
    ///
    /// # Errors
    ///
    /// Fails when the node is closed or the control publish fails; local
    /// sessions are unsubscribed regardless.
    pub async fn unsubscribe_user(&self, user: &str, channel: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.hub.unsubscribe_user(user, channel).await;
        let message = ControlMessage {
            uid: self.id.clone(),
            payload: ControlPayload::Unsubscribe {
                user: user.to_string(),
                channel: channel.to_string(),
            },
        };
        self.broker().publish_control(encode_control(&message)?).await
    }

    /// Stop the node: close sessions with a shutdown disconnect under a
    /// bounded timeout, stop background tasks, close engines. Subsequent
    /// operations fail with [`Error::NodeClosed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.id, "node shutting down");
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.hub.shutdown(Disconnect::shutdown()))
            .await
            .is_err()
        {
            warn!("session drain timed out during shutdown");
        }
        let _ = self.broker().close().await;
        let _ = self.presence_manager().close().await;
        let _ = self.history_manager().close().await;
    }
}

impl BrokerEventHandler for Node {
    fn handle_publication(
        &self,
        channel: &str,
        publication: Publication,
        sp: Option<StreamPosition>,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let batch = self
            .config
            .get_channel_batch_config
            .as_ref()
            .map(|f| f(channel));
        self.hub
            .broadcast_publication(channel, &publication, sp.as_ref(), batch.as_ref());
    }

    fn handle_join(&self, channel: &str, info: ClientInfo) {
        self.hub.broadcast_join(channel, &info);
    }

    fn handle_leave(&self, channel: &str, info: ClientInfo) {
        self.hub.broadcast_leave(channel, &info);
    }

    fn handle_control(&self, data: Vec<u8>) {
        let message = match decode_control(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed control message");
                return;
            }
        };
        match message.payload {
            ControlPayload::Node(info) => {
                self.nodes
                    .lock()
                    .unwrap()
                    .insert(message.uid, (info, Instant::now()));
            }
            ControlPayload::Unsubscribe { user, channel } => {
                debug!(user = %user, channel = %channel, "control: unsubscribe");
                let clients = self.hub.user_clients(&user);
                tokio::spawn(async move {
                    for client in clients {
                        client.server_unsubscribe(&channel).await;
                    }
                });
            }
            ControlPayload::Disconnect {
                user,
                code,
                reason,
                reconnect,
            } => {
                debug!(user = %user, code, "control: disconnect");
                let clients = self.hub.user_clients(&user);
                let disconnect = Disconnect {
                    code,
                    reason,
                    reconnect,
                };
                tokio::spawn(async move {
                    for client in clients {
                        client.close(disconnect.clone()).await;
                    }
                });
            }
            ControlPayload::Survey { id, op, .. } => {
                // No built-in aggregation; applications drive surveys.
                debug!(id, op = %op, "control: survey ignored");
            }
        }
    }
}
