//! Broker contract and the in-memory single-node broker.
//!
//! The broker is the cross-node publish/subscribe fabric. A publication
//! enters the broker on one node and must reach the handler of every node
//! with interest in the channel, preserving offset order within a
//! channel. Control messages reach every node including the sender.

use crate::errors::Error;
use crate::history::{HistoryManager, HistoryOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use relay_protocol::{ClientInfo, Publication, StreamPosition};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::trace;

/// Options of one publish operation.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Retain the publication in a history stream of this size; zero
    /// disables history for the publication.
    pub history_size: usize,
    /// History stream lifetime; zero means the stream never expires.
    pub history_ttl: Duration,
    /// Info about the publishing connection.
    pub client_info: Option<ClientInfo>,
    /// Application tags attached to the publication.
    pub tags: Option<HashMap<String, String>>,
}

/// Receives events from the broker. Implemented by the node.
///
/// Within one channel, calls arrive in offset order; across channels no
/// order is guaranteed.
pub trait BrokerEventHandler: Send + Sync {
    /// A publication was delivered for a channel this node subscribed to.
    fn handle_publication(
        &self,
        channel: &str,
        publication: Publication,
        sp: Option<StreamPosition>,
    );

    /// A join event was delivered for a channel.
    fn handle_join(&self, channel: &str, info: ClientInfo);

    /// A leave event was delivered for a channel.
    fn handle_leave(&self, channel: &str, info: ClientInfo);

    /// A control message was delivered (all nodes, including the sender).
    fn handle_control(&self, data: Vec<u8>);
}

/// Cross-node publish/subscribe fabric.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Install the event handler and start delivering events.
    async fn run(&self, handler: Arc<dyn BrokerEventHandler>) -> Result<(), Error>;

    /// Publish into a channel. When the channel has history, the
    /// publication is written to the stream first and the assigned
    /// position is returned; otherwise the zero position.
    async fn publish(
        &self,
        channel: &str,
        publication: Publication,
        opts: &PublishOptions,
    ) -> Result<StreamPosition, Error>;

    /// Publish a join event into a channel.
    async fn publish_join(&self, channel: &str, info: ClientInfo) -> Result<(), Error>;

    /// Publish a leave event into a channel.
    async fn publish_leave(&self, channel: &str, info: ClientInfo) -> Result<(), Error>;

    /// Register this node's interest in a channel. Called when the first
    /// local subscriber appears.
    async fn subscribe(&self, channel: &str) -> Result<(), Error>;

    /// Drop this node's interest in a channel. Called when the last
    /// local subscriber leaves.
    async fn unsubscribe(&self, channel: &str) -> Result<(), Error>;

    /// Deliver an opaque control message to every node, the sender
    /// included.
    async fn publish_control(&self, data: Vec<u8>) -> Result<(), Error>;

    /// Release resources and stop delivering events.
    async fn close(&self) -> Result<(), Error>;
}

/// Single-process broker.
///
/// Delivers synchronously to the local handler. History writes are
/// delegated to the history manager the broker is constructed with, so
/// the same manager answers history reads issued by the node.
pub struct MemoryBroker {
    history: Arc<dyn HistoryManager>,
    handler: RwLock<Option<Arc<dyn BrokerEventHandler>>>,
    interest: DashMap<String, ()>,
}

impl MemoryBroker {
    /// Create a broker backed by the given history manager.
    #[must_use]
    pub fn new(history: Arc<dyn HistoryManager>) -> Self {
        Self {
            history,
            handler: RwLock::new(None),
            interest: DashMap::new(),
        }
    }

    fn handler(&self) -> Option<Arc<dyn BrokerEventHandler>> {
        self.handler.read().unwrap().clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn run(&self, handler: Arc<dyn BrokerEventHandler>) -> Result<(), Error> {
        *self.handler.write().unwrap() = Some(handler);
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        mut publication: Publication,
        opts: &PublishOptions,
    ) -> Result<StreamPosition, Error> {
        if publication.info.is_none() {
            publication.info = opts.client_info.clone();
        }
        if publication.tags.is_none() {
            publication.tags = opts.tags.clone();
        }

        let sp = if opts.history_size > 0 {
            let history_opts = HistoryOptions {
                size: opts.history_size,
                ttl: opts.history_ttl,
            };
            let sp = self
                .history
                .add_history(channel, publication.clone(), &history_opts)
                .await?;
            publication.offset = sp.offset;
            Some(sp)
        } else {
            None
        };

        if let Some(handler) = self.handler() {
            if self.interest.contains_key(channel) {
                trace!(channel = %channel, offset = publication.offset, "delivering publication");
                handler.handle_publication(channel, publication, sp.clone());
            }
        }
        Ok(sp.unwrap_or_default())
    }

    async fn publish_join(&self, channel: &str, info: ClientInfo) -> Result<(), Error> {
        if let Some(handler) = self.handler() {
            if self.interest.contains_key(channel) {
                handler.handle_join(channel, info);
            }
        }
        Ok(())
    }

    async fn publish_leave(&self, channel: &str, info: ClientInfo) -> Result<(), Error> {
        if let Some(handler) = self.handler() {
            if self.interest.contains_key(channel) {
                handler.handle_leave(channel, info);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), Error> {
        trace!(channel = %channel, "broker subscribe");
        self.interest.insert(channel.to_string(), ());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), Error> {
        trace!(channel = %channel, "broker unsubscribe");
        self.interest.remove(channel);
        Ok(())
    }

    async fn publish_control(&self, data: Vec<u8>) -> Result<(), Error> {
        if let Some(handler) = self.handler() {
            handler.handle_control(data);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.handler.write().unwrap().take();
        self.interest.clear();
        Ok(())
    }
}
