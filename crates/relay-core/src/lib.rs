//! # relay-core
//!
//! The in-process messaging engine of Relay: many long-lived client
//! connections multiplexed into channel subscriptions, with ordered
//! per-channel fan-out, optional recovery after reconnect, presence, and
//! bounded history.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   commands   ┌────────────┐   publish    ┌────────────┐
//! │ Transport  │─────────────▶│   Client   │─────────────▶│    Node    │
//! └────────────┘              └────────────┘              └────────────┘
//!        ▲                          ▲                           │
//!        │ frames                   │ fan-out                   ▼
//! ┌────────────┐              ┌────────────┐              ┌────────────┐
//! │   Writer   │◀─────────────│    Hub     │◀─────────────│   Broker   │
//! └────────────┘              └────────────┘              └────────────┘
//! ```
//!
//! A publish enters the [`Node`], goes through the [`broker::Broker`]
//! (history write first for recoverable channels), comes back via the
//! broker's event handler, and fans out through the [`hub::Hub`] to each
//! subscribed [`client::Client`], which delivers it through a bounded
//! per-connection write queue — optionally coalesced per channel by the
//! [`batch::PerChannelWriter`].
//!
//! The engines ([`broker::Broker`], [`presence::PresenceManager`],
//! [`history::HistoryManager`]) are trait objects selected per node;
//! in-memory implementations ship in this crate, external ones (Redis,
//! NATS) implement the same contracts.

pub mod batch;
pub mod broker;
pub mod client;
pub mod config;
pub mod control;
pub mod errors;
pub mod history;
pub mod hub;
pub mod node;
pub mod presence;
pub mod queue;
pub mod recovery;
pub mod transport;
pub mod types;
pub mod writer;

pub use batch::{ChannelBatchConfig, PerChannelWriter};
pub use broker::{Broker, BrokerEventHandler, MemoryBroker, PublishOptions};
pub use client::Client;
pub use config::{
    ChannelOptions, Config, Credentials, MessageHandler, RpcHandler, TokenVerifier,
};
pub use control::NodeInfo;
pub use errors::{ClientError, Disconnect, Error};
pub use history::{HistoryFilter, HistoryManager, HistoryOptions, MemoryHistoryManager};
pub use hub::Hub;
pub use node::Node;
pub use presence::{
    MemoryPresenceConfig, MemoryPresenceManager, PresenceManager, PresenceStats,
};
pub use queue::{Item, Queue};
pub use transport::{Transport, TransportError};
pub use types::ChannelId;
pub use writer::Writer;

pub use relay_protocol::{ClientInfo, Encoding, Publication, StreamPosition};
