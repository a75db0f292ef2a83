//! Client-to-server commands.
//!
//! Every command carries an `id` that is unique and monotonically
//! increasing per connection. Replies echo the id; several commands may be
//! pipelined into a single transport frame.

use crate::types::StreamPosition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command id, echoed in the reply. Zero is reserved for pushes and
    /// never valid in a command.
    pub id: u32,
    /// The operation and its parameters.
    #[serde(flatten)]
    pub payload: CommandPayload,
}

impl Command {
    /// Create a command.
    #[must_use]
    pub fn new(id: u32, payload: CommandPayload) -> Self {
        Self { id, payload }
    }

    /// Wire name of the command method, used in logs and metrics labels.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self.payload {
            CommandPayload::Connect(_) => "connect",
            CommandPayload::Subscribe(_) => "subscribe",
            CommandPayload::Unsubscribe(_) => "unsubscribe",
            CommandPayload::Publish(_) => "publish",
            CommandPayload::Presence(_) => "presence",
            CommandPayload::PresenceStats(_) => "presence_stats",
            CommandPayload::History(_) => "history",
            CommandPayload::Rpc(_) => "rpc",
            CommandPayload::Refresh(_) => "refresh",
            CommandPayload::Send(_) => "send",
            CommandPayload::Ping => "ping",
        }
    }
}

/// Command methods with their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Establish the session. Must be the first command on a connection.
    Connect(ConnectRequest),
    /// Subscribe to a channel, optionally recovering missed publications.
    Subscribe(SubscribeRequest),
    /// Leave a channel.
    Unsubscribe(UnsubscribeRequest),
    /// Publish data into a channel.
    Publish(PublishRequest),
    /// Read current channel presence.
    Presence(PresenceRequest),
    /// Read presence counters for a channel.
    PresenceStats(PresenceStatsRequest),
    /// Read channel history.
    History(HistoryRequest),
    /// Call a server-defined method.
    Rpc(RpcRequest),
    /// Refresh session credentials.
    Refresh(RefreshRequest),
    /// One-way message to the server, no reply.
    Send(SendRequest),
    /// Application-level ping, replied with an empty result.
    Ping,
}

/// Parameters of the `connect` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Authentication token, empty for anonymous connections.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Client name, for diagnostics.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Channels to subscribe during connect, keyed by channel name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, ConnectSubRequest>,
}

/// Per-channel subscribe options inside a `connect` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectSubRequest {
    /// Ask for recovery of missed publications.
    #[serde(default)]
    pub recover: bool,
    /// Last seen offset when recovering.
    #[serde(default)]
    pub offset: u64,
    /// Last seen epoch when recovering.
    #[serde(default)]
    pub epoch: String,
}

/// Parameters of the `subscribe` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Channel to subscribe to.
    pub channel: String,
    /// Ask for recovery of missed publications.
    #[serde(default)]
    pub recover: bool,
    /// Last seen offset when recovering.
    #[serde(default)]
    pub offset: u64,
    /// Last seen epoch when recovering.
    #[serde(default)]
    pub epoch: String,
}

/// Parameters of the `unsubscribe` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Channel to leave.
    pub channel: String,
}

/// Parameters of the `publish` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Target channel.
    pub channel: String,
    /// Payload to publish.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Parameters of the `presence` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceRequest {
    /// Channel to inspect.
    pub channel: String,
}

/// Parameters of the `presence_stats` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceStatsRequest {
    /// Channel to inspect.
    pub channel: String,
}

/// Parameters of the `history` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Channel to read.
    pub channel: String,
    /// Maximum number of publications to return; zero means no
    /// publications, only the current stream position.
    #[serde(default)]
    pub limit: u32,
    /// Return publications after this position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<StreamPosition>,
    /// Iterate from the stream end towards the beginning.
    #[serde(default)]
    pub reverse: bool,
}

/// Parameters of the `rpc` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Method name resolved by the application handler.
    #[serde(default)]
    pub method: String,
    /// Opaque request payload.
    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Parameters of the `refresh` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// New authentication token.
    pub token: String,
}

/// Parameters of the `send` command (asynchronous, no reply).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Opaque message payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}
