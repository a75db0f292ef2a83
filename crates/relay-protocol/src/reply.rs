//! Server-to-client replies and pushes.
//!
//! A reply answers the command with the matching `id`. Server-initiated
//! pushes reuse the reply envelope with `id = 0`.

use crate::types::{ClientInfo, Publication};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the answered command; zero for pushes.
    #[serde(default)]
    pub id: u32,
    /// Error, mutually exclusive with `result` in practice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
    /// Result of the command, keyed by method name on the wire.
    #[serde(flatten)]
    pub result: Option<ReplyResult>,
}

impl Reply {
    /// Reply with a result.
    #[must_use]
    pub fn ok(id: u32, result: ReplyResult) -> Self {
        Self {
            id,
            error: None,
            result: Some(result),
        }
    }

    /// Error reply for a failed command.
    #[must_use]
    pub fn err(id: u32, error: ErrorReply) -> Self {
        Self {
            id,
            error: Some(error),
            result: None,
        }
    }

    /// Server push, delivered with id 0.
    #[must_use]
    pub fn push(push: Push) -> Self {
        Self {
            id: 0,
            error: None,
            result: Some(ReplyResult::Push(push)),
        }
    }
}

/// Error payload of a failed command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Stable numeric error code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
    /// Whether the client may retry the same command.
    #[serde(default)]
    pub temporary: bool,
}

/// Typed command results, tagged by method name on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyResult {
    Connect(ConnectResult),
    Subscribe(SubscribeResult),
    Unsubscribe(UnsubscribeResult),
    Publish(PublishResult),
    Presence(PresenceResult),
    PresenceStats(PresenceStatsResult),
    History(HistoryResult),
    Rpc(RpcResult),
    Refresh(RefreshResult),
    Ping(PingResult),
    Push(Push),
}

/// Result of the `connect` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectResult {
    /// Server-generated connection id.
    pub client: String,
    /// Server version string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Whether the session expires and must be refreshed.
    #[serde(default)]
    pub expires: bool,
    /// Seconds until expiration when `expires` is set.
    #[serde(default)]
    pub ttl: u32,
    /// Initial data for channels subscribed during connect.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeResult>,
}

/// Result of the `subscribe` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResult {
    /// Whether the channel maintains a recoverable stream.
    #[serde(default)]
    pub recoverable: bool,
    /// Whether recovery fully covered the requested range.
    #[serde(default)]
    pub recovered: bool,
    /// Current stream offset.
    #[serde(default)]
    pub offset: u64,
    /// Current stream epoch.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    /// Publications missed while disconnected, in offset order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
}

/// Result of the `unsubscribe` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeResult {}

/// Result of the `publish` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Offset assigned to the publication, zero for non-recoverable
    /// channels.
    #[serde(default)]
    pub offset: u64,
}

/// Result of the `presence` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceResult {
    /// Present connections keyed by client id.
    pub presence: HashMap<String, ClientInfo>,
}

/// Result of the `presence_stats` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceStatsResult {
    /// Number of connections in the channel.
    pub num_clients: u32,
    /// Number of distinct users in the channel.
    pub num_users: u32,
}

/// Result of the `history` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResult {
    /// Publications in requested order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    /// Current stream offset.
    #[serde(default)]
    pub offset: u64,
    /// Current stream epoch.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
}

/// Result of the `rpc` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    /// Opaque response payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Result of the `refresh` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshResult {
    /// Whether the refreshed session still expires.
    #[serde(default)]
    pub expires: bool,
    /// Seconds until the next expiration.
    #[serde(default)]
    pub ttl: u32,
}

/// Result of the `ping` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingResult {}

/// A server-initiated push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    /// Channel the push belongs to; empty for connection-level pushes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    /// The push body.
    #[serde(flatten)]
    pub kind: PushKind,
}

impl Push {
    /// Publication push for a channel.
    #[must_use]
    pub fn publication(channel: impl Into<String>, publication: Publication) -> Self {
        Self {
            channel: channel.into(),
            kind: PushKind::Pub(publication),
        }
    }

    /// Join push for a channel.
    #[must_use]
    pub fn join(channel: impl Into<String>, info: ClientInfo) -> Self {
        Self {
            channel: channel.into(),
            kind: PushKind::Join(info),
        }
    }

    /// Leave push for a channel.
    #[must_use]
    pub fn leave(channel: impl Into<String>, info: ClientInfo) -> Self {
        Self {
            channel: channel.into(),
            kind: PushKind::Leave(info),
        }
    }

    /// Server-initiated unsubscribe push for a channel.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            kind: PushKind::Unsubscribe(UnsubscribePush {}),
        }
    }

    /// One-way message push, not tied to a channel.
    #[must_use]
    pub fn message(data: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: String::new(),
            kind: PushKind::Message(MessagePush { data: data.into() }),
        }
    }

    /// Token expiration notice; the client must refresh within the grace
    /// window or be disconnected.
    #[must_use]
    pub fn token_expired() -> Self {
        Self {
            channel: String::new(),
            kind: PushKind::TokenExpired(TokenExpiredPush {}),
        }
    }
}

/// Push bodies, tagged by kind on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// New publication in a subscribed channel.
    #[serde(rename = "pub")]
    Pub(Publication),
    /// A connection joined the channel.
    Join(ClientInfo),
    /// A connection left the channel.
    Leave(ClientInfo),
    /// The server removed this connection's subscription.
    Unsubscribe(UnsubscribePush),
    /// One-way server message.
    Message(MessagePush),
    /// Session credentials expired; refresh or be disconnected.
    TokenExpired(TokenExpiredPush),
}

/// Body of an `unsubscribe` push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribePush {}

/// Body of a `message` push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePush {
    /// Opaque message payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Body of a `token_expired` push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenExpiredPush {}
