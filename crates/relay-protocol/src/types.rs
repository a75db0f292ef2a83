//! Shared wire data types.
//!
//! These types appear in both directions of the protocol: inside command
//! results, history replies, and server pushes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Information about the connection that produced a publication or joined
/// a channel.
///
/// `client` is the server-generated connection identifier; `user` comes
/// from the credentials hook and is empty for anonymous connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Connection identifier.
    pub client: String,
    /// User identifier, empty for anonymous connections.
    #[serde(default)]
    pub user: String,
    /// Opaque connection-level info attached on connect.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub conn_info: Option<Vec<u8>>,
    /// Opaque channel-level info attached on subscribe.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub chan_info: Option<Vec<u8>>,
}

impl ClientInfo {
    /// Create client info for a connection.
    #[must_use]
    pub fn new(client: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            user: user.into(),
            conn_info: None,
            chan_info: None,
        }
    }
}

/// A single message published into a channel.
///
/// Publications are immutable once issued. `offset` is assigned by the
/// history stream for recoverable channels; zero means the publication is
/// not part of a recoverable stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Position in the channel stream, zero when non-recoverable.
    #[serde(default)]
    pub offset: u64,
    /// Opaque payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Info about the publishing connection, if client-published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    /// Optional application tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

impl Publication {
    /// Create a publication from raw payload bytes.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: 0,
            data: data.into(),
            info: None,
            tags: None,
        }
    }

    /// Attach publisher info.
    #[must_use]
    pub fn with_info(mut self, info: ClientInfo) -> Self {
        self.info = Some(info);
        self
    }
}

/// Position inside a channel history stream.
///
/// Offsets increase monotonically within one epoch; the epoch changes
/// whenever the underlying stream is discarded, signalling a history
/// discontinuity to recovering clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Offset of the last publication in the stream.
    #[serde(default)]
    pub offset: u64,
    /// Stream epoch.
    #[serde(default)]
    pub epoch: String,
}

impl StreamPosition {
    /// Create a stream position.
    #[must_use]
    pub fn new(offset: u64, epoch: impl Into<String>) -> Self {
        Self {
            offset,
            epoch: epoch.into(),
        }
    }
}
