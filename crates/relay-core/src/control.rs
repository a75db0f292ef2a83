//! Cluster control-plane messages.
//!
//! Control messages travel through the broker's control channel and reach
//! every node, the sender included. They carry node heartbeats and
//! cluster-wide unsubscribe/disconnect requests.

use crate::errors::Error;
use serde::{Deserialize, Serialize};

/// Envelope of one control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Id of the sending node.
    pub uid: String,
    /// The control operation.
    #[serde(flatten)]
    pub payload: ControlPayload,
}

/// Control operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ControlPayload {
    /// Periodic node heartbeat with counters.
    Node(NodeInfo),
    /// Remove one user's subscription to a channel on every node.
    Unsubscribe {
        /// Target user.
        user: String,
        /// Target channel.
        channel: String,
    },
    /// Terminate one user's sessions on every node.
    Disconnect {
        /// Target user.
        user: String,
        /// Disconnect code.
        code: u16,
        /// Disconnect reason.
        reason: String,
        /// Whether clients should reconnect.
        reconnect: bool,
    },
    /// Cluster-wide query; aggregation is an application concern.
    Survey {
        /// Correlates responses to the query.
        id: u64,
        /// Operation name.
        op: String,
        /// Opaque query payload.
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

/// Heartbeat counters of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name from configuration.
    pub name: String,
    /// Node version string.
    pub version: String,
    /// Connections on the node.
    pub num_clients: usize,
    /// Distinct users on the node.
    pub num_users: usize,
    /// Channels with at least one subscriber on the node.
    pub num_channels: usize,
    /// Seconds since the node started.
    pub uptime: u64,
}

/// Encode a control message with the binary codec.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_control(message: &ControlMessage) -> Result<Vec<u8>, Error> {
    rmp_serde::to_vec_named(message).map_err(|e| Error::Internal(e.to_string()))
}

/// Decode a control message.
///
/// # Errors
///
/// Returns an error on malformed payloads.
pub fn decode_control(data: &[u8]) -> Result<ControlMessage, Error> {
    rmp_serde::from_slice(data).map_err(|e| Error::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let messages = vec![
            ControlMessage {
                uid: "node-1".into(),
                payload: ControlPayload::Node(NodeInfo {
                    name: "relay".into(),
                    version: "0.3.0".into(),
                    num_clients: 10,
                    num_users: 7,
                    num_channels: 3,
                    uptime: 120,
                }),
            },
            ControlMessage {
                uid: "node-1".into(),
                payload: ControlPayload::Unsubscribe {
                    user: "42".into(),
                    channel: "news".into(),
                },
            },
            ControlMessage {
                uid: "node-2".into(),
                payload: ControlPayload::Disconnect {
                    user: "42".into(),
                    code: 3000,
                    reason: "normal".into(),
                    reconnect: true,
                },
            },
            ControlMessage {
                uid: "node-2".into(),
                payload: ControlPayload::Survey {
                    id: 1,
                    op: "channels".into(),
                    data: vec![1, 2, 3],
                },
            },
        ];
        for message in messages {
            let encoded = encode_control(&message).unwrap();
            let decoded = decode_control(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }
}
