//! Transport seam between sessions and the outside world.
//!
//! The engine never touches sockets. A transport hands inbound frames to
//! the session (driven by the server's read loop) and implements the
//! write side used by the session's writer task.

use crate::errors::Disconnect;
use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::Encoding;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("connection closed")]
    Closed,

    /// Write deadline elapsed.
    #[error("write timed out")]
    Timeout,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other transport failure.
    #[error("{0}")]
    Other(String),
}

/// The write side of one client connection.
///
/// Implementations must be safe for concurrent calls; the engine
/// serializes writes through the session's writer task but may call
/// `close` from another task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g. "websocket"), for logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Protocol encoding negotiated for this connection.
    fn encoding(&self) -> Encoding;

    /// Write one already-encoded frame.
    async fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Write several frames as one transport message.
    ///
    /// Frames were encoded with [`Transport::encoding`]; implementations
    /// typically merge them with
    /// [`relay_protocol::codec::join_frames`].
    async fn write_many(&self, frames: Vec<Bytes>) -> Result<(), TransportError>;

    /// Close the connection, conveying the disconnect code and reason.
    async fn close(&self, disconnect: &Disconnect) -> Result<(), TransportError>;
}
