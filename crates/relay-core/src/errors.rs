//! Error taxonomy of the engine.
//!
//! Three distinct error surfaces exist:
//!
//! - [`ClientError`] — a per-command failure surfaced in the reply that
//!   carries the command id; the connection stays open.
//! - [`Disconnect`] — a fatal condition that terminates the connection,
//!   with a stable code, a reason string, and a reconnect hint.
//! - [`Error`] — failures of node-level operations (publish, history,
//!   presence) surfaced to library callers.

use relay_protocol::{ErrorReply, ProtocolError};
use thiserror::Error;

/// A per-command error surfaced in the reply to the failing command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("client error {code}: {message}")]
pub struct ClientError {
    /// Stable numeric code from the registry below.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
    /// Whether the client may retry the same command.
    pub temporary: bool,
}

impl ClientError {
    fn new(code: u32, message: &str, temporary: bool) -> Self {
        Self {
            code,
            message: message.into(),
            temporary,
        }
    }

    /// Unexpected server-side failure.
    #[must_use]
    pub fn internal() -> Self {
        Self::new(100, "internal server error", true)
    }

    /// Credentials missing or rejected.
    #[must_use]
    pub fn unauthorized() -> Self {
        Self::new(101, "unauthorized", false)
    }

    /// Operation on a channel this node knows nothing about.
    #[must_use]
    pub fn unknown_channel() -> Self {
        Self::new(102, "unknown channel", false)
    }

    /// Operation not permitted for this connection.
    #[must_use]
    pub fn permission_denied() -> Self {
        Self::new(103, "permission denied", false)
    }

    /// Unknown command or RPC method.
    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(104, "method not found", false)
    }

    /// Duplicate subscription to the same channel.
    #[must_use]
    pub fn already_subscribed() -> Self {
        Self::new(105, "already subscribed", false)
    }

    /// A configured limit was hit (channel count, request size, ...).
    #[must_use]
    pub fn limit_exceeded() -> Self {
        Self::new(106, "limit exceeded", false)
    }

    /// Malformed or out-of-place command.
    #[must_use]
    pub fn bad_request() -> Self {
        Self::new(107, "bad request", false)
    }

    /// Feature disabled for the channel (presence, history, ...).
    #[must_use]
    pub fn not_available() -> Self {
        Self::new(108, "not available", false)
    }

    /// Transient backend failure; safe to retry.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::new(108, "temporarily unavailable", true)
    }

    /// Supplied token has expired.
    #[must_use]
    pub fn token_expired() -> Self {
        Self::new(109, "token expired", false)
    }

    /// Session credentials expired.
    #[must_use]
    pub fn expired() -> Self {
        Self::new(110, "expired", false)
    }

    /// Recovery position is no longer available in the stream.
    #[must_use]
    pub fn unrecoverable_position() -> Self {
        Self::new(112, "unrecoverable position", false)
    }
}

impl From<ClientError> for ErrorReply {
    fn from(e: ClientError) -> Self {
        ErrorReply {
            code: e.code,
            message: e.message,
            temporary: e.temporary,
        }
    }
}

impl From<Error> for ClientError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidChannel(_) => ClientError::bad_request(),
            Error::Unavailable(_) => ClientError::unavailable(),
            Error::NodeClosed => ClientError::unavailable(),
            _ => ClientError::internal(),
        }
    }
}

/// A terminal instruction for a connection.
///
/// `reconnect = false` tells the client not to try again with the same
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Close code, also used as the WebSocket close status.
    pub code: u16,
    /// Short reason delivered in the close frame.
    pub reason: String,
    /// Whether the client should reconnect.
    pub reconnect: bool,
}

impl Disconnect {
    fn new(code: u16, reason: &str, reconnect: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            reconnect,
        }
    }

    /// Clean close initiated by the server.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(3000, "normal", true)
    }

    /// Node is shutting down.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::new(3001, "shutdown", true)
    }

    /// Token did not verify.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::new(3004, "invalid token", false)
    }

    /// Protocol violation.
    #[must_use]
    pub fn bad_request() -> Self {
        Self::new(3005, "bad request", false)
    }

    /// Unexpected server-side failure.
    #[must_use]
    pub fn server_error() -> Self {
        Self::new(3006, "internal server error", true)
    }

    /// Session credentials expired and were not refreshed in time.
    #[must_use]
    pub fn expired() -> Self {
        Self::new(3007, "expired", true)
    }

    /// Connection never completed its handshake.
    #[must_use]
    pub fn stale() -> Self {
        Self::new(3009, "stale", false)
    }

    /// Write queue exceeded its byte limit.
    #[must_use]
    pub fn slow() -> Self {
        Self::new(3010, "slow", true)
    }

    /// Transport write failed.
    #[must_use]
    pub fn write_error() -> Self {
        Self::new(3011, "write error", true)
    }

    /// Client position diverged from the channel stream.
    #[must_use]
    pub fn insufficient_state() -> Self {
        Self::new(3012, "insufficient state", true)
    }
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// Node-level operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Node was shut down; no further operations are possible.
    #[error("node closed")]
    NodeClosed,

    /// Channel name failed validation.
    #[error("invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Transient engine failure; safe to retry.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// Wire encoding failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}
