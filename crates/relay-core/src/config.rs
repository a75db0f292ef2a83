//! Engine configuration.
//!
//! `Config` collects the scalar knobs plus the per-channel and
//! authentication callbacks. All fields have working defaults so a node
//! can be constructed with `Config::default()` and tuned per deployment.

use crate::batch::ChannelBatchConfig;
use crate::errors::ClientError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Per-channel behavior, resolved through [`Config::get_channel_options`].
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Track connections in channel presence.
    pub presence: bool,
    /// Deliver join/leave pushes to interested subscribers.
    pub join_leave: bool,
    /// Number of publications retained in history; zero disables history.
    pub history_size: usize,
    /// Lifetime of the history stream without new publications; zero
    /// means the stream never expires.
    pub history_ttl: Duration,
    /// Allow clients to recover missed publications on resubscribe.
    /// Requires history.
    pub recover: bool,
}

/// Credentials produced by the token verification hook.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// User identifier; empty means anonymous.
    pub user_id: String,
    /// Unix seconds at which the session expires; `None` means never.
    pub expire_at: Option<u64>,
    /// Opaque connection info attached to presence and join/leave events.
    pub info: Option<Vec<u8>>,
}

/// Verifies connection and refresh tokens.
///
/// The engine has no authentication policy of its own; this hook is the
/// only authentication surface.
pub trait TokenVerifier: Send + Sync {
    /// Verify a token and produce session credentials.
    ///
    /// # Errors
    ///
    /// Return [`ClientError::unauthorized`] or
    /// [`ClientError::token_expired`] to reject the token.
    fn verify(&self, token: &str) -> Result<Credentials, ClientError>;
}

/// Application handler for the `rpc` command.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle one RPC call and produce the response payload.
    async fn handle(&self, user: &str, method: &str, data: &[u8]) -> Result<Vec<u8>, ClientError>;
}

/// Application handler for one-way `send` messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message. There is no reply channel.
    async fn handle(&self, user: &str, data: &[u8]);
}

/// Callback resolving per-channel options.
pub type ChannelOptionsFn = Arc<dyn Fn(&str) -> ChannelOptions + Send + Sync>;

/// Callback resolving the per-channel batching policy.
pub type ChannelBatchConfigFn = Arc<dyn Fn(&str) -> ChannelBatchConfig + Send + Sync>;

/// Callback deciding whether presence user-mapping is enabled for a
/// channel.
pub type UserMappingFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Node configuration.
#[derive(Clone)]
pub struct Config {
    /// Node name announced in cluster heartbeats.
    pub name: String,
    /// Server version string reported to clients.
    pub version: String,

    /// Interval of server pings on client transports.
    pub client_ping_interval: Duration,
    /// Time limit for a single transport write; zero disables.
    pub client_message_write_timeout: Duration,
    /// Per-connection write queue byte limit; exceeding it disconnects
    /// the client as slow.
    pub client_queue_max_size: usize,
    /// Maximum size of one inbound transport frame.
    pub client_request_max_size: usize,
    /// How long a connection may stay unauthenticated before it is
    /// closed as stale.
    pub client_stale_close_delay: Duration,
    /// Grace window between the token-expired notice and the expired
    /// disconnect.
    pub client_expired_close_delay: Duration,
    /// Maximum channels per connection.
    pub client_channel_limit: usize,
    /// Maximum frames merged into one transport write.
    pub client_max_messages_in_frame: usize,

    /// Maximum channel name length.
    pub channel_max_length: usize,

    /// Presence entry lifetime without refresh.
    pub presence_ttl: Duration,
    /// Interval of the node's presence refresh loop.
    pub presence_refresh_interval: Duration,
    /// Interval of cluster NODE heartbeats.
    pub node_info_publish_interval: Duration,

    /// Resolve per-channel options. Defaults to `ChannelOptions::default`
    /// for every channel.
    pub get_channel_options: ChannelOptionsFn,
    /// Resolve the per-channel batching policy; `None` disables batching
    /// entirely.
    pub get_channel_batch_config: Option<ChannelBatchConfigFn>,
    /// Per-channel presence user-mapping switch; `None` disables the
    /// user-mapping index.
    pub presence_user_mapping: Option<UserMappingFn>,

    /// Token verification hook; `None` accepts every connection as
    /// anonymous.
    pub token_verifier: Option<Arc<dyn TokenVerifier>>,
    /// RPC dispatch hook; `None` answers rpc commands with "method not
    /// found".
    pub rpc_handler: Option<Arc<dyn RpcHandler>>,
    /// One-way message hook; `None` drops send commands.
    pub message_handler: Option<Arc<dyn MessageHandler>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "relay".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            client_ping_interval: Duration::from_secs(25),
            client_message_write_timeout: Duration::from_secs(1),
            client_queue_max_size: 1024 * 1024,
            client_request_max_size: 64 * 1024,
            client_stale_close_delay: Duration::from_secs(25),
            client_expired_close_delay: Duration::from_secs(25),
            client_channel_limit: 128,
            client_max_messages_in_frame: 16,
            channel_max_length: 255,
            presence_ttl: Duration::from_secs(60),
            presence_refresh_interval: Duration::from_secs(25),
            node_info_publish_interval: Duration::from_secs(3),
            get_channel_options: Arc::new(|_| ChannelOptions::default()),
            get_channel_batch_config: None,
            presence_user_mapping: None,
            token_verifier: None,
            rpc_handler: None,
            message_handler: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("client_ping_interval", &self.client_ping_interval)
            .field("client_queue_max_size", &self.client_queue_max_size)
            .field("client_request_max_size", &self.client_request_max_size)
            .field("client_channel_limit", &self.client_channel_limit)
            .field("channel_max_length", &self.channel_max_length)
            .field("presence_ttl", &self.presence_ttl)
            .field(
                "node_info_publish_interval",
                &self.node_info_publish_interval,
            )
            .finish_non_exhaustive()
    }
}
