//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use relay_core::{ChannelBatchConfig, ChannelOptions};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Node name announced in cluster heartbeats.
    #[serde(default = "default_name")]
    pub name: String,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Default per-channel behavior.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Interval of server ping frames in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Per-write timeout in milliseconds; zero disables.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-connection write queue byte limit.
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,

    /// Maximum size of one inbound frame.
    #[serde(default = "default_request_max_size")]
    pub request_max_size: usize,

    /// Maximum channels per connection.
    #[serde(default = "default_channel_limit")]
    pub channel_limit: usize,

    /// Maximum channel name length.
    #[serde(default = "default_channel_max_length")]
    pub channel_max_length: usize,
}

/// Default per-channel behavior applied to every channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Track presence.
    #[serde(default)]
    pub presence: bool,

    /// Deliver join/leave pushes.
    #[serde(default)]
    pub join_leave: bool,

    /// Publications retained in history; zero disables history.
    #[serde(default)]
    pub history_size: usize,

    /// History stream lifetime in seconds; zero means streams never
    /// expire.
    #[serde(default = "default_history_ttl")]
    pub history_ttl_s: u64,

    /// Allow offset-based recovery on resubscribe.
    #[serde(default)]
    pub recover: bool,

    /// Frames batched per flush; zero disables the size trigger.
    #[serde(default)]
    pub batch_max_size: usize,

    /// Batch flush delay in milliseconds; zero disables the delay
    /// trigger.
    #[serde(default)]
    pub batch_max_delay_ms: u64,

    /// Keep only the newest frame per batch.
    #[serde(default)]
    pub batch_flush_latest: bool,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Entry lifetime in seconds.
    #[serde(default = "default_presence_ttl")]
    pub ttl_s: u64,

    /// Refresh interval in seconds.
    #[serde(default = "default_presence_refresh")]
    pub refresh_interval_s: u64,

    /// Maintain exact per-user counters.
    #[serde(default)]
    pub user_mapping: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_name() -> String {
    std::env::var("RELAY_NAME").unwrap_or_else(|_| "relay".to_string())
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/connection/websocket".to_string()
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_write_timeout() -> u64 {
    1_000
}

fn default_queue_max_size() -> usize {
    1024 * 1024
}

fn default_request_max_size() -> usize {
    64 * 1024
}

fn default_channel_limit() -> usize {
    128
}

fn default_channel_max_length() -> usize {
    255
}

fn default_history_ttl() -> u64 {
    300
}

fn default_presence_ttl() -> u64 {
    60
}

fn default_presence_refresh() -> u64 {
    25
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_name(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            channels: ChannelsConfig::default(),
            presence: PresenceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            ping_interval_ms: default_ping_interval(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_max_size: default_queue_max_size(),
            request_max_size: default_request_max_size(),
            channel_limit: default_channel_limit(),
            channel_max_length: default_channel_max_length(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            presence: false,
            join_leave: false,
            history_size: 0,
            history_ttl_s: default_history_ttl(),
            recover: false,
            batch_max_size: 0,
            batch_max_delay_ms: 0,
            batch_flush_latest: false,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_s: default_presence_ttl(),
            refresh_interval_s: default_presence_refresh(),
            user_mapping: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Build the engine configuration from the server settings.
    #[must_use]
    pub fn engine_config(&self) -> relay_core::Config {
        let channels = self.channels.clone();
        let channel_options = ChannelOptions {
            presence: channels.presence,
            join_leave: channels.join_leave,
            history_size: channels.history_size,
            history_ttl: Duration::from_secs(channels.history_ttl_s),
            recover: channels.recover,
        };
        let batch = ChannelBatchConfig {
            max_size: channels.batch_max_size,
            max_delay: Duration::from_millis(channels.batch_max_delay_ms),
            flush_latest: channels.batch_flush_latest,
        };

        let mut engine = relay_core::Config {
            name: self.name.clone(),
            client_ping_interval: Duration::from_millis(self.transport.ping_interval_ms),
            client_message_write_timeout: Duration::from_millis(self.transport.write_timeout_ms),
            client_queue_max_size: self.limits.queue_max_size,
            client_request_max_size: self.limits.request_max_size,
            client_channel_limit: self.limits.channel_limit,
            channel_max_length: self.limits.channel_max_length,
            presence_ttl: Duration::from_secs(self.presence.ttl_s),
            presence_refresh_interval: Duration::from_secs(self.presence.refresh_interval_s),
            get_channel_options: Arc::new(move |_| channel_options.clone()),
            ..Default::default()
        };
        if batch.is_active() {
            engine.get_channel_batch_config = Some(Arc::new(move |_| batch));
        }
        if self.presence.user_mapping {
            engine.presence_user_mapping = Some(Arc::new(|_| true));
        }
        engine
    }
}
