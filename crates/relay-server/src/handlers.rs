//! Connection handlers for the Relay server.
//!
//! One axum WebSocket endpoint feeds the engine: the socket's read half
//! becomes the session's command stream, the write half sits behind a
//! [`relay_core::Transport`] driven by the session's writer loop.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_core::{Client, Disconnect, Node, Transport, TransportError};
use relay_protocol::{codec, Encoding};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The messaging node.
    pub node: Arc<Node>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let node = Node::new(config.engine_config());
    node.run().await?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState {
        node: node.clone(),
        config: config.clone(),
    });

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(node))
        .await?;

    Ok(())
}

async fn shutdown_signal(node: Arc<Node>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
    node.shutdown().await;
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler. `?format=binary` selects the MessagePack
/// protocol, JSON otherwise.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let encoding = match params.get("format").map(String::as_str) {
        Some("binary") => Encoding::Binary,
        _ => Encoding::Json,
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, state, encoding))
}

/// The session's write side over one WebSocket.
struct WebSocketTransport {
    encoding: Encoding,
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

impl WebSocketTransport {
    fn message(&self, data: Bytes) -> Message {
        match self.encoding {
            Encoding::Json => Message::Text(String::from_utf8_lossy(&data).into_owned()),
            Encoding::Binary => Message::Binary(data.to_vec()),
        }
    }

    async fn send_ping(&self) -> Result<(), TransportError> {
        self.sender
            .lock()
            .await
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        metrics::record_message(data.len(), "outbound");
        let message = self.message(data);
        self.sender
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn write_many(&self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let merged = codec::join_frames(&frames, self.encoding);
        self.write(merged).await
    }

    async fn close(&self, disconnect: &Disconnect) -> Result<(), TransportError> {
        metrics::record_disconnect(&disconnect.reason);
        let frame = CloseFrame {
            code: disconnect.code,
            reason: disconnect.reason.clone().into(),
        };
        self.sender
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Handle one WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, encoding: Encoding) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sender, receiver) = socket.split();
    let transport = Arc::new(WebSocketTransport {
        encoding,
        sender: Mutex::new(sender),
    });
    let client = Client::new(state.node.clone(), transport.clone());
    debug!(client = %client.id(), encoding = encoding.name(), "WebSocket connected");

    read_loop(&client, &state, &transport, receiver).await;

    client.close(Disconnect::normal()).await;
    metrics::set_active_channels(state.node.hub().num_channels());
    debug!(client = %client.id(), "WebSocket disconnected");
}

async fn read_loop(
    client: &Arc<Client>,
    state: &Arc<AppState>,
    transport: &Arc<WebSocketTransport>,
    mut receiver: SplitStream<WebSocket>,
) {
    let ping_interval = Duration::from_millis(state.config.transport.ping_interval_ms.max(1));
    // A pong must arrive within pong_wait of the matching ping.
    let pong_wait = ping_interval * 10 / 9;
    let mut ping_timer = tokio::time::interval(ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > ping_interval + pong_wait {
                    debug!(client = %client.id(), "pong deadline exceeded");
                    client.close(Disconnect::stale()).await;
                    break;
                }
                if transport.send_ping().await.is_err() {
                    break;
                }
            }

            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_message(data.len(), "inbound");
                        if let Err(disconnect) = client.handle(&data).await {
                            client.close(disconnect).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message(text.len(), "inbound");
                        if let Err(disconnect) = client.handle(text.as_bytes()).await {
                            client.close(disconnect).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // axum answers pings automatically.
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(client = %client.id(), "received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %client.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(client = %client.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }
}
