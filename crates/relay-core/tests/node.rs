//! End-to-end engine tests: a node with in-memory engines driven through
//! mock transports.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relay_core::{
    ChannelBatchConfig, ChannelOptions, Client, ClientError, Config, Credentials, Disconnect,
    Node, RpcHandler, TokenVerifier, Transport, TransportError,
};
use relay_protocol::{
    codec, Command, CommandPayload, ConnectRequest, ConnectSubRequest, Encoding, HistoryRequest,
    PresenceStatsRequest, PublishRequest, Push, PushKind, Reply, ReplyResult, SubscribeRequest,
    UnsubscribeRequest,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Transport test double: writes land in an mpsc sink, close records the
/// disconnect.
struct TestTransport {
    encoding: Encoding,
    sink: mpsc::UnboundedSender<Bytes>,
    closed: Mutex<Option<Disconnect>>,
    closed_notify: Notify,
}

impl TestTransport {
    fn new(encoding: Encoding) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                encoding,
                sink: tx,
                closed: Mutex::new(None),
                closed_notify: Notify::new(),
            }),
            rx,
        )
    }

    async fn wait_closed(&self) -> Disconnect {
        loop {
            let notified = self.closed_notify.notified();
            if let Some(d) = self.closed.lock().unwrap().clone() {
                return d;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for TestTransport {
    fn name(&self) -> &'static str {
        "test"
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        self.sink.send(data).map_err(|_| TransportError::Closed)
    }

    async fn write_many(&self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let merged = codec::join_frames(&frames, self.encoding);
        self.sink.send(merged).map_err(|_| TransportError::Closed)
    }

    async fn close(&self, disconnect: &Disconnect) -> Result<(), TransportError> {
        *self.closed.lock().unwrap() = Some(disconnect.clone());
        self.closed_notify.notify_waiters();
        Ok(())
    }
}

/// One connected session under test.
struct Session {
    client: Arc<Client>,
    transport: Arc<TestTransport>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Vec<Reply>,
    next_id: u32,
}

impl Session {
    async fn open(node: &Arc<Node>, encoding: Encoding) -> Self {
        let (transport, rx) = TestTransport::new(encoding);
        let client = Client::new(node.clone(), transport.clone());
        Self {
            client,
            transport,
            rx,
            pending: Vec::new(),
            next_id: 0,
        }
    }

    async fn send(&mut self, payload: CommandPayload) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        let frame =
            codec::encode_command(&Command::new(id, payload), self.transport.encoding).unwrap();
        self.client
            .handle(&frame)
            .await
            .expect("command handling failed");
        id
    }

    async fn next_reply(&mut self) -> Reply {
        self.next_reply_timeout(Duration::from_secs(1)).await
    }

    async fn next_reply_timeout(&mut self, timeout: Duration) -> Reply {
        if !self.pending.is_empty() {
            return self.pending.remove(0);
        }
        let message = tokio::time::timeout(timeout, self.rx.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("transport sink closed");
        let mut buf = BytesMut::from(&message[..]);
        while let Some(reply) = codec::decode_reply_from(&mut buf, self.transport.encoding).unwrap()
        {
            self.pending.push(reply);
        }
        self.pending.remove(0)
    }

    async fn expect_no_message(&mut self, wait: Duration) {
        assert!(self.pending.is_empty(), "unconsumed replies: {:?}", self.pending);
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_) => {}
            Ok(message) => panic!("unexpected message: {:?}", message),
        }
    }

    async fn connect(&mut self) -> String {
        self.connect_with(ConnectRequest::default()).await
    }

    async fn connect_with(&mut self, req: ConnectRequest) -> String {
        self.send(CommandPayload::Connect(req)).await;
        match self.next_reply().await.result {
            Some(ReplyResult::Connect(result)) => result.client,
            other => panic!("expected connect result, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, channel: &str) {
        self.send(CommandPayload::Subscribe(SubscribeRequest {
            channel: channel.into(),
            ..Default::default()
        }))
        .await;
        let reply = self.next_reply().await;
        assert!(reply.error.is_none(), "subscribe failed: {:?}", reply.error);
    }

    async fn publish(&mut self, channel: &str, data: &[u8]) {
        self.send(CommandPayload::Publish(PublishRequest {
            channel: channel.into(),
            data: data.to_vec(),
        }))
        .await;
        let reply = self.next_reply().await;
        assert!(reply.error.is_none(), "publish failed: {:?}", reply.error);
    }

    /// Wait for the next publication push, skipping other pushes.
    async fn next_publication(&mut self) -> (String, Vec<u8>) {
        loop {
            let reply = self.next_reply().await;
            if let Some(ReplyResult::Push(Push {
                channel,
                kind: PushKind::Pub(publication),
            })) = reply.result
            {
                return (channel, publication.data);
            }
        }
    }

    /// Collect all publications contained in the next sink message.
    async fn next_message_publications(&mut self) -> Vec<Vec<u8>> {
        assert!(self.pending.is_empty());
        let message = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("transport sink closed");
        let mut buf = BytesMut::from(&message[..]);
        let mut out = Vec::new();
        while let Some(reply) = codec::decode_reply_from(&mut buf, self.transport.encoding).unwrap()
        {
            if let Some(ReplyResult::Push(Push {
                kind: PushKind::Pub(publication),
                ..
            })) = reply.result
            {
                out.push(publication.data);
            }
        }
        out
    }
}

fn recoverable_options() -> ChannelOptions {
    ChannelOptions {
        presence: false,
        join_leave: false,
        history_size: 10,
        history_ttl: Duration::from_secs(60),
        recover: true,
    }
}

async fn test_node(config: Config) -> Arc<Node> {
    let node = Node::new(config);
    node.run().await.unwrap();
    node
}

async fn default_test_node() -> Arc<Node> {
    test_node(Config::default()).await
}

#[tokio::test]
async fn test_subscribe_publish_receive() {
    let node = default_test_node().await;
    let mut a = Session::open(&node, Encoding::Json).await;
    a.connect().await;
    a.subscribe("room").await;

    let mut b = Session::open(&node, Encoding::Json).await;
    b.connect().await;
    b.publish("room", br#"{"text":"hi"}"#).await;

    let (channel, data) = a.next_publication().await;
    assert_eq!(channel, "room");
    assert_eq!(data, br#"{"text":"hi"}"#);
    node.shutdown().await;
}

#[tokio::test]
async fn test_binary_session_roundtrip() {
    let node = default_test_node().await;
    let mut a = Session::open(&node, Encoding::Binary).await;
    a.connect().await;
    a.subscribe("room").await;
    node.publish("room", b"payload".to_vec()).await.unwrap();
    let (_, data) = a.next_publication().await;
    assert_eq!(data, b"payload");
    node.shutdown().await;
}

#[tokio::test]
async fn test_replies_in_command_order() {
    let node = default_test_node().await;
    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;

    // Pipeline several commands in one frame.
    let commands = [
        Command::new(
            2,
            CommandPayload::Subscribe(SubscribeRequest {
                channel: "a".into(),
                ..Default::default()
            }),
        ),
        Command::new(
            3,
            CommandPayload::Publish(PublishRequest {
                channel: "a".into(),
                data: b"x".to_vec(),
            }),
        ),
        Command::new(4, CommandPayload::Ping),
    ];
    let frames: Vec<Bytes> = commands
        .iter()
        .map(|c| codec::encode_command(c, Encoding::Json).unwrap())
        .collect();
    let merged = codec::join_frames(&frames, Encoding::Json);
    s.client.handle(&merged).await.unwrap();

    let mut reply_ids = Vec::new();
    while reply_ids.len() < 3 {
        let reply = s.next_reply().await;
        if reply.id != 0 {
            reply_ids.push(reply.id);
        }
    }
    assert_eq!(reply_ids, vec![2, 3, 4]);
    node.shutdown().await;
}

#[tokio::test]
async fn test_command_before_connect_disconnects() {
    let node = default_test_node().await;
    let s = Session::open(&node, Encoding::Json).await;
    let frame = codec::encode_command(
        &Command::new(
            1,
            CommandPayload::Subscribe(SubscribeRequest {
                channel: "early".into(),
                ..Default::default()
            }),
        ),
        Encoding::Json,
    )
    .unwrap();
    let err = s.client.handle(&frame).await.unwrap_err();
    assert_eq!(err, Disconnect::bad_request());
    node.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_disconnects() {
    let node = default_test_node().await;
    let s = Session::open(&node, Encoding::Json).await;
    let err = s.client.handle(b"not json").await.unwrap_err();
    assert_eq!(err, Disconnect::bad_request());
    node.shutdown().await;
}

#[tokio::test]
async fn test_hub_counters_match_subscriptions() {
    let node = default_test_node().await;
    let mut a = Session::open(&node, Encoding::Json).await;
    a.connect().await;
    let mut b = Session::open(&node, Encoding::Json).await;
    b.connect().await;

    a.subscribe("c1").await;
    a.subscribe("c2").await;
    b.subscribe("c1").await;

    assert_eq!(node.hub().num_subscribers("c1"), 2);
    assert_eq!(node.hub().num_subscribers("c2"), 1);
    assert_eq!(node.hub().num_channels(), 2);
    assert_eq!(node.hub().num_clients(), 2);

    b.client.close(Disconnect::normal()).await;
    assert_eq!(node.hub().num_subscribers("c1"), 1);
    assert_eq!(node.hub().num_clients(), 1);
    node.shutdown().await;
}

#[tokio::test]
async fn test_no_publications_after_unsubscribe() {
    let node = default_test_node().await;
    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("room").await;

    node.publish("room", b"before".to_vec()).await.unwrap();
    let (_, data) = s.next_publication().await;
    assert_eq!(data, b"before");

    s.send(CommandPayload::Unsubscribe(UnsubscribeRequest {
        channel: "room".into(),
    }))
    .await;
    let reply = s.next_reply().await;
    assert!(reply.error.is_none());

    node.publish("room", b"after".to_vec()).await.unwrap();
    s.expect_no_message(Duration::from_millis(100)).await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_publication_order_preserved() {
    let mut config = Config::default();
    config.get_channel_options = Arc::new(|_| recoverable_options());
    let node = test_node(config).await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("stream").await;

    for i in 0..20u32 {
        node.publish("stream", format!("m{}", i).into_bytes())
            .await
            .unwrap();
    }
    for i in 0..20u32 {
        let (_, data) = s.next_publication().await;
        assert_eq!(data, format!("m{}", i).into_bytes());
    }
    node.shutdown().await;
}

#[tokio::test]
async fn test_batching_by_delay() {
    let mut config = Config::default();
    config.client_max_messages_in_frame = 1;
    config.get_channel_batch_config = Some(Arc::new(|_| ChannelBatchConfig {
        max_size: 0,
        max_delay: Duration::from_millis(10),
        flush_latest: false,
    }));
    let node = test_node(config).await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("batched").await;

    for i in 0..3u8 {
        node.publish("batched", vec![i]).await.unwrap();
    }
    let batch = s.next_message_publications().await;
    assert_eq!(batch, vec![vec![0], vec![1], vec![2]]);
    node.shutdown().await;
}

#[tokio::test]
async fn test_batching_by_size() {
    let mut config = Config::default();
    config.client_max_messages_in_frame = 1;
    config.get_channel_batch_config = Some(Arc::new(|_| ChannelBatchConfig {
        max_size: 2,
        max_delay: Duration::from_millis(150),
        flush_latest: false,
    }));
    let node = test_node(config).await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("batched").await;

    for i in 0..5u8 {
        node.publish("batched", vec![i]).await.unwrap();
    }
    assert_eq!(s.next_message_publications().await.len(), 2);
    assert_eq!(s.next_message_publications().await.len(), 2);
    // The trailing publication arrives alone once the delay fires.
    assert_eq!(s.next_message_publications().await, vec![vec![4]]);
    node.shutdown().await;
}

#[tokio::test]
async fn test_batching_flush_latest() {
    let mut config = Config::default();
    config.client_max_messages_in_frame = 1;
    config.get_channel_batch_config = Some(Arc::new(|_| ChannelBatchConfig {
        max_size: 2,
        max_delay: Duration::ZERO,
        flush_latest: true,
    }));
    let node = test_node(config).await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("latest").await;

    node.publish("latest", b"m1".to_vec()).await.unwrap();
    node.publish("latest", b"m2".to_vec()).await.unwrap();

    let batch = s.next_message_publications().await;
    assert_eq!(batch, vec![b"m2".to_vec()]);
    s.expect_no_message(Duration::from_millis(50)).await;
    node.shutdown().await;
}

struct UserFromToken;

impl TokenVerifier for UserFromToken {
    fn verify(&self, token: &str) -> Result<Credentials, ClientError> {
        if token.is_empty() {
            return Err(ClientError::unauthorized());
        }
        Ok(Credentials {
            user_id: token.to_string(),
            expire_at: None,
            info: None,
        })
    }
}

fn presence_config() -> Config {
    let mut config = Config::default();
    config.token_verifier = Some(Arc::new(UserFromToken));
    config.get_channel_options = Arc::new(|_| ChannelOptions {
        presence: true,
        join_leave: false,
        history_size: 0,
        history_ttl: Duration::ZERO,
        recover: false,
    });
    config
}

async fn presence_session(node: &Arc<Node>, user: &str, channel: &str) -> Session {
    let mut s = Session::open(node, Encoding::Json).await;
    s.connect_with(ConnectRequest {
        token: user.into(),
        ..Default::default()
    })
    .await;
    s.subscribe(channel).await;
    s
}

#[tokio::test]
async fn test_presence_counts_clients_and_users() {
    let node = test_node(presence_config()).await;
    let c1 = presence_session(&node, "1", "room").await;
    let c2 = presence_session(&node, "1", "room").await;
    let _c3 = presence_session(&node, "2", "room").await;

    let stats = node.presence_stats("room").await.unwrap();
    assert_eq!(stats.num_clients, 3);
    assert_eq!(stats.num_users, 2);

    c2.client.close(Disconnect::normal()).await;
    let stats = node.presence_stats("room").await.unwrap();
    assert_eq!(stats.num_clients, 2);
    assert_eq!(stats.num_users, 2);

    c1.client.close(Disconnect::normal()).await;
    let stats = node.presence_stats("room").await.unwrap();
    assert_eq!(stats.num_clients, 1);
    assert_eq!(stats.num_users, 1);

    // Presence command mirrors the same view.
    let mut c4 = presence_session(&node, "2", "room").await;
    c4.send(CommandPayload::PresenceStats(PresenceStatsRequest {
        channel: "room".into(),
    }))
    .await;
    match c4.next_reply().await.result {
        Some(ReplyResult::PresenceStats(stats)) => {
            assert_eq!(stats.num_clients, 2);
            assert_eq!(stats.num_users, 1);
        }
        other => panic!("expected presence stats, got {:?}", other),
    }
    node.shutdown().await;
}

#[tokio::test]
async fn test_presence_disabled_not_available() {
    let node = default_test_node().await;
    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.send(CommandPayload::PresenceStats(PresenceStatsRequest {
        channel: "plain".into(),
    }))
    .await;
    let reply = s.next_reply().await;
    assert_eq!(reply.error.unwrap().code, 108);
    node.shutdown().await;
}

#[tokio::test]
async fn test_recovery_after_reconnect() {
    let mut config = Config::default();
    config.get_channel_options = Arc::new(|_| recoverable_options());
    let node = test_node(config).await;

    let mut a = Session::open(&node, Encoding::Json).await;
    a.connect().await;
    a.send(CommandPayload::Subscribe(SubscribeRequest {
        channel: "feed".into(),
        ..Default::default()
    }))
    .await;
    let reply = a.next_reply().await;
    let epoch = match reply.result {
        Some(ReplyResult::Subscribe(result)) => {
            assert!(result.recoverable);
            result.epoch
        }
        other => panic!("expected subscribe result, got {:?}", other),
    };

    for data in [b"p1", b"p2", b"p3"] {
        node.publish("feed", data.to_vec()).await.unwrap();
    }
    for _ in 0..3 {
        a.next_publication().await;
    }
    a.client.close(Disconnect::normal()).await;

    node.publish("feed", b"p4".to_vec()).await.unwrap();

    // Resubscribe from p2's offset: exactly p3 and p4 come back.
    let mut b = Session::open(&node, Encoding::Json).await;
    b.connect().await;
    b.send(CommandPayload::Subscribe(SubscribeRequest {
        channel: "feed".into(),
        recover: true,
        offset: 2,
        epoch: epoch.clone(),
    }))
    .await;
    match b.next_reply().await.result {
        Some(ReplyResult::Subscribe(result)) => {
            assert!(result.recovered);
            assert_eq!(result.offset, 4);
            let data: Vec<&[u8]> = result.publications.iter().map(|p| &p.data[..]).collect();
            assert_eq!(data, vec![b"p3".as_slice(), b"p4".as_slice()]);
            assert_eq!(result.publications[0].offset, 3);
            assert_eq!(result.publications[1].offset, 4);
        }
        other => panic!("expected subscribe result, got {:?}", other),
    }
    node.shutdown().await;
}

#[tokio::test]
async fn test_recovery_epoch_mismatch_not_recovered() {
    let mut config = Config::default();
    config.get_channel_options = Arc::new(|_| recoverable_options());
    let node = test_node(config).await;

    node.publish("feed", b"p1".to_vec()).await.unwrap();

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.send(CommandPayload::Subscribe(SubscribeRequest {
        channel: "feed".into(),
        recover: true,
        offset: 1,
        epoch: "stale-epoch".into(),
    }))
    .await;
    match s.next_reply().await.result {
        Some(ReplyResult::Subscribe(result)) => {
            assert!(!result.recovered);
        }
        other => panic!("expected subscribe result, got {:?}", other),
    }
    node.shutdown().await;
}

#[tokio::test]
async fn test_recovery_idempotent() {
    let mut config = Config::default();
    config.get_channel_options = Arc::new(|_| recoverable_options());
    let node = test_node(config).await;

    let epoch = node.publish("feed", b"p1".to_vec()).await.unwrap().epoch;
    node.publish("feed", b"p2".to_vec()).await.unwrap();
    node.publish("feed", b"p3".to_vec()).await.unwrap();

    let mut results = Vec::new();
    for _ in 0..2 {
        let mut s = Session::open(&node, Encoding::Json).await;
        s.connect().await;
        s.send(CommandPayload::Subscribe(SubscribeRequest {
            channel: "feed".into(),
            recover: true,
            offset: 1,
            epoch: epoch.clone(),
        }))
        .await;
        match s.next_reply().await.result {
            Some(ReplyResult::Subscribe(result)) => {
                let offsets: Vec<u64> =
                    result.publications.iter().map(|p| p.offset).collect();
                results.push((result.recovered, offsets));
            }
            other => panic!("expected subscribe result, got {:?}", other),
        }
        s.client.close(Disconnect::normal()).await;
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], (true, vec![2, 3]));
    node.shutdown().await;
}

#[tokio::test]
async fn test_slow_consumer_disconnected() {
    let mut config = Config::default();
    config.client_queue_max_size = 1024;
    let node = test_node(config).await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("firehose").await;

    node.publish("firehose", vec![0u8; 10 * 1024]).await.unwrap();
    let disconnect = s.transport.wait_closed().await;
    assert_eq!(disconnect, Disconnect::slow());
    assert!(disconnect.reconnect);
    node.shutdown().await;
}

#[tokio::test]
async fn test_history_command() {
    let mut config = Config::default();
    config.get_channel_options = Arc::new(|_| recoverable_options());
    let node = test_node(config).await;

    for i in 0..3u8 {
        node.publish("log", vec![i]).await.unwrap();
    }

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.send(CommandPayload::History(HistoryRequest {
        channel: "log".into(),
        limit: 10,
        since: None,
        reverse: false,
    }))
    .await;
    match s.next_reply().await.result {
        Some(ReplyResult::History(result)) => {
            assert_eq!(result.offset, 3);
            assert_eq!(result.publications.len(), 3);
        }
        other => panic!("expected history result, got {:?}", other),
    }
    node.shutdown().await;
}

#[tokio::test]
async fn test_connect_time_subscriptions() {
    let node = default_test_node().await;
    let mut s = Session::open(&node, Encoding::Json).await;
    let mut subs = HashMap::new();
    subs.insert("inbox".to_string(), ConnectSubRequest::default());
    s.send(CommandPayload::Connect(ConnectRequest {
        subs,
        ..Default::default()
    }))
    .await;
    match s.next_reply().await.result {
        Some(ReplyResult::Connect(result)) => {
            assert!(result.subs.contains_key("inbox"));
        }
        other => panic!("expected connect result, got {:?}", other),
    }

    node.publish("inbox", b"mail".to_vec()).await.unwrap();
    let (channel, data) = s.next_publication().await;
    assert_eq!(channel, "inbox");
    assert_eq!(data, b"mail");
    node.shutdown().await;
}

#[tokio::test]
async fn test_double_subscribe_rejected() {
    let node = default_test_node().await;
    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("dup").await;
    s.send(CommandPayload::Subscribe(SubscribeRequest {
        channel: "dup".into(),
        ..Default::default()
    }))
    .await;
    assert_eq!(s.next_reply().await.error.unwrap().code, 105);
    node.shutdown().await;
}

struct EchoRpc;

#[async_trait]
impl RpcHandler for EchoRpc {
    async fn handle(&self, _user: &str, method: &str, data: &[u8]) -> Result<Vec<u8>, ClientError> {
        if method == "echo" {
            Ok(data.to_vec())
        } else {
            Err(ClientError::method_not_found())
        }
    }
}

#[tokio::test]
async fn test_rpc_dispatch() {
    let mut config = Config::default();
    config.rpc_handler = Some(Arc::new(EchoRpc));
    let node = test_node(config).await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.send(CommandPayload::Rpc(relay_protocol::RpcRequest {
        method: "echo".into(),
        data: b"ping".to_vec(),
    }))
    .await;
    match s.next_reply().await.result {
        Some(ReplyResult::Rpc(result)) => assert_eq!(result.data, b"ping"),
        other => panic!("expected rpc result, got {:?}", other),
    }

    s.send(CommandPayload::Rpc(relay_protocol::RpcRequest {
        method: "missing".into(),
        data: Vec::new(),
    }))
    .await;
    assert_eq!(s.next_reply().await.error.unwrap().code, 104);
    node.shutdown().await;
}

struct ShortLivedToken;

impl TokenVerifier for ShortLivedToken {
    fn verify(&self, _token: &str) -> Result<Credentials, ClientError> {
        Ok(Credentials {
            user_id: "42".into(),
            expire_at: Some(relay_core::types::unix_seconds() + 1),
            info: None,
        })
    }
}

#[tokio::test]
async fn test_token_expiration_disconnects() {
    let mut config = Config::default();
    config.token_verifier = Some(Arc::new(ShortLivedToken));
    config.client_expired_close_delay = Duration::from_millis(100);
    let node = test_node(config).await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;

    // The expiration notice arrives, then the disconnect after grace.
    let notified = loop {
        let reply = s.next_reply_timeout(Duration::from_secs(3)).await;
        if let Some(ReplyResult::Push(Push {
            kind: PushKind::TokenExpired(_),
            ..
        })) = reply.result
        {
            break true;
        }
    };
    assert!(notified);
    let disconnect = s.transport.wait_closed().await;
    assert_eq!(disconnect, Disconnect::expired());
    node.shutdown().await;
}

#[tokio::test]
async fn test_cluster_disconnect_user() {
    let node = test_node({
        let mut config = Config::default();
        config.token_verifier = Some(Arc::new(UserFromToken));
        config
    })
    .await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect_with(ConnectRequest {
        token: "42".into(),
        ..Default::default()
    })
    .await;

    node.disconnect_user("42", Disconnect::normal()).await.unwrap();
    let disconnect = s.transport.wait_closed().await;
    assert_eq!(disconnect, Disconnect::normal());
    assert_eq!(node.hub().num_clients(), 0);
    node.shutdown().await;
}

#[tokio::test]
async fn test_cluster_unsubscribe_user_sends_push() {
    let node = test_node({
        let mut config = Config::default();
        config.token_verifier = Some(Arc::new(UserFromToken));
        config
    })
    .await;

    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect_with(ConnectRequest {
        token: "42".into(),
        ..Default::default()
    })
    .await;
    s.subscribe("news").await;

    node.unsubscribe_user("42", "news").await.unwrap();
    let reply = s.next_reply().await;
    match reply.result {
        Some(ReplyResult::Push(Push { channel, kind })) => {
            assert_eq!(channel, "news");
            assert!(matches!(kind, PushKind::Unsubscribe(_)));
        }
        other => panic!("expected unsubscribe push, got {:?}", other),
    }
    assert_eq!(node.hub().num_subscribers("news"), 0);
    node.shutdown().await;
}

#[tokio::test]
async fn test_join_leave_pushes() {
    let mut config = Config::default();
    config.token_verifier = Some(Arc::new(UserFromToken));
    config.get_channel_options = Arc::new(|_| ChannelOptions {
        presence: false,
        join_leave: true,
        history_size: 0,
        history_ttl: Duration::ZERO,
        recover: false,
    });
    let node = test_node(config).await;

    let mut watcher = Session::open(&node, Encoding::Json).await;
    watcher
        .connect_with(ConnectRequest {
            token: "w".into(),
            ..Default::default()
        })
        .await;
    watcher.subscribe("lobby").await;

    let mut guest = Session::open(&node, Encoding::Json).await;
    guest
        .connect_with(ConnectRequest {
            token: "g".into(),
            ..Default::default()
        })
        .await;
    guest.subscribe("lobby").await;

    let join = loop {
        let reply = watcher.next_reply().await;
        if let Some(ReplyResult::Push(Push {
            kind: PushKind::Join(info),
            ..
        })) = reply.result
        {
            break info;
        }
    };
    assert_eq!(join.user, "g");

    guest.client.close(Disconnect::normal()).await;
    let leave = loop {
        let reply = watcher.next_reply().await;
        if let Some(ReplyResult::Push(Push {
            kind: PushKind::Leave(info),
            ..
        })) = reply.result
        {
            break info;
        }
    };
    assert_eq!(leave.user, "g");
    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_node() {
    let node = default_test_node().await;
    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("room").await;

    node.shutdown().await;
    let disconnect = s.transport.wait_closed().await;
    assert_eq!(disconnect, Disconnect::shutdown());

    let err = node.publish("room", b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, relay_core::Error::NodeClosed));
}

#[tokio::test]
async fn test_node_info_counters() {
    let node = default_test_node().await;
    let mut s = Session::open(&node, Encoding::Json).await;
    s.connect().await;
    s.subscribe("a").await;

    // The heartbeat loops back through the control plane and lands in
    // the registry.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let info = node.info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].num_clients, 1);
    assert_eq!(info[0].num_channels, 1);
    node.shutdown().await;
}
