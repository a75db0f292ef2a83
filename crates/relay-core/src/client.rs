//! Per-connection session state machine.
//!
//! One `Client` drives one transport connection: it decodes pipelined
//! commands, dispatches them against the node, and writes replies and
//! pushes through the connection's bounded writer. Replies always appear
//! on the wire in command order; pushes for one channel never reorder.

use crate::batch::{ChannelBatchConfig, PerChannelWriter};
use crate::errors::{ClientError, Disconnect};
use crate::history::HistoryFilter;
use crate::node::Node;
use crate::queue::Item;
use crate::recovery::{is_recovered, merge_recovered};
use crate::transport::Transport;
use crate::types::{generate_client_id, unix_seconds, validate_channel, ChannelId};
use crate::writer::Writer;
use bytes::Bytes;
use relay_protocol::{
    codec, ClientInfo, Command, CommandPayload, ConnectRequest, ConnectResult, Encoding,
    HistoryRequest, HistoryResult, PingResult, PresenceResult, PresenceStatsResult, Publication,
    PublishResult, Push, RefreshResult, Reply, ReplyResult, RpcResult, StreamPosition,
    SubscribeResult, UnsubscribeResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connecting,
    Connected,
    Closed,
}

/// Subscription lifecycle within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionState {
    /// Broker subscribe / history catch-up still running; live
    /// publications are buffered.
    Subscribing,
    /// Fully established; publications flow directly.
    Subscribed,
}

/// Per-(client, channel) state. Owned exclusively by the session.
pub(crate) struct ChannelContext {
    pub state: SubscriptionState,
    pub recoverable: bool,
    pub presence: bool,
    pub join_leave: bool,
    /// Last stream position delivered to this client.
    pub position: StreamPosition,
    /// Publications buffered while catch-up runs.
    pub pending: Vec<Publication>,
}

struct State {
    status: Status,
    user: String,
    conn_info: Option<Vec<u8>>,
    expire_at: Option<u64>,
    expire_task: bool,
    channels: HashMap<ChannelId, ChannelContext>,
    batch: Option<Arc<PerChannelWriter>>,
}

/// One client session.
pub struct Client {
    id: String,
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    writer: Arc<Writer>,
    state: Mutex<State>,
}

impl Client {
    /// Create a session for an accepted transport connection and start
    /// its writer loop and stale-connection timer.
    pub fn new(node: Arc<Node>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let config = node.config();
        let writer = Arc::new(Writer::new(
            config.client_queue_max_size,
            config.client_max_messages_in_frame,
            config.client_message_write_timeout,
        ));
        let client = Arc::new(Self {
            id: generate_client_id(),
            node,
            transport,
            writer,
            state: Mutex::new(State {
                status: Status::Connecting,
                user: String::new(),
                conn_info: None,
                expire_at: None,
                expire_task: false,
                channels: HashMap::new(),
                batch: None,
            }),
        });

        // Writer loop: exits when the queue closes or a write fails.
        {
            let client = client.clone();
            let transport = client.transport.clone();
            let writer = client.writer.clone();
            tokio::spawn(async move {
                if let Err(e) = writer.run(transport).await {
                    debug!(client = %client.id, error = %e, "writer loop ended");
                    client.close(Disconnect::write_error()).await;
                }
            });
        }

        // Stale timer: a connection must authenticate in time.
        {
            let stale_delay = client.node.config().client_stale_close_delay;
            let weak = Arc::downgrade(&client);
            tokio::spawn(async move {
                tokio::time::sleep(stale_delay).await;
                if let Some(client) = weak.upgrade() {
                    let stale =
                        client.state.lock().unwrap().status == Status::Connecting;
                    if stale {
                        debug!(client = %client.id, "closing stale connection");
                        client.close(Disconnect::stale()).await;
                    }
                }
            });
        }

        client
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// User id of the session; empty while connecting or for anonymous
    /// connections.
    #[must_use]
    pub fn user(&self) -> String {
        self.state.lock().unwrap().user.clone()
    }

    pub(crate) fn encoding(&self) -> Encoding {
        self.transport.encoding()
    }

    pub(crate) fn client_info(&self) -> ClientInfo {
        let state = self.state.lock().unwrap();
        ClientInfo {
            client: self.id.clone(),
            user: state.user.clone(),
            conn_info: state.conn_info.clone(),
            chan_info: None,
        }
    }

    /// Channels with presence tracking, for the node's refresh loop.
    pub(crate) fn presence_channels(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .channels
            .iter()
            .filter(|(_, ctx)| ctx.presence && ctx.state == SubscriptionState::Subscribed)
            .map(|(ch, _)| ch.clone())
            .collect()
    }

    /// Handle one inbound transport frame carrying pipelined commands.
    ///
    /// # Errors
    ///
    /// Returns a disconnect on fatal conditions; the caller must close
    /// the connection with it.
    pub async fn handle(self: &Arc<Self>, data: &[u8]) -> Result<(), Disconnect> {
        let max_size = self.node.config().client_request_max_size;
        if max_size > 0 && data.len() > max_size {
            debug!(client = %self.id, size = data.len(), "request too large");
            return Err(Disconnect::bad_request());
        }
        let commands = codec::decode_commands(data, self.transport.encoding()).map_err(|e| {
            debug!(client = %self.id, error = %e, "malformed frame");
            Disconnect::bad_request()
        })?;
        if commands.is_empty() {
            return Err(Disconnect::bad_request());
        }
        for command in commands {
            self.dispatch(command).await?;
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, command: Command) -> Result<(), Disconnect> {
        let status = self.state.lock().unwrap().status;
        if status == Status::Closed {
            return Ok(());
        }
        trace!(client = %self.id, id = command.id, method = command.method(), "dispatch");

        // One-way messages carry no id and produce no reply.
        if let CommandPayload::Send(req) = &command.payload {
            if let Some(handler) = self.node.config().message_handler.clone() {
                handler.handle(&self.user(), &req.data).await;
            }
            return Ok(());
        }

        if command.id == 0 {
            return Err(Disconnect::bad_request());
        }

        match (&command.payload, status) {
            (CommandPayload::Connect(_), Status::Connecting) => {}
            (CommandPayload::Connect(_), _) => return Err(Disconnect::bad_request()),
            (_, Status::Connecting) => {
                // Only connect may arrive on an unauthenticated
                // connection.
                return Err(Disconnect::bad_request());
            }
            _ => {}
        }

        let id = command.id;
        match command.payload {
            CommandPayload::Connect(req) => self.connect_cmd(id, req).await,
            CommandPayload::Subscribe(req) => {
                let since = req
                    .recover
                    .then(|| StreamPosition::new(req.offset, req.epoch.clone()));
                match self
                    .prepare_subscription(&req.channel, req.recover, since)
                    .await
                {
                    Ok(result) => {
                        self.write_reply(&Reply::ok(id, ReplyResult::Subscribe(result)))?;
                        self.finalize_subscription(&req.channel)
                    }
                    Err(e) => self.write_error(id, e),
                }
            }
            CommandPayload::Unsubscribe(req) => {
                self.unsubscribe_channel(&req.channel, false).await?;
                self.write_reply(&Reply::ok(
                    id,
                    ReplyResult::Unsubscribe(UnsubscribeResult {}),
                ))
            }
            CommandPayload::Publish(req) => {
                let result = self.publish_cmd(&req.channel, req.data).await;
                self.reply_result(id, result.map(ReplyResult::Publish))
            }
            CommandPayload::Presence(req) => {
                let result = self.presence_cmd(&req.channel).await;
                self.reply_result(id, result.map(ReplyResult::Presence))
            }
            CommandPayload::PresenceStats(req) => {
                let result = self.presence_stats_cmd(&req.channel).await;
                self.reply_result(id, result.map(ReplyResult::PresenceStats))
            }
            CommandPayload::History(req) => {
                let result = self.history_cmd(&req).await;
                self.reply_result(id, result.map(ReplyResult::History))
            }
            CommandPayload::Rpc(req) => {
                let result = match self.node.config().rpc_handler.clone() {
                    Some(handler) => handler
                        .handle(&self.user(), &req.method, &req.data)
                        .await
                        .map(|data| RpcResult { data }),
                    None => Err(ClientError::method_not_found()),
                };
                self.reply_result(id, result.map(ReplyResult::Rpc))
            }
            CommandPayload::Refresh(req) => {
                let result = self.refresh_cmd(&req.token);
                self.reply_result(id, result.map(ReplyResult::Refresh))
            }
            CommandPayload::Ping => {
                self.write_reply(&Reply::ok(id, ReplyResult::Ping(PingResult {})))
            }
            CommandPayload::Send(_) => Ok(()),
        }
    }

    async fn connect_cmd(
        self: &Arc<Self>,
        id: u32,
        req: ConnectRequest,
    ) -> Result<(), Disconnect> {
        let config = self.node.config();
        let credentials = match &config.token_verifier {
            Some(verifier) => match verifier.verify(&req.token) {
                Ok(credentials) => credentials,
                Err(e) => {
                    debug!(client = %self.id, error = %e, "connect token rejected");
                    return self.write_error(id, e);
                }
            },
            None => Default::default(),
        };
        if let Some(at) = credentials.expire_at {
            if at <= unix_seconds() {
                return self.write_error(id, ClientError::expired());
            }
        }

        let expire_at = credentials.expire_at;
        {
            let mut state = self.state.lock().unwrap();
            if state.status != Status::Connecting {
                return Err(Disconnect::bad_request());
            }
            state.status = Status::Connected;
            state.user = credentials.user_id;
            state.conn_info = credentials.info;
            state.expire_at = expire_at;
        }
        self.node.hub().add_client(self);
        debug!(client = %self.id, user = %self.user(), name = %req.name, "client connected");

        // Channels requested in the connect command subscribe before the
        // reply so their initial data rides in the connect result.
        let mut subs = HashMap::new();
        for (channel, sub) in req.subs {
            let since = sub
                .recover
                .then(|| StreamPosition::new(sub.offset, sub.epoch.clone()));
            match self
                .prepare_subscription(&channel, sub.recover, since)
                .await
            {
                Ok(result) => {
                    subs.insert(channel, result);
                }
                Err(e) => {
                    debug!(client = %self.id, channel = %channel, error = %e, "connect-time subscribe failed");
                }
            }
        }

        let ttl = expire_at.map(|at| at.saturating_sub(unix_seconds()));
        let result = ConnectResult {
            client: self.id.clone(),
            version: config.version.clone(),
            expires: ttl.is_some(),
            ttl: ttl.unwrap_or(0) as u32,
            subs: subs.clone(),
        };
        self.write_reply(&Reply::ok(id, ReplyResult::Connect(result)))?;

        for channel in subs.keys() {
            self.finalize_subscription(channel)?;
        }

        if expire_at.is_some() {
            self.spawn_expiration();
        }
        Ok(())
    }

    /// Register the subscription, open broker interest, and run history
    /// catch-up. Live publications buffer in the channel context until
    /// [`Client::finalize_subscription`].
    async fn prepare_subscription(
        self: &Arc<Self>,
        channel: &str,
        recover: bool,
        since: Option<StreamPosition>,
    ) -> Result<SubscribeResult, ClientError> {
        let config = self.node.config();
        validate_channel(channel, config.channel_max_length)
            .map_err(|_| ClientError::bad_request())?;
        let opts = (config.get_channel_options)(channel);
        let recoverable = opts.recover && opts.history_size > 0;

        {
            let mut state = self.state.lock().unwrap();
            if state.channels.len() >= config.client_channel_limit {
                return Err(ClientError::limit_exceeded());
            }
            if state.channels.contains_key(channel) {
                return Err(ClientError::already_subscribed());
            }
            state.channels.insert(
                channel.to_string(),
                ChannelContext {
                    state: SubscriptionState::Subscribing,
                    recoverable,
                    presence: opts.presence,
                    join_leave: opts.join_leave,
                    position: StreamPosition::default(),
                    pending: Vec::new(),
                },
            );
        }

        let first = self.node.hub().add_sub(channel, self.clone());
        if first {
            if let Err(e) = self.node.broker_subscribe(channel).await {
                warn!(client = %self.id, channel = %channel, error = %e, "broker subscribe failed");
                self.rollback_subscription(channel).await;
                return Err(ClientError::unavailable());
            }
        }

        if opts.presence {
            if let Err(e) = self
                .node
                .add_presence(channel, &self.id, self.client_info())
                .await
            {
                warn!(client = %self.id, channel = %channel, error = %e, "presence add failed");
                self.rollback_subscription(channel).await;
                return Err(ClientError::unavailable());
            }
        }

        let mut result = SubscribeResult::default();
        if recoverable {
            result.recoverable = true;
            let filter = HistoryFilter {
                limit: if recover { None } else { Some(0) },
                since: if recover { since.clone() } else { None },
                reverse: false,
            };
            match self.node.history(channel, &filter).await {
                Ok((publications, sp)) => {
                    if recover {
                        result.recovered = since
                            .as_ref()
                            .is_some_and(|s| is_recovered(s, &sp, &publications));
                        result.publications = publications;
                    }
                    result.offset = sp.offset;
                    result.epoch = sp.epoch.clone();
                    let mut state = self.state.lock().unwrap();
                    if let Some(ctx) = state.channels.get_mut(channel) {
                        ctx.position = sp;
                    }
                }
                Err(e) => {
                    warn!(client = %self.id, channel = %channel, error = %e, "history catch-up failed");
                    self.rollback_subscription(channel).await;
                    return Err(ClientError::unavailable());
                }
            }
        }
        Ok(result)
    }

    async fn rollback_subscription(self: &Arc<Self>, channel: &str) {
        self.state.lock().unwrap().channels.remove(channel);
        let last = self.node.hub().remove_sub(channel, &self.id);
        if last {
            if let Err(e) = self.node.broker_unsubscribe(channel).await {
                warn!(channel = %channel, error = %e, "broker unsubscribe failed");
            }
        }
    }

    /// Transition the subscription to `Subscribed`, flushing buffered
    /// publications as ordinary pushes, then announce the join.
    fn finalize_subscription(self: &Arc<Self>, channel: &str) -> Result<(), Disconnect> {
        let join = {
            let mut state = self.state.lock().unwrap();
            let Some(ctx) = state.channels.get_mut(channel) else {
                return Ok(());
            };
            ctx.state = SubscriptionState::Subscribed;
            let mut pending = std::mem::take(&mut ctx.pending);
            let position = ctx.position.clone();
            let join = ctx.join_leave;

            if ctx.recoverable {
                // Catch-up already delivered everything at or below the
                // reply position; drop duplicates and order the rest.
                pending = merge_recovered(Vec::new(), pending);
                pending.retain(|p| p.offset > position.offset);
            }
            let mut last_offset = position.offset;
            for publication in pending {
                if publication.offset > 0 {
                    last_offset = publication.offset;
                }
                let reply = Reply::push(Push::publication(channel, publication));
                let frame = match codec::encode_reply(&reply, self.transport.encoding()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(client = %self.id, error = %e, "failed to encode buffered push");
                        continue;
                    }
                };
                self.writer
                    .enqueue(Item::new(frame, channel.to_string()))
                    .map_err(|d| {
                        self.spawn_close(d.clone());
                        d
                    })?;
            }
            if let Some(ctx) = state.channels.get_mut(channel) {
                ctx.position.offset = last_offset;
            }
            join
        };
        if join {
            self.node.announce_join(channel, self.client_info());
        }
        Ok(())
    }

    async fn unsubscribe_channel(
        self: &Arc<Self>,
        channel: &str,
        server_initiated: bool,
    ) -> Result<(), Disconnect> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let ctx = state.channels.remove(channel);
            if ctx.is_some() {
                if let Some(batch) = state.batch.clone() {
                    // Flush buffered frames while still subscribed so no
                    // publication arrives after the unsubscribe.
                    drop(state);
                    batch.flush_channel(channel).map_err(|d| {
                        self.spawn_close(d.clone());
                        d
                    })?;
                }
            }
            ctx
        };
        let Some(ctx) = removed else {
            return Ok(());
        };

        let last = self.node.hub().remove_sub(channel, &self.id);
        if last {
            if let Err(e) = self.node.broker_unsubscribe(channel).await {
                warn!(channel = %channel, error = %e, "broker unsubscribe failed");
            }
        }
        if ctx.presence {
            if let Err(e) = self
                .node
                .remove_presence(channel, &self.id, &self.user())
                .await
            {
                warn!(channel = %channel, error = %e, "presence remove failed");
            }
        }
        if ctx.join_leave && ctx.state == SubscriptionState::Subscribed {
            self.node.announce_leave(channel, self.client_info());
        }
        if server_initiated {
            let reply = Reply::push(Push::unsubscribe(channel));
            self.write_reply(&reply)?;
        }
        debug!(client = %self.id, channel = %channel, "unsubscribed");
        Ok(())
    }

    /// Server-side unsubscribe driven by a cluster control message.
    pub(crate) async fn server_unsubscribe(self: &Arc<Self>, channel: &str) {
        if let Err(d) = self.unsubscribe_channel(channel, true).await {
            self.close(d).await;
        }
    }

    async fn publish_cmd(
        self: &Arc<Self>,
        channel: &str,
        data: Vec<u8>,
    ) -> Result<PublishResult, ClientError> {
        let sp = self
            .node
            .publish_with_info(channel, data, Some(self.client_info()))
            .await?;
        Ok(PublishResult { offset: sp.offset })
    }

    async fn presence_cmd(&self, channel: &str) -> Result<PresenceResult, ClientError> {
        let opts = (self.node.config().get_channel_options)(channel);
        if !opts.presence {
            return Err(ClientError::not_available());
        }
        let presence = self.node.presence(channel).await?;
        Ok(PresenceResult { presence })
    }

    async fn presence_stats_cmd(
        &self,
        channel: &str,
    ) -> Result<PresenceStatsResult, ClientError> {
        let opts = (self.node.config().get_channel_options)(channel);
        if !opts.presence {
            return Err(ClientError::not_available());
        }
        let stats = self.node.presence_stats(channel).await?;
        Ok(PresenceStatsResult {
            num_clients: stats.num_clients as u32,
            num_users: stats.num_users as u32,
        })
    }

    async fn history_cmd(&self, req: &HistoryRequest) -> Result<HistoryResult, ClientError> {
        let opts = (self.node.config().get_channel_options)(req.channel.as_str());
        if opts.history_size == 0 {
            return Err(ClientError::not_available());
        }
        let filter = HistoryFilter {
            limit: Some(req.limit as usize),
            since: req.since.clone(),
            reverse: req.reverse,
        };
        let (publications, sp) = self
            .node
            .history(&req.channel, &filter)
            .await
            .map_err(ClientError::from)?;
        Ok(HistoryResult {
            publications,
            offset: sp.offset,
            epoch: sp.epoch,
        })
    }

    fn refresh_cmd(self: &Arc<Self>, token: &str) -> Result<RefreshResult, ClientError> {
        let config = self.node.config();
        let Some(verifier) = &config.token_verifier else {
            return Err(ClientError::not_available());
        };
        let credentials = verifier.verify(token)?;
        if let Some(at) = credentials.expire_at {
            if at <= unix_seconds() {
                return Err(ClientError::expired());
            }
        }
        let ttl = credentials
            .expire_at
            .map(|at| at.saturating_sub(unix_seconds()));
        {
            let mut state = self.state.lock().unwrap();
            state.expire_at = credentials.expire_at;
        }
        if credentials.expire_at.is_some() {
            self.spawn_expiration();
        }
        debug!(client = %self.id, "credentials refreshed");
        Ok(RefreshResult {
            expires: ttl.is_some(),
            ttl: ttl.unwrap_or(0) as u32,
        })
    }

    /// Token expiration watchdog. Sends the expiration notice, waits the
    /// grace window for a refresh, then disconnects.
    fn spawn_expiration(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.expire_task {
                return;
            }
            state.expire_task = true;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(client) = weak.upgrade() else { return };
                let (status, expire_at) = {
                    let state = client.state.lock().unwrap();
                    (state.status, state.expire_at)
                };
                if status == Status::Closed {
                    return;
                }
                let Some(at) = expire_at else {
                    client.state.lock().unwrap().expire_task = false;
                    return;
                };
                let now = unix_seconds();
                if at > now {
                    drop(client);
                    tokio::time::sleep(Duration::from_secs(at - now)).await;
                    continue;
                }

                let grace = client.node.config().client_expired_close_delay;
                let _ = client.write_reply(&Reply::push(Push::token_expired()));
                debug!(client = %client.id, "token expired, waiting for refresh");
                drop(client);
                tokio::time::sleep(grace).await;

                let Some(client) = weak.upgrade() else { return };
                let still_expired = {
                    let state = client.state.lock().unwrap();
                    state.status != Status::Closed
                        && state.expire_at.is_some_and(|at| at <= unix_seconds())
                };
                if still_expired {
                    client.close(Disconnect::expired()).await;
                    return;
                }
            }
        });
    }

    /// Deliver a publication from the hub fan-out.
    ///
    /// `frame` is the encoded push for this client's encoding; the raw
    /// publication travels along for recovery buffering and position
    /// tracking.
    pub(crate) fn transmit_publication(
        self: &Arc<Self>,
        channel: &str,
        publication: &Publication,
        sp: Option<&StreamPosition>,
        frame: Bytes,
        batch: Option<&ChannelBatchConfig>,
    ) {
        let mut gap = false;
        let mut batch_writer: Option<Arc<PerChannelWriter>> = None;
        {
            let mut state = self.state.lock().unwrap();
            if state.status != Status::Connected {
                return;
            }
            let Some(ctx) = state.channels.get_mut(channel) else {
                return;
            };
            if ctx.state == SubscriptionState::Subscribing {
                ctx.pending.push(publication.clone());
                return;
            }
            if ctx.recoverable {
                match sp {
                    Some(sp) if sp.offset == ctx.position.offset + 1 => {
                        ctx.position.offset = sp.offset;
                    }
                    Some(sp) => {
                        debug!(
                            client = %self.id,
                            channel = %channel,
                            expected = ctx.position.offset + 1,
                            got = sp.offset,
                            "stream position gap"
                        );
                        gap = true;
                    }
                    None => {}
                }
            }
            if !gap {
                if let Some(cfg) = batch {
                    if cfg.is_active() {
                        let writer = match &state.batch {
                            Some(writer) => writer.clone(),
                            None => {
                                let writer =
                                    Arc::new(PerChannelWriter::new(self.batch_flush_fn()));
                                state.batch = Some(writer.clone());
                                writer
                            }
                        };
                        batch_writer = Some(writer);
                    }
                }
            }
        }

        if gap {
            // The client can only resync by resubscribing with recovery.
            self.spawn_close(Disconnect::insufficient_state());
            return;
        }
        let item = Item::new(frame, channel.to_string());
        let result = match (batch_writer, batch) {
            (Some(writer), Some(cfg)) => writer.add(item, cfg),
            _ => self.writer.enqueue(item),
        };
        if let Err(d) = result {
            self.spawn_close(d);
        }
    }

    /// Deliver a join/leave push if this subscription asked for them.
    pub(crate) fn transmit_join_leave(self: &Arc<Self>, channel: &str, frame: Bytes) {
        {
            let state = self.state.lock().unwrap();
            if state.status != Status::Connected {
                return;
            }
            let Some(ctx) = state.channels.get(channel) else {
                return;
            };
            if !ctx.join_leave || ctx.state != SubscriptionState::Subscribed {
                return;
            }
        }
        if let Err(d) = self.writer.enqueue(Item::new(frame, channel.to_string())) {
            self.spawn_close(d);
        }
    }

    /// Sink of the per-channel batching writer: merge the batch into one
    /// transport frame and enqueue it.
    fn batch_flush_fn(self: &Arc<Self>) -> crate::batch::FlushFn {
        let weak = Arc::downgrade(self);
        Box::new(move |items| {
            let Some(client) = weak.upgrade() else {
                return Err(Disconnect::normal());
            };
            let channel = items
                .first()
                .map(|i| i.channel.clone())
                .unwrap_or_default();
            let frames: Vec<Bytes> = items.into_iter().map(|i| i.data).collect();
            let merged = codec::join_frames(&frames, client.transport.encoding());
            client.writer.enqueue(Item::new(merged, channel)).map_err(|d| {
                client.spawn_close(d.clone());
                d
            })
        })
    }

    fn write_reply(&self, reply: &Reply) -> Result<(), Disconnect> {
        let frame = codec::encode_reply(reply, self.transport.encoding()).map_err(|e| {
            warn!(client = %self.id, error = %e, "failed to encode reply");
            Disconnect::server_error()
        })?;
        self.writer.enqueue(Item::new(frame, String::new()))
    }

    fn write_error(&self, id: u32, error: ClientError) -> Result<(), Disconnect> {
        debug!(client = %self.id, id, code = error.code, message = %error.message, "command error");
        self.write_reply(&Reply::err(id, error.into()))
    }

    fn reply_result(
        &self,
        id: u32,
        result: Result<ReplyResult, ClientError>,
    ) -> Result<(), Disconnect> {
        match result {
            Ok(result) => self.write_reply(&Reply::ok(id, result)),
            Err(error) => self.write_error(id, error),
        }
    }

    fn spawn_close(self: &Arc<Self>, disconnect: Disconnect) {
        let client = self.clone();
        tokio::spawn(async move {
            client.close(disconnect).await;
        });
    }

    /// Terminate the session. Idempotent.
    ///
    /// Walks the channel set notifying hub/broker/presence, deregisters
    /// from the hub, closes the write queue (the writer loop drains and
    /// exits) and finally the transport.
    pub async fn close(self: &Arc<Self>, disconnect: Disconnect) {
        let (channels, batch, user) = {
            let mut state = self.state.lock().unwrap();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
            (
                std::mem::take(&mut state.channels),
                state.batch.take(),
                state.user.clone(),
            )
        };
        if let Some(batch) = batch {
            batch.close(false);
        }

        for (channel, ctx) in channels {
            let last = self.node.hub().remove_sub(&channel, &self.id);
            if last {
                if let Err(e) = self.node.broker_unsubscribe(&channel).await {
                    warn!(channel = %channel, error = %e, "broker unsubscribe failed");
                }
            }
            if ctx.presence {
                if let Err(e) = self.node.remove_presence(&channel, &self.id, &user).await {
                    warn!(channel = %channel, error = %e, "presence remove failed");
                }
            }
            if ctx.join_leave && ctx.state == SubscriptionState::Subscribed {
                self.node.announce_leave(
                    &channel,
                    ClientInfo {
                        client: self.id.clone(),
                        user: user.clone(),
                        conn_info: None,
                        chan_info: None,
                    },
                );
            }
        }

        self.node.hub().remove_client(self);
        self.writer.close();
        if let Err(e) = self.transport.close(&disconnect).await {
            trace!(client = %self.id, error = %e, "transport close");
        }
        debug!(client = %self.id, reason = %disconnect, "client closed");
    }
}
