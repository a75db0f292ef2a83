//! # relay-protocol
//!
//! Wire protocol definitions for the Relay realtime messaging engine.
//!
//! The protocol is a command/reply stream with server pushes:
//!
//! - `Command` — client request `{id, method, params}`; ids increase
//!   monotonically per connection and several commands may be pipelined
//!   into a single transport frame.
//! - `Reply` — server answer `{id, error?, result?}`; replies are written
//!   in command-id order.
//! - `Push` — server-initiated event (publication, join/leave, server
//!   unsubscribe, one-way message), carried in a reply with `id = 0`.
//!
//! Two interchangeable encodings are supported per connection: newline
//! delimited JSON and length-prefixed MessagePack. See [`codec`].
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Command, CommandPayload, Encoding};
//!
//! let cmd = Command::new(1, CommandPayload::Ping);
//! let encoded = codec::encode_command(&cmd, Encoding::Json).unwrap();
//! let decoded = codec::decode_commands(&encoded, Encoding::Json).unwrap();
//! assert_eq!(decoded[0], cmd);
//! ```

pub mod codec;
pub mod command;
pub mod reply;
pub mod types;

pub use codec::{Encoding, ProtocolError, MAX_FRAME_SIZE};
pub use command::{
    Command, CommandPayload, ConnectRequest, ConnectSubRequest, HistoryRequest, PresenceRequest,
    PresenceStatsRequest, PublishRequest, RefreshRequest, RpcRequest, SendRequest,
    SubscribeRequest, UnsubscribeRequest,
};
pub use reply::{
    ConnectResult, ErrorReply, HistoryResult, MessagePush, PingResult, PresenceResult,
    PresenceStatsResult, PublishResult, Push, PushKind, RefreshResult, Reply, ReplyResult,
    RpcResult, SubscribeResult, TokenExpiredPush, UnsubscribePush, UnsubscribeResult,
};
pub use types::{ClientInfo, Publication, StreamPosition};
