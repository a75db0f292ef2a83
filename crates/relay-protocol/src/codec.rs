//! Codecs for Relay frames.
//!
//! Two encodings are supported, negotiated per connection:
//!
//! - **JSON** — one JSON document per frame; multiple frames in a single
//!   transport message are separated by `\n`.
//! - **Binary** — MessagePack with a 4-byte big-endian length prefix per
//!   frame; frames are concatenated back to back.
//!
//! Both directions use the same framing, so a transport message may carry
//! several pipelined commands or several coalesced replies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::command::Command;
use crate::reply::Reply;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes (binary encoding).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Per-connection protocol encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Newline-delimited JSON documents.
    #[default]
    Json,
    /// Length-prefixed MessagePack.
    Binary,
}

impl Encoding {
    /// Wire name, used in logs and the negotiation query parameter.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Binary => "binary",
        }
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a reply into a standalone frame.
///
/// # Errors
///
/// Returns an error if the reply is too large or serialization fails.
pub fn encode_reply(reply: &Reply, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let payload = serde_json::to_vec(reply)?;
            if payload.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            Ok(Bytes::from(payload))
        }
        Encoding::Binary => {
            let payload = rmp_serde::to_vec_named(reply)?;
            if payload.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
            buf.put_u32(payload.len() as u32);
            buf.extend_from_slice(&payload);
            Ok(buf.freeze())
        }
    }
}

/// Encode a command into a standalone frame. Primarily used by tests and
/// client-side tooling.
///
/// # Errors
///
/// Returns an error if the command is too large or serialization fails.
pub fn encode_command(command: &Command, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let payload = serde_json::to_vec(command)?;
            if payload.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            Ok(Bytes::from(payload))
        }
        Encoding::Binary => {
            let payload = rmp_serde::to_vec_named(command)?;
            if payload.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
            buf.put_u32(payload.len() as u32);
            buf.extend_from_slice(&payload);
            Ok(buf.freeze())
        }
    }
}

/// Decode all pipelined commands from one transport message.
///
/// # Errors
///
/// Returns an error on malformed framing or payloads; decoding is
/// all-or-nothing so a malformed pipeline never partially applies.
pub fn decode_commands(data: &[u8], encoding: Encoding) -> Result<Vec<Command>, ProtocolError> {
    match encoding {
        Encoding::Json => data
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| serde_json::from_slice(line).map_err(ProtocolError::from))
            .collect(),
        Encoding::Binary => {
            let mut commands = Vec::new();
            let mut buf = data;
            while !buf.is_empty() {
                if buf.len() < LENGTH_PREFIX_SIZE {
                    return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - buf.len()));
                }
                let length =
                    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if length > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge(length));
                }
                let total = LENGTH_PREFIX_SIZE + length;
                if buf.len() < total {
                    return Err(ProtocolError::Incomplete(total - buf.len()));
                }
                commands.push(rmp_serde::from_slice(&buf[LENGTH_PREFIX_SIZE..total])?);
                buf = &buf[total..];
            }
            Ok(commands)
        }
    }
}

/// Try to decode a single reply from a buffer, advancing it on success.
///
/// Used by client-side tooling and tests to consume coalesced frames.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_reply_from(
    buf: &mut BytesMut,
    encoding: Encoding,
) -> Result<Option<Reply>, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let end = match buf.iter().position(|b| *b == b'\n') {
                Some(pos) => pos,
                None if buf.is_empty() => return Ok(None),
                None => buf.len(),
            };
            let line = buf.split_to(end);
            if !buf.is_empty() {
                buf.advance(1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            Ok(Some(serde_json::from_slice(&line)?))
        }
        Encoding::Binary => {
            if buf.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }
            let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(length));
            }
            if buf.len() < LENGTH_PREFIX_SIZE + length {
                return Ok(None);
            }
            buf.advance(LENGTH_PREFIX_SIZE);
            let payload = buf.split_to(length);
            Ok(Some(rmp_serde::from_slice(&payload)?))
        }
    }
}

/// Merge several already-encoded frames into one transport message.
///
/// JSON frames are joined with `\n`; binary frames are already
/// length-prefixed and concatenate directly.
#[must_use]
pub fn join_frames(frames: &[Bytes], encoding: Encoding) -> Bytes {
    if frames.len() == 1 {
        return frames[0].clone();
    }
    let separator = matches!(encoding, Encoding::Json) as usize;
    let total: usize = frames.iter().map(|f| f.len() + separator).sum();
    let mut buf = BytesMut::with_capacity(total);
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 && encoding == Encoding::Json {
            buf.put_u8(b'\n');
        }
        buf.extend_from_slice(frame);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandPayload, PublishRequest, SubscribeRequest};
    use crate::reply::{PublishResult, Reply, ReplyResult};

    fn subscribe_cmd(id: u32, channel: &str) -> Command {
        Command::new(
            id,
            CommandPayload::Subscribe(SubscribeRequest {
                channel: channel.into(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_command_roundtrip_both_encodings() {
        let cmd = Command::new(
            5,
            CommandPayload::Publish(PublishRequest {
                channel: "chat:room".into(),
                data: br#"{"text":"hi"}"#.to_vec(),
            }),
        );
        for encoding in [Encoding::Json, Encoding::Binary] {
            let encoded = encode_command(&cmd, encoding).unwrap();
            let decoded = decode_commands(&encoded, encoding).unwrap();
            assert_eq!(decoded, vec![cmd.clone()], "encoding {:?}", encoding);
        }
    }

    #[test]
    fn test_pipelined_commands() {
        for encoding in [Encoding::Json, Encoding::Binary] {
            let frames = vec![
                encode_command(&subscribe_cmd(1, "a"), encoding).unwrap(),
                encode_command(&subscribe_cmd(2, "b"), encoding).unwrap(),
                encode_command(&Command::new(3, CommandPayload::Ping), encoding).unwrap(),
            ];
            let merged = join_frames(&frames, encoding);
            let decoded = decode_commands(&merged, encoding).unwrap();
            assert_eq!(decoded.len(), 3);
            assert_eq!(decoded[0].id, 1);
            assert_eq!(decoded[1].id, 2);
            assert_eq!(decoded[2].id, 3);
        }
    }

    #[test]
    fn test_reply_stream_decode() {
        for encoding in [Encoding::Json, Encoding::Binary] {
            let r1 = Reply::ok(1, ReplyResult::Publish(PublishResult { offset: 1 }));
            let r2 = Reply::ok(2, ReplyResult::Publish(PublishResult { offset: 2 }));
            let merged = join_frames(
                &[
                    encode_reply(&r1, encoding).unwrap(),
                    encode_reply(&r2, encoding).unwrap(),
                ],
                encoding,
            );
            let mut buf = BytesMut::from(&merged[..]);
            assert_eq!(decode_reply_from(&mut buf, encoding).unwrap(), Some(r1));
            assert_eq!(decode_reply_from(&mut buf, encoding).unwrap(), Some(r2));
            assert_eq!(decode_reply_from(&mut buf, encoding).unwrap(), None);
        }
    }

    #[test]
    fn test_binary_incomplete_frame() {
        let encoded = encode_command(&subscribe_cmd(1, "test"), Encoding::Binary).unwrap();
        match decode_commands(&encoded[..encoded.len() - 1], Encoding::Binary) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let cmd = Command::new(
            1,
            CommandPayload::Publish(PublishRequest {
                channel: "test".into(),
                data: vec![0u8; MAX_FRAME_SIZE + 1],
            }),
        );
        match encode_command(&cmd, Encoding::Binary) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_pipeline_rejected() {
        let data = b"{\"id\":1,\"method\":\"ping\"}\nnot json";
        assert!(decode_commands(data, Encoding::Json).is_err());
    }
}
