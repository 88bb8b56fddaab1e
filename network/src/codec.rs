//! Netstring framing and the message envelope.
//!
//! Frames are netstrings: `<length>:<payload>,` with an ASCII decimal
//! length. Each payload is a JSON envelope
//! `{"head":{"magic":..,"command":..,"size":..,"id":..},"body":..}` where
//! `size` is the byte length of the canonical body encoding and `id` is
//! the sender's node id.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;

/// Upper bound on a single frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Errors produced while framing or parsing messages.
///
/// Any of these closes the offending peer connection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed netstring frame")]
    BadFrame,

    #[error("frame too large")]
    FrameTooLarge,

    #[error("bad magic")]
    BadMagic,

    #[error("bad message size")]
    BadSize,

    #[error("unknown message {0:?}")]
    UnknownCommand(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("bad number of peers")]
    BadPeerCount,

    #[error("bad number of objects")]
    BadObjectCount,
}

/// Netstring framing: `<len>:<payload>,`.
#[derive(Debug, Default)]
pub struct NetstringCodec;

impl Decoder for NetstringCodec {
    type Item = Vec<u8>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(colon) = src.iter().position(|&b| b == b':') else {
            // a length longer than the maximum frame's digits is garbage
            if src.len() > 20 {
                return Err(CodecError::BadFrame);
            }
            return Ok(None);
        };
        let digits = &src[..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(CodecError::BadFrame);
        }
        let len: usize = std::str::from_utf8(digits)
            .map_err(|_| CodecError::BadFrame)?
            .parse()
            .map_err(|_| CodecError::BadFrame)?;
        if len > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge);
        }

        let frame_end = colon + 1 + len + 1;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }
        if src[frame_end - 1] != b',' {
            return Err(CodecError::BadFrame);
        }

        let payload = src[colon + 1..frame_end - 1].to_vec();
        src.advance(frame_end);
        Ok(Some(payload))
    }
}

impl Encoder<Vec<u8>> for NetstringCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge);
        }
        let prefix = item.len().to_string();
        dst.reserve(prefix.len() + 1 + item.len() + 1);
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(&item);
        dst.put_u8(b',');
        Ok(())
    }
}

#[derive(Serialize)]
struct HeadOut<'a> {
    magic: u32,
    command: &'a str,
    size: usize,
    id: &'a str,
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    head: HeadOut<'a>,
    body: &'a RawValue,
}

#[derive(Deserialize)]
struct HeadIn {
    magic: u32,
    command: String,
    size: usize,
    id: String,
}

#[derive(Deserialize)]
struct EnvelopeIn<'a> {
    head: HeadIn,
    #[serde(borrow)]
    body: &'a RawValue,
}

/// Frames [`Message`]s for one network, stamping outgoing envelopes with
/// this node's id and rejecting foreign or inconsistent incoming ones.
#[derive(Debug)]
pub struct MessageCodec {
    magic: u32,
    node_id: String,
    inner: NetstringCodec,
}

impl MessageCodec {
    pub fn new(magic: u32, node_id: String) -> Self {
        Self {
            magic,
            node_id,
            inner: NetstringCodec,
        }
    }
}

impl Decoder for MessageCodec {
    /// A message plus the sender's node id.
    type Item = (Message, String);
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let envelope: EnvelopeIn<'_> = serde_json::from_slice(&frame)?;
        if envelope.head.magic != self.magic {
            return Err(CodecError::BadMagic);
        }
        let message = Message::from_command_body(&envelope.head.command, envelope.body)?;
        // the advertised size must match the canonical body encoding
        if message.body_json()?.len() != envelope.head.size {
            return Err(CodecError::BadSize);
        }
        Ok(Some((message, envelope.head.id)))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.body_json()?;
        let head = HeadOut {
            magic: self.magic,
            command: item.command(),
            size: body.len(),
            id: &self.node_id,
        };
        let body = RawValue::from_string(body)?;
        let envelope = EnvelopeOut { head, body: &body };
        let payload = serde_json::to_vec(&envelope)?;
        self.inner.encode(payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut MessageCodec, bytes: &[u8]) -> Vec<(Message, String)> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).expect("decode") {
            out.push(item);
        }
        out
    }

    #[test]
    fn netstrings_frame_and_unframe() {
        let mut codec = NetstringCodec;
        let mut buf = BytesMut::new();
        codec.encode(b"hello".to_vec(), &mut buf).expect("encode");
        assert_eq!(&buf[..], b"5:hello,");

        let decoded = codec.decode(&mut buf).expect("decode").expect("one frame");
        assert_eq!(decoded, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = NetstringCodec;
        let mut buf = BytesMut::from(&b"11:hello"[..]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        buf.extend_from_slice(b" world,");
        assert_eq!(
            codec.decode(&mut buf).expect("decode").expect("frame"),
            b"hello world"
        );
    }

    #[test]
    fn missing_trailer_is_an_error() {
        let mut codec = NetstringCodec;
        let mut buf = BytesMut::from(&b"5:helloX"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::BadFrame)));
    }

    #[test]
    fn non_numeric_length_is_an_error() {
        let mut codec = NetstringCodec;
        let mut buf = BytesMut::from(&b"5a:hello,"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::BadFrame)));
    }

    #[test]
    fn messages_roundtrip_through_the_codec() {
        let mut alice = MessageCodec::new(0xdeadbeef, "alice".into());
        let mut bob = MessageCodec::new(0xdeadbeef, "bob".into());

        let mut buf = BytesMut::new();
        alice
            .encode(Message::Version { port: 2222 }, &mut buf)
            .expect("encode");
        alice.encode(Message::Ping, &mut buf).expect("encode");

        let items = decode_all(&mut bob, &buf);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0].0, Message::Version { port: 2222 }));
        assert_eq!(items[0].1, "alice");
        assert!(matches!(items[1].0, Message::Ping));
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let mut sender = MessageCodec::new(1, "a".into());
        let mut receiver = MessageCodec::new(2, "b".into());

        let mut buf = BytesMut::new();
        sender.encode(Message::Ping, &mut buf).expect("encode");
        assert!(matches!(
            receiver.decode(&mut buf),
            Err(CodecError::BadMagic)
        ));
    }

    #[test]
    fn advertised_size_must_match_the_body() {
        let mut receiver = MessageCodec::new(1, "b".into());
        let payload = r#"{"head":{"magic":1,"command":"ping","size":99,"id":"a"},"body":"ping"}"#;
        let mut framed = BytesMut::new();
        NetstringCodec
            .encode(payload.as_bytes().to_vec(), &mut framed)
            .expect("frame");
        assert!(matches!(
            receiver.decode(&mut framed),
            Err(CodecError::BadSize)
        ));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let mut receiver = MessageCodec::new(1, "b".into());
        let payload = r#"{"head":{"magic":1,"command":"gossip","size":2,"id":"a"},"body":{}}"#;
        let mut framed = BytesMut::new();
        NetstringCodec
            .encode(payload.as_bytes().to_vec(), &mut framed)
            .expect("frame");
        assert!(matches!(
            receiver.decode(&mut framed),
            Err(CodecError::UnknownCommand(_))
        ));
    }

    #[test]
    fn blocks_with_large_hashes_survive_the_wire() {
        use fumblechain_core::Block;

        let mut block = Block::new(7, u128::MAX - 5);
        block.proof = "123".into();
        let mut alice = MessageCodec::new(3, "alice".into());
        let mut bob = MessageCodec::new(3, "bob".into());

        let mut buf = BytesMut::new();
        alice
            .encode(Message::Block(Box::new(block.clone())), &mut buf)
            .expect("encode");
        let (msg, _) = bob.decode(&mut buf).expect("decode").expect("frame");
        match msg {
            Message::Block(b) => {
                assert_eq!(b.prevhash, u128::MAX - 5);
                assert_eq!(b.hash(), block.hash());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
