//! Wire messages.
//!
//! Every frame carries one message. The handshake and keepalive messages
//! (`version`, `verack`, `ping`, `pong`, `getaddr`) are modelled after the
//! Bitcoin protocol vocabulary; the chain transfer messages carry whole
//! blocks and transactions as JSON.
//!
//! `verack`, `ping`, `pong` and `getaddr` have no payload; their body is
//! the bare command string.

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

use fumblechain_core::{Block, Transaction};

use crate::codec::CodecError;

/// One advertised peer: host, listening port and node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress(pub String, pub u16, pub String);

/// An object carried by an `inv` message, tagged `block` or `tx` on the
/// wire.
#[derive(Debug, Clone)]
pub enum InvObject {
    Block(Block),
    Tx(Transaction),
}

impl InvObject {
    const TYPE_BLOCK: &'static str = "block";
    const TYPE_TX: &'static str = "tx";
}

impl Serialize for InvObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        match self {
            InvObject::Block(b) => {
                seq.serialize_element(Self::TYPE_BLOCK)?;
                seq.serialize_element(b)?;
            }
            InvObject::Tx(tx) => {
                seq.serialize_element(Self::TYPE_TX)?;
                seq.serialize_element(tx)?;
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for InvObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct InvVisitor;

        impl<'de> Visitor<'de> for InvVisitor {
            type Value = InvObject;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a [type, object] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                match tag.as_str() {
                    InvObject::TYPE_BLOCK => {
                        let block: Block = seq
                            .next_element()?
                            .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                        Ok(InvObject::Block(block))
                    }
                    InvObject::TYPE_TX => {
                        let tx: Transaction = seq
                            .next_element()?
                            .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                        Ok(InvObject::Tx(tx))
                    }
                    other => Err(serde::de::Error::unknown_variant(
                        other,
                        &[InvObject::TYPE_BLOCK, InvObject::TYPE_TX],
                    )),
                }
            }
        }

        deserializer.deserialize_seq(InvVisitor)
    }
}

/// A protocol message.
#[derive(Debug, Clone)]
pub enum Message {
    /// Handshake: announces the sender's listening port.
    Version { port: u16 },
    /// Handshake acknowledgement.
    Verack,
    /// Heartbeat request.
    Ping,
    /// Heartbeat response.
    Pong,
    /// Request for known peer addresses.
    Getaddr,
    /// Known peer addresses.
    Addr { addresses: Vec<PeerAddress> },
    /// Request for the blocks that follow the given block hash.
    Getblocks { topblockhash: u128 },
    /// Blocks or transactions, in response to `getblocks`.
    Inv { objects: Vec<InvObject> },
    /// A single freshly mined block.
    Block(Box<Block>),
    /// A single pending transaction.
    Tx(Transaction),
    /// The sender refused the block with the given hash.
    Reject { block_hash: u128 },
}

#[derive(Serialize, Deserialize)]
struct VersionBody {
    port: u16,
}

#[derive(Serialize)]
struct AddrBodyOut<'a> {
    count: usize,
    addresses: &'a [PeerAddress],
}

#[derive(Deserialize)]
struct AddrBodyIn {
    count: usize,
    addresses: Vec<PeerAddress>,
}

#[derive(Serialize, Deserialize)]
struct GetblocksBody {
    topblockhash: u128,
}

#[derive(Serialize)]
struct InvBodyOut<'a> {
    count: usize,
    objects: &'a [InvObject],
}

#[derive(Deserialize)]
struct InvBodyIn {
    count: usize,
    objects: Vec<InvObject>,
}

#[derive(Serialize, Deserialize)]
struct RejectBody {
    block_hash: u128,
}

impl Message {
    /// The command string identifying this message on the wire.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version { .. } => "version",
            Message::Verack => "verack",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Getaddr => "getaddr",
            Message::Addr { .. } => "addr",
            Message::Getblocks { .. } => "getblocks",
            Message::Inv { .. } => "inv",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Reject { .. } => "reject",
        }
    }

    /// Serializes the message body to its canonical JSON form.
    pub fn body_json(&self) -> Result<String, CodecError> {
        let json = match self {
            Message::Version { port } => serde_json::to_string(&VersionBody { port: *port })?,
            Message::Verack | Message::Ping | Message::Pong | Message::Getaddr => {
                serde_json::to_string(self.command())?
            }
            Message::Addr { addresses } => serde_json::to_string(&AddrBodyOut {
                count: addresses.len(),
                addresses,
            })?,
            Message::Getblocks { topblockhash } => serde_json::to_string(&GetblocksBody {
                topblockhash: *topblockhash,
            })?,
            Message::Inv { objects } => serde_json::to_string(&InvBodyOut {
                count: objects.len(),
                objects,
            })?,
            Message::Block(block) => serde_json::to_string(block)?,
            Message::Tx(tx) => serde_json::to_string(tx)?,
            Message::Reject { block_hash } => serde_json::to_string(&RejectBody {
                block_hash: *block_hash,
            })?,
        };
        Ok(json)
    }

    /// Rebuilds a message from its command string and raw body.
    pub fn from_command_body(command: &str, body: &RawValue) -> Result<Self, CodecError> {
        let raw = body.get();
        let msg = match command {
            "version" => {
                let body: VersionBody = serde_json::from_str(raw)?;
                Message::Version { port: body.port }
            }
            "verack" => Message::Verack,
            "ping" => Message::Ping,
            "pong" => Message::Pong,
            "getaddr" => Message::Getaddr,
            "addr" => {
                let body: AddrBodyIn = serde_json::from_str(raw)?;
                if body.count != body.addresses.len() {
                    return Err(CodecError::BadPeerCount);
                }
                Message::Addr {
                    addresses: body.addresses,
                }
            }
            "getblocks" => {
                let body: GetblocksBody = serde_json::from_str(raw)?;
                Message::Getblocks {
                    topblockhash: body.topblockhash,
                }
            }
            "inv" => {
                let body: InvBodyIn = serde_json::from_str(raw)?;
                if body.count != body.objects.len() {
                    return Err(CodecError::BadObjectCount);
                }
                Message::Inv {
                    objects: body.objects,
                }
            }
            "block" => Message::Block(Box::new(serde_json::from_str(raw)?)),
            "tx" => Message::Tx(serde_json::from_str(raw)?),
            "reject" => {
                let body: RejectBody = serde_json::from_str(raw)?;
                Message::Reject {
                    block_hash: body.block_hash,
                }
            }
            other => return Err(CodecError::UnknownCommand(other.to_string())),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let body = msg.body_json().expect("body serializes");
        let raw = RawValue::from_string(body).expect("raw value");
        Message::from_command_body(msg.command(), &raw).expect("body parses")
    }

    #[test]
    fn bare_commands_use_the_command_string_as_body() {
        assert_eq!(Message::Verack.body_json().unwrap(), "\"verack\"");
        assert_eq!(Message::Ping.body_json().unwrap(), "\"ping\"");
        assert_eq!(Message::Pong.body_json().unwrap(), "\"pong\"");
        assert_eq!(Message::Getaddr.body_json().unwrap(), "\"getaddr\"");
    }

    #[test]
    fn version_announces_the_listening_port() {
        let msg = roundtrip(&Message::Version { port: 2222 });
        match msg {
            Message::Version { port } => assert_eq!(port, 2222),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn addr_count_must_match() {
        let raw = RawValue::from_string(
            r#"{"count":2,"addresses":[["10.0.0.1",2222,"abc"]]}"#.to_string(),
        )
        .expect("raw value");
        assert!(matches!(
            Message::from_command_body("addr", &raw),
            Err(CodecError::BadPeerCount)
        ));
    }

    #[test]
    fn getblocks_carries_a_128_bit_hash() {
        let hash = u128::MAX - 1;
        let msg = roundtrip(&Message::Getblocks { topblockhash: hash });
        match msg {
            Message::Getblocks { topblockhash } => assert_eq!(topblockhash, hash),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn inv_objects_are_tagged_pairs() {
        use fumblechain_core::{Transaction, DEFAULT_MAGIC};

        let block = Block::new(0, 0);
        let tx = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        let msg = Message::Inv {
            objects: vec![InvObject::Block(block.clone()), InvObject::Tx(tx.clone())],
        };
        let body = msg.body_json().expect("body serializes");
        assert!(body.starts_with(r#"{"count":2,"objects":[["block","#));

        match roundtrip(&msg) {
            Message::Inv { objects } => {
                assert_eq!(objects.len(), 2);
                match &objects[0] {
                    InvObject::Block(b) => assert_eq!(b.hash(), block.hash()),
                    other => panic!("unexpected object {other:?}"),
                }
                match &objects[1] {
                    InvObject::Tx(t) => assert_eq!(t.hash(), tx.hash()),
                    other => panic!("unexpected object {other:?}"),
                }
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_commands_are_refused() {
        let raw = RawValue::from_string("{}".to_string()).expect("raw value");
        assert!(matches!(
            Message::from_command_body("gossip", &raw),
            Err(CodecError::UnknownCommand(_))
        ));
    }
}
