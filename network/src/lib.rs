//! FumbleChain peer-to-peer networking.
//!
//! Peers exchange netstring-framed JSON messages (see [`codec`] and
//! [`message`]). Each connection runs its own task ([`connection`]); the
//! [`manager`] owns the chain and the connection table, and the [`node`]
//! wires everything to a TCP listener plus the periodic timers.

pub mod codec;
pub mod connection;
pub mod manager;
pub mod message;
pub mod node;
pub mod peer;

pub use codec::{CodecError, MessageCodec, NetstringCodec};
pub use connection::PeerState;
pub use manager::{PeerManager, MAX_PEERS};
pub use message::{InvObject, Message, PeerAddress};
pub use node::Node;
pub use peer::Peer;
