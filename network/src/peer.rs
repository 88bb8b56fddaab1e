//! Remote peer records.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A peer connected to the same FumbleChain network as us.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    /// Host and listening port (the listening port comes from the peer's
    /// `version` message, not from the socket).
    pub address: (String, u16),
    /// The remote node id.
    pub id: String,
    /// Did we dial this peer?
    pub client: bool,
    /// When we last heard from this peer.
    pub lastseen: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn new(address: (String, u16), id: String, client: bool) -> Self {
        Self {
            address,
            id,
            client,
            lastseen: None,
        }
    }

    /// Marks this peer as just heard from.
    pub fn seen(&mut self) {
        self.lastseen = Some(Utc::now());
    }

    /// Seconds elapsed since we last heard from this peer, `-1` if never.
    pub fn not_seen_for(&self) -> i64 {
        match self.lastseen {
            Some(t) => (Utc::now() - t).num_seconds(),
            None => -1,
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (host, port) = &self.address;
        write!(f, "peer {host}:{port} (client:{})", self.client)
    }
}
