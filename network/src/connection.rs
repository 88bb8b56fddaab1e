//! Per-peer protocol state machine.
//!
//! Each TCP connection is driven by one task that owns the framed socket
//! and multiplexes inbound frames, outbound commands from the manager and
//! the two periodic timers (heartbeat and peer solicitation). Whichever
//! side of the connection we are on, the first message out is `version`.
//!
//! The connection keeps a short-lived memory of the `block` and
//! `getblocks` messages it sent, so that an inbound `reject` can be told
//! apart from an attacker trying to talk our tip away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, MessageCodec};
use crate::manager::PeerManager;
use crate::message::{InvObject, Message, PeerAddress};
use crate::peer::Peer;

/// Consider a peer offline after this many seconds of silence.
pub const PEER_TIMEOUT_SECONDS: i64 = 120;

/// Heartbeat interval for the accepting side.
pub const HEARTBEAT_SECONDS: u64 = 60;

/// How often to solicit fresh peer addresses.
pub const PEER_SOLICIT_SECONDS: u64 = 60;

/// How long sent block hashes stay in the reject memory.
pub const REJECT_STATE_DURATION_SECONDS: u64 = 60;

/// Commands other tasks hand to a connection through its outbox.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Message),
    Disconnect,
}

/// Protocol position of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    VersionSent,
    Verified,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectKind {
    Block,
    Getblocks,
}

type PeerFramed = Framed<TcpStream, MessageCodec>;

struct Connection {
    manager: Arc<PeerManager>,
    conn_id: u64,
    client: bool,
    state: PeerState,
    remote_host: String,
    got_version: bool,
    got_verack: bool,
    heartbeat_enabled: bool,
    solicit_enabled: bool,
    reject_state: Vec<(Instant, RejectKind, u128)>,
}

/// Drives one peer connection until it closes.
pub(crate) async fn run(socket: TcpStream, manager: Arc<PeerManager>, client: bool) {
    let remote_host = socket
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "unknown".into());
    debug!("new connection with {remote_host} (client:{client})");

    let codec = MessageCodec::new(manager.magic(), manager.node_id().to_string());
    let mut framed = Framed::new(socket, codec);
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let conn_id = manager.register_connection(outbox_tx);

    let mut conn = Connection {
        manager: Arc::clone(&manager),
        conn_id,
        client,
        state: PeerState::New,
        remote_host,
        got_version: false,
        got_verack: false,
        heartbeat_enabled: false,
        solicit_enabled: false,
        reject_state: Vec::new(),
    };
    conn.drive(&mut framed, outbox_rx).await;
    conn.state = PeerState::Closed;
    manager.deregister(conn_id);
    debug!("closed connection with {}", conn.remote_host);
}

impl Connection {
    async fn drive(&mut self, framed: &mut PeerFramed, mut outbox: UnboundedReceiver<Outbound>) {
        // both sides open with a version announcement
        let version = Message::Version {
            port: self.manager.port(),
        };
        if let Err(e) = self.send(framed, version).await {
            warn!("failed to send version to {}: {e}", self.remote_host);
            return;
        }
        self.state = PeerState::VersionSent;

        let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECONDS));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut solicit = tokio::time::interval(Duration::from_secs(PEER_SOLICIT_SECONDS));
        solicit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok((message, sender_id))) => {
                        if let Err(e) = self.handle_message(framed, message, sender_id).await {
                            warn!("[{}] {e}", self.remote_host);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // any unparseable frame ends the connection
                        warn!("[{}] {e}", self.remote_host);
                        break;
                    }
                    None => break,
                },
                command = outbox.recv() => match command {
                    Some(Outbound::Message(message)) => {
                        if self.send(framed, message).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Disconnect) | None => {
                        info!("disconnecting from {}", self.remote_host);
                        break;
                    }
                },
                _ = heartbeat.tick(), if self.heartbeat_enabled => {
                    if self.send(framed, Message::Ping).await.is_err() {
                        break;
                    }
                }
                _ = solicit.tick(), if self.solicit_enabled => {
                    if self.send(framed, Message::Getaddr).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        framed: &mut PeerFramed,
        message: Message,
        sender_id: String,
    ) -> Result<(), CodecError> {
        debug!("<--- receiving {} from {}", message.command(), self.remote_host);
        match message {
            Message::Version { port } => {
                if !self.client {
                    // the accepting side drives the heartbeat
                    self.heartbeat_enabled = true;
                }
                self.solicit_enabled = true;
                let peer = Peer::new(
                    (self.remote_host.clone(), port),
                    sender_id.clone(),
                    self.client,
                );
                info!("adding node {sender_id} as new peer");
                self.manager.register_peer(self.conn_id, peer);
                self.send(framed, Message::Verack).await?;
                self.advance_handshake(true, false);
            }
            Message::Verack => {
                self.send(framed, Message::Getaddr).await?;
                self.manager.clone().start_catchup_timer();
                self.advance_handshake(false, true);
            }
            Message::Ping => {
                self.send(framed, Message::Pong).await?;
            }
            Message::Pong => {}
            Message::Getaddr => {
                self.send_addr(framed).await?;
            }
            Message::Addr { addresses } => {
                for PeerAddress(host, port, id) in addresses {
                    self.manager.clone().connect_to(&id, &host, port);
                }
            }
            Message::Block(block) => {
                self.manager.enqueue_block(*block, self.conn_id);
            }
            Message::Tx(tx) => {
                self.manager.enqueue_tx(tx, self.conn_id);
            }
            Message::Getblocks { topblockhash } => {
                let blocks = self.manager.chain().blocks_since(topblockhash);
                match blocks {
                    Some(blocks) => {
                        let objects = blocks.into_iter().map(InvObject::Block).collect();
                        self.send(framed, Message::Inv { objects }).await?;
                    }
                    None => {
                        self.send(framed, Message::Reject { block_hash: topblockhash }).await?;
                    }
                }
            }
            Message::Inv { objects } => {
                for object in objects {
                    if let InvObject::Block(block) = object {
                        let index = block.index;
                        if let Err(e) = self.manager.apply_block(block) {
                            debug!("inv block {index} refused: {e}");
                            break;
                        }
                    }
                }
            }
            Message::Reject { block_hash } => {
                self.handle_reject(block_hash);
            }
        }
        self.manager.touch_peer(self.conn_id);
        Ok(())
    }

    /// Sends one message, recording block hashes that may legitimately be
    /// rejected later.
    async fn send(&mut self, framed: &mut PeerFramed, message: Message) -> Result<(), CodecError> {
        match &message {
            Message::Block(block) => self.save_reject_state(RejectKind::Block, block.hash()),
            Message::Getblocks { topblockhash } => {
                self.save_reject_state(RejectKind::Getblocks, *topblockhash)
            }
            _ => {}
        }
        debug!("---> sending {} to {}", message.command(), self.remote_host);
        framed.send(message).await
    }

    async fn send_addr(&mut self, framed: &mut PeerFramed) -> Result<(), CodecError> {
        let addresses = self.manager.active_peer_addresses();
        if addresses.is_empty() {
            return Ok(());
        }
        self.send(framed, Message::Addr { addresses }).await
    }

    fn advance_handshake(&mut self, version: bool, verack: bool) {
        self.got_version |= version;
        self.got_verack |= verack;
        self.state = if self.got_version && self.got_verack {
            PeerState::Active
        } else {
            PeerState::Verified
        };
        debug!("connection with {} is now {:?}", self.remote_host, self.state);
    }

    fn save_reject_state(&mut self, kind: RejectKind, block_hash: u128) {
        self.reject_state.push((Instant::now(), kind, block_hash));
        self.prune_reject_state();
    }

    fn prune_reject_state(&mut self) {
        let ttl = Duration::from_secs(REJECT_STATE_DURATION_SECONDS);
        let now = Instant::now();
        self.reject_state.retain(|(t, _, _)| now.duration_since(*t) < ttl);
    }

    /// True if we recently sent this peer something it could reject with
    /// this block hash. A genuine entry is consumed.
    fn is_reject_genuine(&mut self, block_hash: u128) -> bool {
        self.prune_reject_state();
        if let Some(pos) = self.reject_state.iter().position(|(_, _, h)| *h == block_hash) {
            self.reject_state.remove(pos);
            return true;
        }
        false
    }

    fn handle_reject(&mut self, block_hash: u128) {
        if !self.is_reject_genuine(block_hash) {
            warn!(
                "unsolicited reject from {} for block hash {block_hash}, ignoring",
                self.remote_host
            );
            return;
        }
        {
            let mut chain = self.manager.chain_mut();
            if chain.chain.len() > 1 && chain.tip().hash() == block_hash {
                debug!("genuine reject message, popping block");
                chain.pop_block();
            }
        }
        self.manager.catch_up();
    }
}
