//! Connection pool and chain synchronization.
//!
//! The manager owns the chain, the table of live connections and the two
//! ingress queues peers feed (`blockq` and `txq`). Connections hold an
//! `Arc` back to it and reach the chain only through it, so all chain
//! mutations are serialized behind one lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use fumblechain_core::{Block, BlockChain, Transaction};

use crate::connection::{self, Outbound, PEER_TIMEOUT_SECONDS};
use crate::message::{Message, PeerAddress};
use crate::peer::Peer;

/// Maximum number of simultaneous peers.
pub const MAX_PEERS: usize = 300;

/// How often the ingress queues are drained into the chain.
pub const BLOCKCHAIN_SYNCHRONIZE_INTERVAL_SECONDS: u64 = 5;

/// How often to ask a random peer for blocks we may have missed.
pub const CATCHUP_SYNCHRONIZE_INTERVAL_SECONDS: u64 = 600;

/// Dial timeout.
const CONNECT_TIMEOUT_SECONDS: u64 = 5;

struct NodeEntry {
    outbox: UnboundedSender<Outbound>,
    /// Present once the connection received the peer's `version`.
    peer: Option<Peer>,
}

/// Owns the chain, the connection table and the ingress queues.
pub struct PeerManager {
    magic: u32,
    node_id: String,
    port: u16,
    max_peers: usize,
    chain: RwLock<BlockChain>,
    nodes: Mutex<HashMap<u64, NodeEntry>>,
    conn_seq: AtomicU64,
    blockq_tx: UnboundedSender<(Block, u64)>,
    txq_tx: UnboundedSender<(Transaction, u64)>,
    blockq_rx: Mutex<UnboundedReceiver<(Block, u64)>>,
    txq_rx: Mutex<UnboundedReceiver<(Transaction, u64)>>,
    catchup_started: AtomicBool,
}

impl PeerManager {
    /// Creates a manager owning `chain`, listening port `port` and capped
    /// at `max_peers` connections (0 means unlimited).
    pub fn new(chain: BlockChain, port: u16, max_peers: usize) -> Arc<Self> {
        let (blockq_tx, blockq_rx) = mpsc::unbounded_channel();
        let (txq_tx, txq_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            magic: chain.magic,
            node_id: uuid::Uuid::new_v4().to_string(),
            port,
            max_peers,
            chain: RwLock::new(chain),
            nodes: Mutex::new(HashMap::new()),
            conn_seq: AtomicU64::new(0),
            blockq_tx,
            txq_tx,
            blockq_rx: Mutex::new(blockq_rx),
            txq_rx: Mutex::new(txq_rx),
            catchup_started: AtomicBool::new(false),
        })
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Read access to the chain.
    pub fn chain(&self) -> RwLockReadGuard<'_, BlockChain> {
        self.chain.read().expect("chain lock poisoned")
    }

    /// Exclusive access to the chain.
    pub fn chain_mut(&self) -> RwLockWriteGuard<'_, BlockChain> {
        self.chain.write().expect("chain lock poisoned")
    }

    fn nodes_lock(&self) -> MutexGuard<'_, HashMap<u64, NodeEntry>> {
        self.nodes.lock().expect("node table lock poisoned")
    }

    /// Registers a fresh connection and returns its table key.
    pub(crate) fn register_connection(&self, outbox: UnboundedSender<Outbound>) -> u64 {
        let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        self.nodes_lock().insert(conn_id, NodeEntry { outbox, peer: None });
        conn_id
    }

    /// Attaches the peer record once its `version` message arrived.
    pub(crate) fn register_peer(&self, conn_id: u64, peer: Peer) {
        if let Some(entry) = self.nodes_lock().get_mut(&conn_id) {
            entry.peer = Some(peer);
        }
        self.log_peers();
    }

    /// Refreshes the last-seen time of the peer behind `conn_id`.
    pub(crate) fn touch_peer(&self, conn_id: u64) {
        if let Some(NodeEntry { peer: Some(peer), .. }) = self.nodes_lock().get_mut(&conn_id) {
            peer.seen();
        }
    }

    /// Drops a closed connection from the table.
    pub(crate) fn deregister(&self, conn_id: u64) {
        self.nodes_lock().remove(&conn_id);
        self.log_peers();
    }

    fn log_peers(&self) {
        let nodes = self.nodes_lock();
        debug!("peers ({}):", nodes.len());
        for entry in nodes.values() {
            if let Some(peer) = &entry.peer {
                debug!("  * {} -> {}", peer.id, peer);
            }
        }
    }

    /// Snapshot of all handshaken peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.nodes_lock().values().filter_map(|e| e.peer.clone()).collect()
    }

    fn peer_ids(&self) -> Vec<String> {
        self.nodes_lock()
            .values()
            .filter_map(|e| e.peer.as_ref().map(|p| p.id.clone()))
            .collect()
    }

    /// Addresses of live handshaken peers, expelling those silent for
    /// longer than the peer timeout.
    pub(crate) fn active_peer_addresses(&self) -> Vec<PeerAddress> {
        let mut addresses = Vec::new();
        let nodes = self.nodes_lock();
        for entry in nodes.values() {
            let Some(peer) = &entry.peer else { continue };
            if peer.not_seen_for() > PEER_TIMEOUT_SECONDS {
                debug!("expelling silent {}", peer);
                let _ = entry.outbox.send(Outbound::Disconnect);
                continue;
            }
            if peer.id == self.node_id {
                continue;
            }
            let (host, port) = peer.address.clone();
            addresses.push(PeerAddress(host, port, peer.id.clone()));
        }
        addresses
    }

    /// Hands a received block to the synchronizer.
    pub(crate) fn enqueue_block(&self, block: Block, conn_id: u64) {
        let _ = self.blockq_tx.send((block, conn_id));
    }

    /// Hands a received transaction to the synchronizer.
    pub(crate) fn enqueue_tx(&self, tx: Transaction, conn_id: u64) {
        let _ = self.txq_tx.send((tx, conn_id));
    }

    /// Applies a block straight to the chain (used for `inv` catch-up).
    pub(crate) fn apply_block(&self, block: Block) -> fumblechain_core::Result<()> {
        self.chain_mut().discard_block(block)
    }

    /// Sends a message to every handshaken peer.
    pub fn broadcast_raw(&self, message: &Message) {
        for entry in self.nodes_lock().values() {
            if entry.peer.is_some() {
                let _ = entry.outbox.send(Outbound::Message(message.clone()));
            }
        }
    }

    /// Broadcasts a block to all peers.
    pub fn broadcast_block(&self, block: &Block) {
        debug!("broadcasting block {}", block.index);
        self.broadcast_raw(&Message::Block(Box::new(block.clone())));
    }

    /// Broadcasts a transaction to all peers.
    pub fn broadcast_tx(&self, tx: &Transaction) {
        debug!("broadcasting tx {}", tx.index);
        self.broadcast_raw(&Message::Tx(tx.clone()));
    }

    /// Sends a message to one connection.
    pub(crate) fn send_to(&self, conn_id: u64, message: Message) {
        if let Some(entry) = self.nodes_lock().get(&conn_id) {
            let _ = entry.outbox.send(Outbound::Message(message));
        }
    }

    /// Dials a peer unless it is already connected, is ourselves, or the
    /// peer cap is reached.
    pub fn connect_to(self: Arc<Self>, id: &str, host: &str, port: u16) {
        if self.peer_ids().iter().any(|p| p == id) {
            debug!("already connected to {id}");
            return;
        }
        if id == self.node_id {
            debug!("this is me, ignoring: {id}");
            return;
        }
        let connected = self.nodes_lock().len();
        if self.max_peers > 0 && connected >= self.max_peers {
            debug!("ignoring peer {id}: peer cap reached");
            return;
        }
        debug!("connecting to new peer: {id}");
        self.dial(host.to_string(), port);
    }

    /// Opens an outbound connection to `host:port`.
    pub fn dial(self: Arc<Self>, host: String, port: u16) {
        tokio::spawn(async move {
            info!("connecting to {host}:{port}");
            let connect = TcpStream::connect((host.as_str(), port));
            match tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS), connect).await
            {
                Ok(Ok(socket)) => connection::run(socket, self, true).await,
                Ok(Err(e)) => warn!("failed to connect to {host}:{port}: {e}"),
                Err(_) => warn!("connection to {host}:{port} timed out"),
            }
        });
    }

    /// Drains the ingress queues into the chain.
    ///
    /// Transactions go to the pool; blocks are appended, re-broadcast on
    /// success, and answered with `reject` (or a catch-up, if the block is
    /// far ahead) on failure.
    pub fn synchronize_blockchain(&self) {
        loop {
            let next = self.txq_rx.lock().expect("txq lock poisoned").try_recv();
            let Ok((tx, _conn_id)) = next else { break };
            debug!("updating local blockchain with tx {}", tx.index);
            let result = self.chain_mut().add_transaction(tx);
            match result {
                Ok(()) => debug!("tx update success"),
                Err(e) => debug!("tx refused: {e}"),
            }
        }

        loop {
            let next = self.blockq_rx.lock().expect("blockq lock poisoned").try_recv();
            let Ok((block, conn_id)) = next else { break };
            if block.hash() == self.chain().tip().hash() {
                debug!("received block is already our tip");
                continue;
            }
            debug!("updating local blockchain with block {}", block.index);
            // bind before matching so the write guard is released here
            let result = self.chain_mut().discard_block(block.clone());
            match result {
                Ok(()) => {
                    debug!("block {} accepted", block.index);
                    self.broadcast_block(&block);
                }
                Err(e) => {
                    debug!("block {} refused: {e}", block.index);
                    let tip_index = self.chain().tip().index;
                    if block.index > tip_index + 1 {
                        // the sender is ahead of us, fetch what we miss
                        self.catch_up();
                    } else {
                        self.send_to(conn_id, Message::Reject { block_hash: block.hash() });
                    }
                }
            }
        }
    }

    /// Asks one random peer for the blocks following our tip.
    pub fn catch_up(&self) {
        let outboxes: Vec<UnboundedSender<Outbound>> = self
            .nodes_lock()
            .values()
            .filter(|e| e.peer.is_some())
            .map(|e| e.outbox.clone())
            .collect();
        if outboxes.is_empty() {
            debug!("not connected to any peer yet, cannot catch up");
            return;
        }
        let topblockhash = self.chain().tip().hash();
        let pick = rand::thread_rng().gen_range(0..outboxes.len());
        let _ = outboxes[pick].send(Outbound::Message(Message::Getblocks { topblockhash }));
    }

    /// Arms the periodic catch-up once the first handshake completes.
    pub(crate) fn start_catchup_timer(self: Arc<Self>) {
        if self.catchup_started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("starting periodic catch-up");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                CATCHUP_SYNCHRONIZE_INTERVAL_SECONDS,
            ));
            loop {
                ticker.tick().await;
                self.catch_up();
            }
        });
    }
}
