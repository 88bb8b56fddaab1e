//! The p2p node: listener, timers and persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use fumblechain_core::BlockChain;

use crate::connection;
use crate::manager::{PeerManager, BLOCKCHAIN_SYNCHRONIZE_INTERVAL_SECONDS};

/// How often the chain is persisted to disk.
pub const BLOCKCHAIN_SAVE_INTERVAL_SECONDS: u64 = 300;

/// A running FumbleChain node: owns the peer manager and the chain file.
pub struct Node {
    manager: Arc<PeerManager>,
    chain_path: PathBuf,
}

impl Node {
    /// Creates a node around `chain`, listening on `port` and persisting
    /// to `chain_path`.
    pub fn new(chain: BlockChain, port: u16, max_peers: usize, chain_path: PathBuf) -> Self {
        Self {
            manager: PeerManager::new(chain, port, max_peers),
            chain_path,
        }
    }

    /// Handle to the peer manager (for the API surface and shutdown).
    pub fn manager(&self) -> Arc<PeerManager> {
        Arc::clone(&self.manager)
    }

    /// Saves the chain to disk, logging failures; the node keeps running.
    pub fn save(&self) {
        info!("saving blockchain to disk");
        if let Err(e) = self.manager.chain().save_to_file(&self.chain_path) {
            error!("failed to save blockchain: {e}");
        }
    }

    /// Runs the node: accepts connections, dials the initial peers, drains
    /// the ingress queues every few seconds and persists the chain
    /// periodically. Returns only if the listener fails.
    pub async fn run(&self, initial_peers: Vec<(String, u16)>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.manager.port())).await?;
        info!("p2p server listening on port {}", self.manager.port());
        info!("magic: {:#x}", self.manager.magic());
        info!("this node id: {}", self.manager.node_id());

        for (host, port) in initial_peers {
            self.manager().dial(host, port);
        }

        let manager = self.manager();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                BLOCKCHAIN_SYNCHRONIZE_INTERVAL_SECONDS,
            ));
            loop {
                ticker.tick().await;
                manager.synchronize_blockchain();
            }
        });

        // periodic persistence starts one full interval after boot
        let manager = self.manager();
        let path = self.chain_path.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(BLOCKCHAIN_SAVE_INTERVAL_SECONDS);
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                info!("saving blockchain to disk");
                if let Err(e) = manager.chain().save_to_file(&path) {
                    error!("failed to save blockchain: {e}");
                }
            }
        });

        loop {
            let (socket, addr) = listener.accept().await?;
            debug!("inbound connection from {addr}");
            tokio::spawn(connection::run(socket, self.manager(), false));
        }
    }
}
