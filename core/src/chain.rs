//! The blockchain: ordered blocks, consensus rules and persistence.
//!
//! The chain always starts from a genesis block at index 0 with a zero
//! `prevhash`. New blocks are accepted through [`BlockChain::discard_block`],
//! which enforces every consensus rule in order: proof of work, linkage,
//! target, coinbase, signatures, fork resolution, replay prevention,
//! positive quantities and non-negative balances.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{Block, BASE_TARGET};
use crate::config::ChainConfig;
use crate::error::{Error, Result};
use crate::pool::TransactionPool;
use crate::transaction::{Transaction, COINBASE_SRC};

/// Upper bound the retargeting rule may raise the target to.
pub const MAX_TARGET: u128 = 1 << 126;

/// Number of blocks between target corrections.
pub const TARGET_WINDOW: u64 = 10;

/// Intended spacing between two blocks, in seconds.
pub const BLOCK_INTERVAL_SECONDS: f64 = 6.0;

/// Confirmations required before a balance is considered settled.
pub const SECURE_CONFIRMATIONS: usize = 6;

/// A chain of blocks plus the pool of pending transactions.
///
/// Only `chain` and `magic` persist; the pool and the infinite-balance
/// address list are runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockChain {
    pub chain: Vec<Block>,
    #[serde(default = "crate::transaction::default_magic")]
    pub magic: u32,
    #[serde(skip)]
    pub transaction_pool: TransactionPool,
    #[serde(skip)]
    ctf_wallets: Vec<String>,
}

/// One chain transaction involving a queried wallet, with the running
/// balance around it.
#[derive(Debug, Clone)]
pub struct WalletTxEntry {
    pub tx: Transaction,
    pub block_timestamp: f64,
    pub block_index: u64,
    pub balance_before: f64,
    pub balance_after: f64,
}

impl Default for BlockChain {
    fn default() -> Self {
        Self::new(ChainConfig::default())
    }
}

impl BlockChain {
    /// Creates a chain holding only a genesis block.
    pub fn new(config: ChainConfig) -> Self {
        Self {
            chain: vec![Block::new(0, 0)],
            magic: config.magic,
            transaction_pool: TransactionPool::new(),
            ctf_wallets: config.ctf_wallets,
        }
    }

    /// Returns the latest block.
    pub fn tip(&self) -> &Block {
        self.chain.last().expect("chain always holds a genesis block")
    }

    /// Returns the block with the given index.
    ///
    /// The special index `-1` returns the latest block.
    pub fn block_from_index(&self, index: i64) -> Option<&Block> {
        if index == -1 {
            return Some(self.tip());
        }
        let index = u64::try_from(index).ok()?;
        self.chain.iter().find(|b| b.index == index)
    }

    /// Returns the block with the given hash.
    pub fn block_from_hash(&self, hash: u128) -> Option<&Block> {
        self.chain.iter().find(|b| b.hash() == hash)
    }

    /// Returns every block added after the block with the given hash.
    ///
    /// Returns an empty list when that block is the tip, and `None` when no
    /// block with that hash exists.
    pub fn blocks_since(&self, hash: u128) -> Option<Vec<Block>> {
        let pos = self.chain.iter().position(|b| b.hash() == hash)?;
        Some(self.chain[pos + 1..].to_vec())
    }

    /// Returns the chain transaction with the given index, if any.
    pub fn get_transaction(&self, tx_id: &str) -> Option<&Transaction> {
        self.chain.iter().find_map(|b| b.get_transaction(tx_id))
    }

    /// Removes the top block from the chain.
    pub fn pop_block(&mut self) {
        self.chain.pop();
    }

    /// Wallet addresses with infinite coins, for CTF scenarios.
    pub fn ctf_wallet_addresses(&self) -> &[String] {
        &self.ctf_wallets
    }

    /// Replaces the infinite-balance address list.
    pub fn set_ctf_wallets(&mut self, wallets: Vec<String>) {
        self.ctf_wallets = wallets;
    }

    fn has_infinite_balance(&self, address: &str) -> bool {
        address == COINBASE_SRC || self.ctf_wallets.iter().any(|w| w == address)
    }

    /// The proof-of-work target the next block must satisfy.
    pub fn target(&self) -> u128 {
        self.next_target_for(self.chain.len())
    }

    /// The target for the block following the prefix `chain[..prefix]`.
    ///
    /// `prefix` must be at least 1. Until [`TARGET_WINDOW`] blocks exist the
    /// target is [`BASE_TARGET`]; it is then corrected every
    /// [`TARGET_WINDOW`] blocks by comparing the window's duration with the
    /// intended block interval.
    pub fn next_target_for(&self, prefix: usize) -> u128 {
        let tip = &self.chain[prefix - 1];
        let height = tip.index + 1;
        if height < TARGET_WINDOW {
            return BASE_TARGET;
        }
        let target = tip.target;
        if height % TARGET_WINDOW != 0 {
            return target;
        }

        let window_len = TARGET_WINDOW as usize;
        if prefix < window_len {
            return target;
        }
        let window = &self.chain[prefix - window_len..prefix];
        let duration = window[window_len - 1].timestamp - window[0].timestamp;
        let expected = TARGET_WINDOW as f64 * BLOCK_INTERVAL_SECONDS;
        if duration == 0.0 {
            debug!("retarget window has zero duration, keeping previous target");
            return target;
        }
        let correction = 1.0 - ((duration - expected) / duration);
        // the cast saturates, so a wild correction clamps to [1, MAX_TARGET]
        let corrected = ((target as f64) / correction) as u128;
        let new_target = corrected.clamp(1, MAX_TARGET);
        debug!(
            "retargeted: duration {duration}s over {expected}s expected, \
             target {target} -> {new_target}"
        );
        new_target
    }

    /// Returns true if `tx` is a valid coinbase transaction.
    pub fn is_valid_coinbase_transaction(&self, tx: &Transaction) -> bool {
        tx.src == COINBASE_SRC && tx.qty == 1.0
    }

    /// Checks that `block` is a structurally valid successor of `parent`.
    fn is_valid_successor(&self, block: &Block, parent: &Block, expected_target: u128) -> Result<()> {
        if !block.validate_proof() {
            debug!("block {} proof does not meet its target", block.index);
            return Err(Error::InvalidProof);
        }
        if block.prevhash != parent.hash() {
            debug!("block {} prevhash does not match its parent", block.index);
            return Err(Error::PrevHashMismatch);
        }
        if block.index != parent.index + 1 {
            debug!("block index {} does not follow {}", block.index, parent.index);
            return Err(Error::NonSequentialIndex);
        }
        if block.target != expected_target {
            debug!("block {} target differs from the expected target", block.index);
            return Err(Error::TargetMismatch);
        }
        let txs = block.transactions();
        match txs.first() {
            Some(coinbase) if self.is_valid_coinbase_transaction(coinbase) => {}
            _ => {
                debug!("block {} coinbase is invalid", block.index);
                return Err(Error::InvalidCoinbase);
            }
        }
        for tx in txs.iter().skip(1) {
            if !tx.verify() {
                debug!("invalid signature for transaction {} in block", tx.index);
                return Err(Error::BadSignature);
            }
        }
        Ok(())
    }

    /// True if none of the block's transaction indexes already appears in
    /// the chain.
    fn is_replay_free(&self, block: &Block) -> bool {
        let new_indexes: HashSet<&str> =
            block.transactions().iter().map(|t| t.index.as_str()).collect();
        for b in &self.chain {
            for tx in b.transactions() {
                if new_indexes.contains(tx.index.as_str()) {
                    return false;
                }
            }
        }
        true
    }

    /// True if every transaction quantity is a finite positive number.
    fn all_quantities_positive(&self, block: &Block) -> bool {
        block.transactions().iter().all(|tx| tx.qty.is_finite() && tx.qty > 0.0)
    }

    /// Simulates the block's debits against current balances.
    ///
    /// Transactions already counted through the pool are skipped. Every
    /// source wallet must exist and must never go below zero; infinite
    /// balances absorb any debit.
    fn is_balanced(&self, block: &Block) -> bool {
        let mut seen: HashSet<String> =
            self.transaction_pool.iter().map(|t| t.index.clone()).collect();
        let mut balances: HashMap<String, f64> = HashMap::new();

        for tx in block.transactions() {
            if !seen.insert(tx.index.clone()) {
                continue;
            }
            if !balances.contains_key(&tx.src) {
                match self.wallet_balance(&tx.src) {
                    Some(b) => balances.insert(tx.src.clone(), b),
                    None => return false,
                };
            }
            let balance = balances.get_mut(&tx.src).expect("balance just inserted");
            *balance -= tx.qty;
            if *balance < 0.0 {
                return false;
            }
        }
        true
    }

    /// Adds a new block to the chain, running every consensus check first.
    ///
    /// A block at the same height as the tip competes with it: it must be a
    /// valid successor of the tip's parent and wins only with a strictly
    /// earlier timestamp (ties broken by smaller hash), in which case the
    /// tip is replaced.
    pub fn discard_block(&mut self, block: Block) -> Result<()> {
        if block.index == self.tip().index && self.chain.len() > 1 {
            let expected = self.next_target_for(self.chain.len() - 1);
            let parent = &self.chain[self.chain.len() - 2];
            self.is_valid_successor(&block, parent, expected)?;

            let tip = self.tip();
            let wins = block.timestamp < tip.timestamp
                || (block.timestamp == tip.timestamp && block.hash() < tip.hash());
            if !wins {
                debug!("competing block at height {} loses to the tip", block.index);
                return Err(Error::ForkLost);
            }
            debug!("competing block at height {} replaces the tip", block.index);
            self.pop_block();
        } else {
            self.is_valid_successor(&block, self.tip(), self.target())?;
        }

        if !self.is_replay_free(&block) {
            debug!("block has transactions that have been replayed");
            return Err(Error::ReplayedTransaction);
        }
        if !self.all_quantities_positive(&block) {
            debug!("block has non-positive or non-finite transaction quantities");
            return Err(Error::NonPositiveQuantity);
        }
        if !self.is_balanced(&block) {
            debug!("block has transactions where wallet balance goes negative");
            return Err(Error::InsufficientBalance);
        }

        for tx in block.transactions() {
            self.transaction_pool.remove_transaction(tx);
        }
        self.chain.push(block);
        Ok(())
    }

    /// Adds a transaction to the pool after checking quantity, balance and
    /// signature.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<()> {
        if tx.qty.is_nan() || tx.qty <= 0.0 {
            return Err(Error::NonPositiveQuantity);
        }
        let balance = self.wallet_balance(&tx.src).ok_or(Error::UnknownWallet)?;
        if balance < tx.qty {
            return Err(Error::InsufficientBalance);
        }
        self.transaction_pool.add_transaction(tx)?;
        debug!("tx added to tx pool");
        Ok(())
    }

    /// Creates a new block template at the tip, filled with the given
    /// coinbase and then with pending transactions until the tree is full.
    pub fn new_block(&self, coinbase: Option<&Transaction>) -> Block {
        let tip = self.tip();
        let mut block = Block::with_target(tip.index + 1, tip.hash(), self.target());

        match coinbase {
            Some(tx) => {
                if !self.is_valid_coinbase_transaction(tx) {
                    debug!("invalid coinbase transaction for new block");
                }
                block.add_transaction(tx);
            }
            None => debug!("no coinbase transaction for new block"),
        }
        for tx in self.transaction_pool.iter() {
            if !block.add_transaction(tx) {
                break;
            }
        }
        block
    }

    fn update_balance(address: &str, balance: &mut f64, found: &mut bool, tx: &Transaction) {
        if tx.src == address {
            if balance.is_finite() {
                *balance -= tx.qty;
            }
            *found = true;
        } else if tx.dst == address {
            if balance.is_finite() {
                *balance += tx.qty;
            }
            *found = true;
        }
    }

    /// Returns the balance for the given wallet address, or `None` if the
    /// address never appears in the chain or the pool.
    pub fn wallet_balance(&self, address: &str) -> Option<f64> {
        if self.has_infinite_balance(address) {
            return Some(f64::INFINITY);
        }
        let mut balance = 0.0;
        let mut found = false;
        for b in &self.chain {
            for tx in b.transactions() {
                Self::update_balance(address, &mut balance, &mut found, tx);
            }
        }
        for tx in self.transaction_pool.iter() {
            Self::update_balance(address, &mut balance, &mut found, tx);
        }
        found.then_some(balance)
    }

    /// Returns the balance counting only transactions with at least
    /// [`SECURE_CONFIRMATIONS`] confirmations; pending transactions are
    /// excluded as well.
    pub fn secure_wallet_balance(&self, address: &str) -> Option<f64> {
        if self.has_infinite_balance(address) {
            return Some(f64::INFINITY);
        }
        let mut balance = 0.0;
        let mut found = false;
        let confirmed = &self.chain[..self.chain.len().saturating_sub(SECURE_CONFIRMATIONS)];
        for b in confirmed {
            for tx in b.transactions() {
                Self::update_balance(address, &mut balance, &mut found, tx);
            }
        }
        found.then_some(balance)
    }

    /// Returns all chain transactions involving `address`, newest first,
    /// together with the running balance around each: all transactions,
    /// then incoming only, then outgoing only.
    pub fn wallet_transactions(
        &self,
        address: &str,
    ) -> (Vec<WalletTxEntry>, Vec<WalletTxEntry>, Vec<WalletTxEntry>) {
        let mut txs = Vec::new();
        let mut ins = Vec::new();
        let mut outs = Vec::new();
        let mut balance = if self.has_infinite_balance(address) {
            f64::INFINITY
        } else {
            0.0
        };

        for b in &self.chain {
            for tx in b.transactions() {
                if tx.src != address && tx.dst != address {
                    continue;
                }
                let before = balance;
                if tx.src == address {
                    balance -= tx.qty;
                }
                if tx.dst == address {
                    balance += tx.qty;
                }
                let entry = WalletTxEntry {
                    tx: tx.clone(),
                    block_timestamp: b.timestamp,
                    block_index: b.index,
                    balance_before: before,
                    balance_after: balance,
                };
                txs.insert(0, entry.clone());
                if tx.src == address {
                    outs.insert(0, entry.clone());
                }
                if tx.dst == address {
                    ins.insert(0, entry);
                }
            }
        }
        (txs, ins, outs)
    }

    /// Returns the canonical JSON representation of this chain.
    ///
    /// The pool is not part of it.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("chain serializes")
    }

    /// Loads a chain from its JSON representation.
    pub fn from_json(data: &str) -> Result<Self> {
        let bc: BlockChain = serde_json::from_str(data)?;
        if bc.chain.is_empty() {
            return Err(Error::EmptyChain);
        }
        Ok(bc)
    }

    /// Saves this chain as JSON to the file at `path`.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json())?;
        Ok(())
    }

    /// Loads a chain from the JSON file at `path`.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
