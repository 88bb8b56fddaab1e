//! Blocks: header, transaction tree and proof.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::md5_int;
use crate::transaction::Transaction;
use crate::tree::Tree;

/// Initial proof-of-work target, used until the first retargeting window.
pub const BASE_TARGET: u128 = (1 << 120) - 1;

/// Returns the UNIX timestamp in seconds.
pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs_f64()
}

/// A block in the chain.
///
/// The block hash is MD5 over the canonical header JSON concatenated with
/// the proof string, read as a little-endian integer. A block is mined when
/// a proof is found such that the hash is below `target`.
///
/// Fields are declared in lexicographic order to match the canonical JSON
/// encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub prevhash: u128,
    #[serde(default)]
    pub proof: String,
    pub target: u128,
    pub timestamp: f64,
    #[serde(default)]
    pub trans_tree: Tree,
}

/// Header fields covered by the block hash, in canonical key order.
///
/// `trans_tree` collapses to the tree's root hash.
#[derive(Serialize)]
struct Header<'a> {
    index: u64,
    prevhash: u128,
    target: u128,
    timestamp: f64,
    trans_tree: &'a str,
}

impl Block {
    /// Creates an unmined block with an empty tree, the base target and
    /// the current wall-clock timestamp.
    pub fn new(index: u64, prevhash: u128) -> Self {
        Self::with_target(index, prevhash, BASE_TARGET)
    }

    /// Creates an unmined block with the given target.
    pub fn with_target(index: u64, prevhash: u128, target: u128) -> Self {
        Self {
            index,
            prevhash,
            proof: String::new(),
            target,
            timestamp: now_ts(),
            trans_tree: Tree::new(),
        }
    }

    /// Returns the canonical JSON of the block header.
    pub fn header_json(&self) -> String {
        let root = self.trans_tree.root_hash();
        let header = Header {
            index: self.index,
            prevhash: self.prevhash,
            target: self.target,
            timestamp: self.timestamp,
            trans_tree: &root,
        };
        serde_json::to_string(&header).expect("block header serializes")
    }

    /// Returns the block hash computed with the given candidate proof.
    ///
    /// Once the block carries its own proof, that proof is used and the
    /// candidate is ignored.
    pub fn hash_with(&self, proof: &str) -> u128 {
        let effective = if self.proof.is_empty() { proof } else { self.proof.as_str() };
        let mut data = self.header_json();
        data.push_str(effective);
        md5_int(data.as_bytes())
    }

    /// Returns the block hash.
    pub fn hash(&self) -> u128 {
        self.hash_with("")
    }

    /// Returns true if this block's own proof satisfies the target.
    pub fn validate_proof(&self) -> bool {
        self.hash() < self.target
    }

    /// Returns true if the candidate proof would satisfy the target.
    pub fn validate_proof_with(&self, proof: &str) -> bool {
        self.hash_with(proof) < self.target
    }

    /// Adds the given transaction to this block's tree.
    ///
    /// Returns false if the tree is full.
    pub fn add_transaction(&mut self, tx: &Transaction) -> bool {
        self.trans_tree.add_transaction(tx)
    }

    /// Returns this block's transactions in walk order.
    pub fn transactions(&self) -> Vec<&Transaction> {
        self.trans_tree.transactions()
    }

    /// Returns the transaction with the given index, if this block holds it.
    pub fn get_transaction(&self, tx_id: &str) -> Option<&Transaction> {
        self.transactions().into_iter().find(|tx| tx.index == tx_id)
    }

    /// Replaces the transaction tree with an empty one.
    ///
    /// Refused once the block has been mined.
    pub fn clear_tree(&mut self) -> bool {
        if !self.proof.is_empty() {
            return false;
        }
        self.trans_tree = Tree::new();
        true
    }

    /// Returns the canonical JSON representation of this block.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("block serializes")
    }

    /// Loads a block from its JSON representation.
    pub fn from_json(data: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::DEFAULT_MAGIC;

    #[test]
    fn hash_ignores_candidate_once_mined() {
        let mut b = Block::new(0, 0);
        let h_candidate = b.hash_with("42");
        b.proof = "42".into();
        assert_eq!(b.hash(), h_candidate);
        assert_eq!(b.hash_with("anything"), h_candidate);
    }

    #[test]
    fn clear_tree_only_before_mining() {
        let mut b = Block::new(0, 0);
        let tx = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        assert!(b.add_transaction(&tx));
        assert!(b.clear_tree());
        assert!(b.transactions().is_empty());

        b.proof = "7".into();
        b.add_transaction(&tx);
        assert!(!b.clear_tree());
        assert_eq!(b.transactions().len(), 1);
    }

    #[test]
    fn header_covers_the_tree_root() {
        let mut b = Block::new(3, 17);
        let before = b.hash();
        let tx = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        b.add_transaction(&tx);
        assert_ne!(b.hash(), before);
        assert!(b.header_json().contains(&b.trans_tree.root_hash()));
    }

    #[test]
    fn get_transaction_finds_by_index() {
        let mut b = Block::new(0, 0);
        let tx = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        b.add_transaction(&tx);
        assert_eq!(b.get_transaction(&tx.index).map(|t| t.hash()), Some(tx.hash()));
        assert!(b.get_transaction("missing").is_none());
    }
}
