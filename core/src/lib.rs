//! FumbleChain Core Library
//!
//! Provides the chain data model (transactions, the fixed-depth transaction
//! tree, blocks, the pending pool) and the consensus rules: proof-of-work
//! against an integer target, target retargeting, fork resolution, replay
//! prevention and balance accounting.
//!
//! Every structure serializes to canonical JSON: the compact encoding with
//! object keys in lexicographic order. All hashing is MD5 over canonical
//! JSON; block hashes are the 16 digest bytes read as a little-endian
//! integer, compared against the block target.

use md5::{Digest, Md5};

pub mod block;
pub mod chain;
pub mod config;
pub mod error;
pub mod pool;
pub mod pow;
pub mod transaction;
pub mod tree;

pub use block::Block;
pub use chain::BlockChain;
pub use config::{ChainConfig, ChainConfigBuilder};
pub use error::{Error, Result};
pub use pool::TransactionPool;
pub use transaction::{Transaction, DEFAULT_MAGIC};
pub use tree::{Tree, TreeNode};

/// MD5 digest of `data`.
pub(crate) fn md5_bytes(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// MD5 digest of `data` as a lowercase hex string.
pub(crate) fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5_bytes(data))
}

/// MD5 digest of `data` as a little-endian 128-bit integer.
pub(crate) fn md5_int(data: &[u8]) -> u128 {
    u128::from_le_bytes(md5_bytes(data))
}
