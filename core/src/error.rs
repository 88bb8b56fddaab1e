//! Error types for the FumbleChain core crate.
//!
//! All fallible chain operations return [`crate::Result`], a convenient
//! alias for `core::result::Result<T, Error>`.
//!
//! Each variant names one reason a block or transaction is refused, so
//! callers (the peer manager, the HTTP surface) can log precisely while
//! still treating every rejection the same way.

use thiserror::Error;

/// Core crate error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Block hash does not satisfy the block target.
    #[error("proof of work does not meet the target")]
    InvalidProof,

    /// `prevhash` field does not match the hash of the previous block.
    #[error("block previous hash mismatch")]
    PrevHashMismatch,

    /// Block index is not exactly one greater than its predecessor's.
    #[error("block index non-sequential")]
    NonSequentialIndex,

    /// Block target differs from the target mandated at its height.
    #[error("block target mismatch")]
    TargetMismatch,

    /// First transaction of the block is not a valid coinbase.
    #[error("invalid coinbase transaction")]
    InvalidCoinbase,

    /// Transaction signature could not be verified against its source.
    #[error("transaction signature verification failed")]
    BadSignature,

    /// Transaction index already present in the pool.
    #[error("duplicate transaction index")]
    DuplicateTransaction,

    /// Transaction index already appears in a chain block.
    #[error("transaction replayed from the chain")]
    ReplayedTransaction,

    /// Transaction quantity is NaN, infinite, zero or negative.
    #[error("transaction quantity is not a positive number")]
    NonPositiveQuantity,

    /// Applying the transactions would drive a wallet balance negative.
    #[error("wallet balance would become negative")]
    InsufficientBalance,

    /// Source wallet never appears in the chain or the pool.
    #[error("wallet address not found")]
    UnknownWallet,

    /// A competing block at the same height lost the fork resolution.
    #[error("competing block loses to the current tip")]
    ForkLost,

    /// Serialized chain contains no blocks.
    #[error("chain contains no blocks")]
    EmptyChain,

    /// Chain file could not be read or written.
    #[error("chain file i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON could not be loaded.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenient result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
