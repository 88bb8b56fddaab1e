//! Chain configuration.
//!
//! The [`ChainConfig`] struct centralises the parameters that vary per
//! deployment: the network magic and the set of wallet addresses granted
//! infinite balance for CTF scenarios. It is constructed via the
//! [`ChainConfigBuilder`] using the fluent builder pattern, enabling
//! callers to customise only the fields they care about while keeping
//! sensible defaults.
//!
//! ```
//! use fumblechain_core::config::ChainConfig;
//!
//! let cfg = ChainConfig::default();
//! assert_eq!(cfg.magic, 0xdeadbeef);
//! ```

use serde::{Deserialize, Serialize};

use crate::transaction::DEFAULT_MAGIC;

/// Environment variable listing comma-separated infinite-balance addresses.
pub const CTF_WALLETS_ENV: &str = "CTF_WALLET_ADDRESSES";

/// Runtime configuration shared across the crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainConfig {
    /// Network identifier carried by every transaction and message.
    pub magic: u32,

    /// Wallet addresses treated as having infinite balance.
    pub ctf_wallets: Vec<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            ctf_wallets: Vec::new(),
        }
    }
}

impl ChainConfig {
    /// Builds a configuration from the process environment: the CTF wallet
    /// list comes from `CTF_WALLET_ADDRESSES` (comma-separated).
    pub fn from_env() -> Self {
        let ctf_wallets = std::env::var(CTF_WALLETS_ENV)
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            magic: DEFAULT_MAGIC,
            ctf_wallets,
        }
    }
}

/// Fluent builder for [`ChainConfig`].
pub struct ChainConfigBuilder {
    inner: ChainConfig,
}

impl ChainConfigBuilder {
    /// Starts a new builder pre-populated with [`ChainConfig::default`].
    pub fn new() -> Self {
        Self {
            inner: ChainConfig::default(),
        }
    }

    pub fn magic(mut self, magic: u32) -> Self {
        self.inner.magic = magic;
        self
    }

    pub fn ctf_wallets<I, S>(mut self, wallets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.ctf_wallets = wallets.into_iter().map(Into::into).collect();
        self
    }

    /// Consumes the builder returning an immutable configuration value.
    pub fn finish(self) -> ChainConfig {
        self.inner
    }
}

impl Default for ChainConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_fields() {
        let cfg = ChainConfigBuilder::new()
            .magic(0xabcdef12)
            .ctf_wallets(["shop", "bank"])
            .finish();
        assert_eq!(cfg.magic, 0xabcdef12);
        assert_eq!(cfg.ctf_wallets, vec!["shop", "bank"]);
    }
}
