//! Signed value-transfer records.

use serde::{Deserialize, Serialize};

use fumblechain_wallet::Wallet;

use crate::error::Result;
use crate::{md5_bytes, md5_hex};

/// Network identifier used when none is given explicitly.
pub const DEFAULT_MAGIC: u32 = 0xdead_beef;

/// The coinbase source address.
pub const COINBASE_SRC: &str = "0";

/// A transfer of `qty` coins from wallet `src` to wallet `dst`.
///
/// The `index` is a random UUID assigned at creation and is the
/// transaction's identity for replay prevention: no two transactions with
/// the same index may ever enter the chain. The identity hash covers every
/// field except `signature`, so signing does not change identity.
///
/// Fields are declared in lexicographic order; with the compact serializer
/// this yields the canonical JSON form that all hashes are computed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub dst: String,
    #[serde(default = "fresh_index")]
    pub index: String,
    #[serde(default = "default_magic")]
    pub magic: u32,
    pub qty: f64,
    #[serde(default)]
    pub signature: Option<String>,
    pub src: String,
}

fn fresh_index() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn default_magic() -> u32 {
    DEFAULT_MAGIC
}

/// The fields covered by the identity hash, in canonical key order.
#[derive(Serialize)]
struct Digest<'a> {
    dst: &'a str,
    index: &'a str,
    magic: u32,
    qty: f64,
    src: &'a str,
}

impl Transaction {
    /// Creates an unsigned transaction with a fresh random index.
    pub fn new(src: impl Into<String>, dst: impl Into<String>, qty: f64, magic: u32) -> Self {
        Self {
            dst: dst.into(),
            index: fresh_index(),
            magic,
            qty,
            signature: None,
            src: src.into(),
        }
    }

    /// Creates a coinbase transaction paying one coin to `dst`.
    pub fn coinbase(dst: impl Into<String>, magic: u32) -> Self {
        Self::new(COINBASE_SRC, dst, 1.0, magic)
    }

    /// Returns the 16-byte MD5 identity digest of this transaction.
    ///
    /// The digest covers the canonical JSON of all fields except
    /// `signature`.
    pub fn digest(&self) -> [u8; 16] {
        let fields = Digest {
            dst: &self.dst,
            index: &self.index,
            magic: self.magic,
            qty: self.qty,
            src: &self.src,
        };
        let json = serde_json::to_string(&fields).expect("transaction digest serializes");
        md5_bytes(json.as_bytes())
    }

    /// Returns the identity hash as a lowercase hex string.
    pub fn hash(&self) -> String {
        hex::encode(self.digest())
    }

    /// Appends the given hex-encoded signature to this transaction.
    ///
    /// Returns true if this transaction had not been signed yet, false
    /// otherwise.
    pub fn add_signature(&mut self, sig: impl Into<String>) -> bool {
        if self.signature.is_some() {
            return false;
        }
        self.signature = Some(sig.into());
        true
    }

    /// Signs this transaction's identity digest with `wallet`.
    ///
    /// Returns `Ok(false)` if the transaction already carried a signature.
    pub fn sign(&mut self, wallet: &Wallet) -> Result<bool> {
        if self.signature.is_some() {
            return Ok(false);
        }
        let sig = wallet
            .sign(&self.digest())
            .map_err(|_| crate::Error::BadSignature)?;
        Ok(self.add_signature(hex::encode(sig)))
    }

    /// Returns true if this transaction carries a valid signature from the
    /// wallet its `src` address names.
    ///
    /// Unsigned transactions and transactions whose `src` is not a wallet
    /// address (notably coinbases, where `src` is `"0"`) never verify.
    pub fn verify(&self) -> bool {
        let Some(sig_hex) = &self.signature else {
            return false;
        };
        let Ok(sig) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(pkey) = fumblechain_wallet::public_key_from_address(&self.src) else {
            return false;
        };
        fumblechain_wallet::verify(&sig, &self.digest(), &pkey)
    }

    /// Returns the canonical JSON representation of this transaction.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("transaction serializes")
    }

    /// Loads a transaction from its JSON representation.
    ///
    /// A missing `index` is replaced with a fresh one and a missing
    /// `signature` is left empty, mirroring construction.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// MD5 hash of the full canonical JSON, signature included.
    ///
    /// This is the leaf hash used by the transaction tree, which pins the
    /// signed bytes rather than the identity.
    pub(crate) fn leaf_hash(&self) -> String {
        md5_hex(self.to_json().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_ignores_signature() {
        let mut tx = Transaction::new("a", "b", 1.5, DEFAULT_MAGIC);
        let before = tx.hash();
        assert!(tx.add_signature("00ff"));
        assert_eq!(tx.hash(), before);
    }

    #[test]
    fn second_signature_is_refused() {
        let mut tx = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        assert!(tx.add_signature("aa"));
        assert!(!tx.add_signature("bb"));
        assert_eq!(tx.signature.as_deref(), Some("aa"));
    }

    #[test]
    fn fresh_transactions_have_distinct_indexes() {
        let t1 = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        let t2 = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        assert_ne!(t1.index, t2.index);
        assert_ne!(t1.hash(), t2.hash());
    }

    #[test]
    fn json_keys_are_sorted() {
        let tx = Transaction::new("s", "d", 2.0, DEFAULT_MAGIC);
        let json = tx.to_json();
        let dst = json.find("\"dst\"").unwrap();
        let index = json.find("\"index\"").unwrap();
        let magic = json.find("\"magic\"").unwrap();
        let qty = json.find("\"qty\"").unwrap();
        let signature = json.find("\"signature\"").unwrap();
        let src = json.find("\"src\"").unwrap();
        assert!(dst < index && index < magic && magic < qty && qty < signature && signature < src);
    }

    #[test]
    fn missing_index_gets_assigned() {
        let tx = Transaction::from_json(r#"{"dst":"d","magic":1,"qty":0.5,"src":"s"}"#).unwrap();
        assert!(!tx.index.is_empty());
        assert!(tx.signature.is_none());
    }
}
