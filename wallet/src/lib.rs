//! FumbleChain wallet crypto.
//!
//! Wallet keys are 1024-bit RSA with public exponent 3, and signatures are
//! PKCS#1 v1.5 over a pre-computed MD5 digest. A wallet address is the
//! base64 encoding of the public key's SubjectPublicKeyInfo PEM, so the
//! public key can always be recovered from the address alone.
//!
//! These parameters are weak on purpose: several classic attacks on RSA
//! (small exponent, MD5 collisions, common factors) can be mounted against
//! this chain, and every implementation must keep them bit-exact so wallets
//! interoperate.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::Md5;
use rsa::pkcs8::spki;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

/// RSA modulus size in bits.
pub const KEY_SIZE: usize = 1024;

/// RSA public exponent.
pub const PUBLIC_EXPONENT: u32 = 3;

/// Wallet crate error type.
#[derive(Debug, Error)]
pub enum Error {
    /// RSA key generation, signing or verification failed.
    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    /// Private key could not be encoded or decoded as PKCS#8 PEM.
    #[error("bad private key encoding: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    /// Public key could not be encoded or decoded as SPKI PEM.
    #[error("bad public key encoding: {0}")]
    Spki(#[from] spki::Error),

    /// Address is not valid base64.
    #[error("address is not valid base64")]
    BadAddress(#[from] base64::DecodeError),

    /// Key file could not be read or written.
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Generate a new keypair.
pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey)> {
    let mut rng = rand::thread_rng();
    let skey = RsaPrivateKey::new_with_exp(&mut rng, KEY_SIZE, &BigUint::from(PUBLIC_EXPONENT))?;
    let pkey = skey.to_public_key();
    Ok((skey, pkey))
}

/// Sign the given MD5 `digest` with the private key `skey`.
///
/// The digest is signed as-is (prehashed); it is not hashed again.
pub fn sign(digest: &[u8], skey: &RsaPrivateKey) -> Result<Vec<u8>> {
    let sig = skey.sign(Pkcs1v15Sign::new::<Md5>(), digest)?;
    Ok(sig)
}

/// Returns true if `sig` is a valid signature over `digest` for `pkey`.
pub fn verify(sig: &[u8], digest: &[u8], pkey: &RsaPublicKey) -> bool {
    pkey.verify(Pkcs1v15Sign::new::<Md5>(), digest, sig).is_ok()
}

/// Returns the wallet address for the given public key.
pub fn address_from_public_key(pkey: &RsaPublicKey) -> Result<String> {
    let pem = pkey.to_public_key_pem(LineEnding::LF)?;
    Ok(BASE64.encode(pem.as_bytes()))
}

/// Recovers the public key embedded in a wallet address.
pub fn public_key_from_address(address: &str) -> Result<RsaPublicKey> {
    let pem = BASE64.decode(address.as_bytes())?;
    let pem = String::from_utf8_lossy(&pem);
    Ok(RsaPublicKey::from_public_key_pem(&pem)?)
}

/// Returns the private key `skey` as a PKCS#8 PEM string.
pub fn serialize_private_key(skey: &RsaPrivateKey) -> Result<String> {
    let pem = skey.to_pkcs8_pem(LineEnding::LF)?;
    Ok(pem.to_string())
}

/// Loads a private key (and its public half) from PKCS#8 PEM bytes.
pub fn load_private_key(pem: &[u8]) -> Result<(RsaPrivateKey, RsaPublicKey)> {
    let pem = String::from_utf8_lossy(pem);
    let skey = RsaPrivateKey::from_pkcs8_pem(&pem)?;
    let pkey = skey.to_public_key();
    Ok((skey, pkey))
}

/// A wallet: an RSA keypair plus the operations the chain needs from it.
#[derive(Debug, Clone)]
pub struct Wallet {
    skey: RsaPrivateKey,
    pkey: RsaPublicKey,
}

impl Wallet {
    /// Creates a wallet with a freshly generated keypair.
    pub fn generate() -> Result<Self> {
        let (skey, pkey) = generate_keypair()?;
        Ok(Self { skey, pkey })
    }

    /// Loads a wallet from the PEM file at `path`.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_pem_bytes(&bytes)
    }

    /// Loads a wallet from PKCS#8 PEM bytes.
    pub fn from_pem_bytes(bytes: &[u8]) -> Result<Self> {
        let (skey, pkey) = load_private_key(bytes)?;
        Ok(Self { skey, pkey })
    }

    /// Writes this wallet's private key to the file at `path`.
    pub fn save_key(&self, path: impl AsRef<Path>) -> Result<()> {
        let pem = serialize_private_key(&self.skey)?;
        std::fs::write(path, pem)?;
        Ok(())
    }

    /// Signs the given MD5 digest with this wallet's private key.
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        sign(digest, &self.skey)
    }

    /// Returns true if `sig` verifies over `digest` with this wallet's key.
    pub fn verify(&self, sig: &[u8], digest: &[u8]) -> bool {
        verify(sig, digest, &self.pkey)
    }

    /// Returns this wallet's public address.
    pub fn address(&self) -> Result<String> {
        address_from_public_key(&self.pkey)
    }

    /// Returns this wallet's public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.pkey
    }

    /// Returns this wallet's private key in PEM format.
    pub fn private_key_pem(&self) -> Result<String> {
        serialize_private_key(&self.skey)
    }
}
