//! Symmetric chain keys and the message keys they yield.
//!
//! # Security Properties
//!
//! - Forward Secrecy: a chain step consumes the old chain key
//! - Key Uniqueness: each index produces a distinct message key
//! - Determinism: the same chain key always produces the same sequence

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// A message key derived from a chain.
///
/// Used for exactly one encryption or decryption and then dropped.
#[derive(Clone)]
pub struct MessageKey {
    /// The 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; 32],
    /// Position in the chain this key was derived at
    index: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain position this key belongs to.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// One link of a sending or receiving chain.
#[derive(Clone)]
pub struct ChainKey {
    key: [u8; 32],
}

impl ChainKey {
    /// Wrap raw key material produced by the root KDF.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the message key for `index` and the chain key that follows.
    ///
    /// The caller replaces its chain key with the returned one; the old value
    /// is zeroized when dropped.
    pub fn step(&self, index: u32) -> (ChainKey, MessageKey) {
        let message = MessageKey { key: self.derive(MESSAGE_LABEL), index };
        let next = ChainKey { key: self.derive(CHAIN_LABEL) };
        (next, message)
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChainKey(..)")
    }
}
