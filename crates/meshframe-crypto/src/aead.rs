//! `XChaCha20-Poly1305` sealing with associated data.
//!
//! Nonces are 24 random bytes supplied by the caller. The extended nonce
//! makes random nonces safe even for long-lived attachment keys.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

/// Poly1305 tag size (16 bytes)
pub(crate) const POLY1305_TAG_SIZE: usize = 16;

/// Encrypt `plaintext`, authenticating `aad` alongside it.
pub(crate) fn seal(key: &[u8; 32], nonce: &[u8; 24], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Decrypt and verify. `None` on any tag mismatch.
pub(crate) fn open(
    key: &[u8; 32],
    nonce: &[u8; 24],
    ciphertext: &[u8],
    aad: &[u8],
) -> Option<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher.decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad }).ok()
}
