//! Whole-file encryption for attachments.
//!
//! A file is sealed once under a fresh [`AttachmentKey`] and only then split
//! into chunks, so chunks carry nothing but ciphertext and never touch the
//! per-message ratchet. The key travels inside the (ratchet-encrypted) chat
//! message that references the file.
//!
//! Blob layout: `nonce (24) || ciphertext || tag (16)`.

use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::{
    aead::{self, POLY1305_TAG_SIZE},
    error::AttachmentError,
    header::NONCE_SIZE,
};

/// Default chunk size for splitting sealed attachments (16 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Associated data binding a blob to its purpose
const ATTACHMENT_AAD: &[u8] = b"meshframe-attachment";

/// Single-use symmetric key for one attachment.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachmentKey([u8; 32]);

impl AttachmentKey {
    /// Generate a fresh random key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    /// Restore a key received in message metadata.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes for embedding in message metadata.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Drop for AttachmentKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for AttachmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AttachmentKey(..)")
    }
}

/// Seal a whole file.
pub fn encrypt_attachment<R: RngCore + CryptoRng>(
    key: &AttachmentKey,
    data: &[u8],
    rng: &mut R,
) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let sealed = aead::seal(&key.0, &nonce, data, ATTACHMENT_AAD);

    let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    blob
}

/// Open a reassembled blob.
///
/// # Errors
///
/// - `Truncated` if the blob cannot hold a nonce and tag
/// - `AuthenticationFailed` on tag mismatch or wrong key
pub fn decrypt_attachment(key: &AttachmentKey, blob: &[u8]) -> Result<Vec<u8>, AttachmentError> {
    if blob.len() < NONCE_SIZE + POLY1305_TAG_SIZE {
        return Err(AttachmentError::Truncated { len: blob.len() });
    }

    let (nonce, sealed) = blob.split_at(NONCE_SIZE);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(nonce);

    aead::open(&key.0, &nonce_bytes, sealed, ATTACHMENT_AAD)
        .ok_or(AttachmentError::AuthenticationFailed)
}

/// Split a sealed blob into fixed-size chunks; the last may be shorter.
///
/// # Errors
///
/// - `InvalidChunkSize` if `chunk_size` is zero
pub fn split_chunks(blob: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>, AttachmentError> {
    if chunk_size == 0 {
        return Err(AttachmentError::InvalidChunkSize);
    }
    Ok(blob.chunks(chunk_size).map(<[u8]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn seal_split_join_open() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let key = AttachmentKey::generate(&mut rng);
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let blob = encrypt_attachment(&key, &data, &mut rng);
        let chunks = split_chunks(&blob, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(chunks.len(), blob.len().div_ceil(DEFAULT_CHUNK_SIZE));

        let joined: Vec<u8> = chunks.concat();
        assert_eq!(decrypt_attachment(&key, &joined).unwrap(), data);
    }

    #[test]
    fn wrong_key_fails() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let key = AttachmentKey::generate(&mut rng);
        let other = AttachmentKey::generate(&mut rng);

        let blob = encrypt_attachment(&key, b"file", &mut rng);
        assert_eq!(decrypt_attachment(&other, &blob), Err(AttachmentError::AuthenticationFailed));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let key = AttachmentKey::from_bytes([1; 32]);
        assert_eq!(
            decrypt_attachment(&key, &[0u8; 10]),
            Err(AttachmentError::Truncated { len: 10 })
        );
    }

    #[test]
    fn missing_chunk_fails_authentication() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let key = AttachmentKey::generate(&mut rng);
        let blob = encrypt_attachment(&key, &[7u8; 300], &mut rng);

        let chunks = split_chunks(&blob, 100).unwrap();
        let partial: Vec<u8> = chunks[..chunks.len() - 1].concat();
        assert!(decrypt_attachment(&key, &partial).is_err());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert_eq!(split_chunks(b"abc", 0), Err(AttachmentError::InvalidChunkSize));
    }

    #[test]
    fn empty_file_roundtrips() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let key = AttachmentKey::generate(&mut rng);
        let blob = encrypt_attachment(&key, b"", &mut rng);
        assert_eq!(decrypt_attachment(&key, &blob).unwrap(), b"");
    }
}
