//! Ratchet message header and the encrypted envelope it travels in.

/// Size of an X25519 public key in a header
const DH_SIZE: usize = 32;

/// Size of the canonical header encoding: dh || pn || n
pub const HEADER_SIZE: usize = DH_SIZE + 4 + 4;

/// Size of the `XChaCha20` nonce carried next to the ciphertext
pub const NONCE_SIZE: usize = 24;

/// Public per-message ratchet metadata.
///
/// Sent in the clear but bound into the AEAD associated data, so a ciphertext
/// cannot be replayed under a different ratchet position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub dh: [u8; 32],
    /// Length of the sender's previous send chain
    pub pn: u32,
    /// Index of this message in the current send chain
    pub n: u32,
}

impl RatchetHeader {
    /// Canonical byte encoding used as the associated data prefix.
    ///
    /// Layout: `dh (32) || pn (4, big-endian) || n (4, big-endian)`.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..DH_SIZE].copy_from_slice(&self.dh);
        bytes[DH_SIZE..DH_SIZE + 4].copy_from_slice(&self.pn.to_be_bytes());
        bytes[DH_SIZE + 4..].copy_from_slice(&self.n.to_be_bytes());
        bytes
    }

    /// Associated data actually authenticated by the AEAD.
    pub(crate) fn bind(&self, associated_data: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(HEADER_SIZE + associated_data.len());
        aad.extend_from_slice(&self.to_bytes());
        aad.extend_from_slice(associated_data);
        aad
    }
}

/// Output of [`crate::RatchetSession::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// Ratchet header
    pub header: RatchetHeader,
    /// Ciphertext including the 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
    /// Random 24-byte nonce
    pub nonce: [u8; NONCE_SIZE],
}
