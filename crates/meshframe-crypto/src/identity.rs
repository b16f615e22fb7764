//! Long-term device identity keys and the per-user shared secret.

use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::kdf::{SHARED_SECRET_LABEL, expand_secret};

/// Size of an X25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Long-term X25519 key pair owned by the local device.
///
/// The private half never leaves the device. The public half is published to
/// the key directory so peers can compute the [`SharedSecret`].
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from persisted secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Secret bytes for local persistence; restore with
    /// [`IdentityKeyPair::from_secret_bytes`].
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Public key bytes for publication.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Derive the shared secret with a remote identity.
    ///
    /// Symmetric: `a.agree(b.public_key()) == b.agree(a.public_key())`.
    pub fn agree(&self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> SharedSecret {
        let dh = self.secret.diffie_hellman(&PublicKey::from(*remote_public));
        SharedSecret(expand_secret(dh.as_bytes(), SHARED_SECRET_LABEL))
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public.as_bytes()).finish()
    }
}

/// Secret agreed between two identities, seeding every ratchet between them.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Wrap existing secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}
