//! Root chain key derivation using HKDF.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::chain::ChainKey;

/// Info label for the root KDF
const ROOT_LABEL: &[u8] = b"meshframeRatchetV1";

/// Info label for turning a raw X25519 output into a long-term shared secret
pub(crate) const SHARED_SECRET_LABEL: &[u8] = b"meshframeSharedV1";

/// Mix a DH output into the root key.
///
/// Returns the next root key and a fresh chain key. The DH output is used as
/// HKDF salt and the current root key as input key material.
pub(crate) fn kdf_root(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], ChainKey) {
    let hkdf = Hkdf::<Sha256>::new(Some(dh_out.as_slice()), root_key);

    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_LABEL, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();

    (next_root, ChainKey::from_bytes(chain))
}

/// Expand raw key agreement output into a 32-byte secret.
pub(crate) fn expand_secret(ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);

    let mut out = [0u8; 32];
    let Ok(()) = hkdf.expand(info, &mut out) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    out
}
