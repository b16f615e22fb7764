//! Meshframe Cryptographic Primitives
//!
//! Cryptographic building blocks for Meshframe. Pure state machines with no
//! I/O. Callers provide the random number generator, so tests can run with a
//! seeded RNG and production code with the OS entropy source.
//!
//! # Key Lifecycle
//!
//! Every pair of devices shares one long-term secret derived from X25519
//! identity keys. Each mesh link runs a double ratchet seeded from that
//! secret: a root chain advanced by Diffie-Hellman exchanges and two
//! symmetric chains that yield one message key per message.
//!
//! ```text
//! Identity X25519 ──► Shared Secret (per remote user)
//!                          │
//!                          ▼
//!                     Root Key ◄──── DH(ratchet keys)
//!                      │     │
//!                      ▼     ▼
//!            Send Chain       Receive Chain
//!                │                 │
//!                ▼                 ▼
//!          Message Keys       Message Keys
//!                │                 │
//!                ▼                 ▼
//!       XChaCha20-Poly1305 (header || associated data bound)
//! ```
//!
//! Attachments bypass the ratchet: the whole file is sealed once under a
//! single-use [`AttachmentKey`], then split into chunks for transport.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are replaced after every message key derivation
//! - Message keys are zeroized after a single use
//! - Skipped message keys are consumed on use and evicted beyond a bound
//!
//! Post-Compromise Security:
//! - Every change of sending direction performs a fresh DH exchange
//! - A new root key is mixed from the old one and the new DH output
//!
//! Authenticity:
//! - The ratchet header is authenticated as associated data, together with the
//!   caller's binding of session, sender, recipient and message type
//! - A failed tag leaves the session untouched

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod aead;
pub mod attachment;
mod chain;
mod error;
mod header;
mod identity;
mod kdf;
pub mod session;
mod skipped;

pub use attachment::{
    AttachmentKey, DEFAULT_CHUNK_SIZE, decrypt_attachment, encrypt_attachment, split_chunks,
};
pub use chain::{ChainKey, MessageKey};
pub use error::{AttachmentError, RatchetError};
pub use header::{EncryptedEnvelope, HEADER_SIZE, NONCE_SIZE, RatchetHeader};
pub use identity::{IdentityKeyPair, PUBLIC_KEY_SIZE, SharedSecret};
pub use session::{MAX_SKIP, MAX_SKIPPED_KEYS, RatchetSession, SessionState};
