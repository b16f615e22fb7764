//! Double ratchet session between the local device and one remote peer.
//!
//! # State Machine
//!
//! ```text
//!                 init_as_initiator          first DH step
//!  (uninitialized) ────────────────► InitiatorReady ─────────┐
//!        │                                                    ▼
//!        │        init_as_responder          first DH step  Active ──► Terminated
//!        └────────────────────────► ResponderReady ─────────┘
//! ```
//!
//! The initiator can send immediately. The responder holds only the root key
//! until the initiator's first message arrives and triggers its DH step.
//!
//! Decryption works on a scratch copy of the session and commits it only
//! after the AEAD tag verifies. A forged or replayed frame therefore never
//! moves counters, chains, or the root key.

use std::collections::VecDeque;

use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    aead,
    chain::{ChainKey, MessageKey},
    error::RatchetError,
    header::{EncryptedEnvelope, NONCE_SIZE, RatchetHeader},
    identity::{IdentityKeyPair, SharedSecret},
    kdf::kdf_root,
    skipped::SkippedKeys,
};

/// Maximum number of message keys derived ahead in a single decrypt.
pub const MAX_SKIP: u32 = 1000;

/// Maximum number of skipped message keys held per session.
pub const MAX_SKIPPED_KEYS: usize = 1000;

/// Earlier remote ratchet keys remembered to classify late messages.
pub const MAX_PREVIOUS_CHAINS: usize = 32;

/// Lifecycle state of a [`RatchetSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Has a send chain, waiting for the peer's first reply
    InitiatorReady,
    /// Root key only; no chains until the first message arrives
    ResponderReady,
    /// Both chains derived by at least one DH step
    Active,
    /// Rejects every further operation
    Terminated,
}

/// Forward-secret encryption context for one remote peer.
#[derive(Clone)]
pub struct RatchetSession {
    state: SessionState,
    root_key: [u8; 32],
    send_chain: Option<ChainKey>,
    recv_chain: Option<ChainKey>,
    dh_self: StaticSecret,
    dh_self_public: PublicKey,
    dh_remote: Option<PublicKey>,
    /// Remote ratchet keys replaced by a DH step, newest last
    previous_remotes: VecDeque<[u8; 32]>,
    send_counter: u32,
    recv_counter: u32,
    previous_chain_length: u32,
    ratchet_steps: u64,
    skipped: SkippedKeys,
}

impl RatchetSession {
    /// Start a session as the side that sends first.
    ///
    /// Generates a fresh ratchet key pair and mixes its DH output against the
    /// remote identity key into the shared secret, producing the first send
    /// chain.
    pub fn init_as_initiator<R: RngCore + CryptoRng>(
        shared: &SharedSecret,
        remote_public: &[u8; 32],
        rng: &mut R,
    ) -> Self {
        let dh_self = StaticSecret::random_from_rng(&mut *rng);
        let remote = PublicKey::from(*remote_public);
        let dh_out = dh_self.diffie_hellman(&remote);
        let (root_key, send_chain) = kdf_root(shared.as_bytes(), dh_out.as_bytes());

        Self {
            state: SessionState::InitiatorReady,
            root_key,
            send_chain: Some(send_chain),
            recv_chain: None,
            dh_self_public: PublicKey::from(&dh_self),
            dh_self,
            dh_remote: Some(remote),
            previous_remotes: VecDeque::new(),
            send_counter: 0,
            recv_counter: 0,
            previous_chain_length: 0,
            ratchet_steps: 0,
            skipped: SkippedKeys::new(MAX_SKIPPED_KEYS),
        }
    }

    /// Start a session as the side that waits for the first message.
    ///
    /// The shared secret becomes the root key. The own long-term key pair is
    /// the ratchet key the initiator already agreed against.
    pub fn init_as_responder(shared: &SharedSecret, own: &IdentityKeyPair) -> Self {
        Self {
            state: SessionState::ResponderReady,
            root_key: *shared.as_bytes(),
            send_chain: None,
            recv_chain: None,
            dh_self: own.secret().clone(),
            dh_self_public: PublicKey::from(own.public_key()),
            dh_remote: None,
            previous_remotes: VecDeque::new(),
            send_counter: 0,
            recv_counter: 0,
            previous_chain_length: 0,
            ratchet_steps: 0,
            skipped: SkippedKeys::new(MAX_SKIPPED_KEYS),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once a send chain exists.
    pub fn can_send(&self) -> bool {
        self.state != SessionState::Terminated && self.send_chain.is_some()
    }

    /// Messages sent on the current send chain (Ns).
    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    /// Messages received on the current receive chain (Nr).
    pub fn receive_counter(&self) -> u32 {
        self.recv_counter
    }

    /// Length of the previous send chain (PN).
    pub fn previous_chain_length(&self) -> u32 {
        self.previous_chain_length
    }

    /// Number of DH ratchet steps performed.
    pub fn ratchet_steps(&self) -> u64 {
        self.ratchet_steps
    }

    /// Number of cached keys for messages not yet received.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Public half of the current local ratchet key.
    pub fn local_ratchet_key(&self) -> [u8; 32] {
        self.dh_self_public.to_bytes()
    }

    /// Last ratchet key received from the peer, if any.
    pub fn remote_ratchet_key(&self) -> Option<[u8; 32]> {
        self.dh_remote.map(|key| key.to_bytes())
    }

    /// Encrypt `plaintext`, binding the header and `associated_data`.
    ///
    /// # Errors
    ///
    /// - `UninitializedChain` if no send chain exists yet
    /// - `Terminated` if the session was terminated
    /// - `CounterOverflow` if the send chain is exhausted
    pub fn encrypt<R: RngCore + CryptoRng>(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
        rng: &mut R,
    ) -> Result<EncryptedEnvelope, RatchetError> {
        if self.state == SessionState::Terminated {
            return Err(RatchetError::Terminated);
        }
        let Some(chain) = self.send_chain.as_ref() else {
            return Err(RatchetError::UninitializedChain);
        };
        let next_counter = self.send_counter.checked_add(1).ok_or(RatchetError::CounterOverflow)?;

        let (next_chain, message_key) = chain.step(self.send_counter);
        let header = RatchetHeader {
            dh: self.dh_self_public.to_bytes(),
            pn: self.previous_chain_length,
            n: self.send_counter,
        };

        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        let ciphertext =
            aead::seal(message_key.key(), &nonce, plaintext, &header.bind(associated_data));

        self.send_chain = Some(next_chain);
        self.send_counter = next_counter;

        Ok(EncryptedEnvelope { header, ciphertext, nonce })
    }

    /// Decrypt an envelope produced by the peer's session.
    ///
    /// A header carrying a new ratchet key triggers a DH step. Keys for any
    /// indices skipped over are cached so those messages can still be read
    /// when they arrive late.
    ///
    /// # Errors
    ///
    /// - `AuthenticationFailed` on tag mismatch; the session is unchanged
    /// - `OutOfOrder` if the index was already consumed or never cached,
    ///   including late messages from an earlier remote chain
    /// - `SkipLimitExceeded` if the index is more than [`MAX_SKIP`] ahead
    /// - `MissingChain` if no receive chain matches the header's key
    /// - `Terminated` if the session was terminated
    pub fn decrypt<R: RngCore + CryptoRng>(
        &mut self,
        envelope: &EncryptedEnvelope,
        associated_data: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, RatchetError> {
        if self.state == SessionState::Terminated {
            return Err(RatchetError::Terminated);
        }

        let header = &envelope.header;
        let aad = header.bind(associated_data);

        if let Some(key) = self.skipped.get(&header.dh, header.n) {
            let plaintext = aead::open(key.key(), &envelope.nonce, &envelope.ciphertext, &aad)
                .ok_or(RatchetError::AuthenticationFailed)?;
            self.skipped.take(&header.dh, header.n);
            return Ok(plaintext);
        }

        // An old chain's key is never ratcheted to again
        if self.previous_remotes.contains(&header.dh) {
            return Err(RatchetError::OutOfOrder {
                current: self.recv_counter,
                requested: header.n,
            });
        }

        let mut next = self.clone();
        if next.remote_ratchet_key() != Some(header.dh) {
            if next.recv_chain.is_some() {
                next.skip_to(header.pn)?;
            }
            next.dh_ratchet(&header.dh, rng);
        }

        let message_key = next.receive_key(header.n)?;
        let plaintext = aead::open(message_key.key(), &envelope.nonce, &envelope.ciphertext, &aad)
            .ok_or(RatchetError::AuthenticationFailed)?;

        *self = next;
        Ok(plaintext)
    }

    /// Terminate the session and wipe its key material.
    pub fn terminate(&mut self) {
        self.state = SessionState::Terminated;
        self.root_key.zeroize();
        self.send_chain = None;
        self.recv_chain = None;
        self.skipped.clear();
        self.previous_remotes.clear();
    }

    /// Derive the message key for index `n` on the current receive chain.
    fn receive_key(&mut self, n: u32) -> Result<MessageKey, RatchetError> {
        if self.recv_chain.is_none() {
            return Err(RatchetError::MissingChain);
        }
        if n < self.recv_counter {
            return Err(RatchetError::OutOfOrder { current: self.recv_counter, requested: n });
        }

        self.skip_to(n)?;

        let chain = self.recv_chain.take().ok_or(RatchetError::MissingChain)?;
        let (next_chain, message_key) = chain.step(n);
        self.recv_chain = Some(next_chain);
        self.recv_counter = n.checked_add(1).ok_or(RatchetError::CounterOverflow)?;

        Ok(message_key)
    }

    /// Advance the receive chain to `until`, caching every key passed over.
    fn skip_to(&mut self, until: u32) -> Result<(), RatchetError> {
        let Some(remote) = self.remote_ratchet_key() else {
            return Ok(());
        };
        if until <= self.recv_counter {
            return Ok(());
        }
        if until - self.recv_counter > MAX_SKIP {
            return Err(RatchetError::SkipLimitExceeded {
                current: self.recv_counter,
                requested: until,
            });
        }

        while self.recv_counter < until {
            let chain = self.recv_chain.take().ok_or(RatchetError::MissingChain)?;
            let (next_chain, message_key) = chain.step(self.recv_counter);
            self.skipped.insert(remote, message_key);
            self.recv_chain = Some(next_chain);
            self.recv_counter += 1;
        }

        Ok(())
    }

    /// Perform a DH ratchet step against a newly observed remote key.
    fn dh_ratchet<R: RngCore + CryptoRng>(&mut self, remote: &[u8; 32], rng: &mut R) {
        let remote = PublicKey::from(*remote);

        self.previous_chain_length = self.send_counter;
        self.send_counter = 0;
        self.recv_counter = 0;
        if let Some(previous) = self.dh_remote.replace(remote) {
            self.previous_remotes.push_back(previous.to_bytes());
            if self.previous_remotes.len() > MAX_PREVIOUS_CHAINS {
                self.previous_remotes.pop_front();
            }
        }

        let dh_recv = self.dh_self.diffie_hellman(&remote);
        let (root_key, recv_chain) = kdf_root(&self.root_key, dh_recv.as_bytes());

        self.dh_self = StaticSecret::random_from_rng(&mut *rng);
        self.dh_self_public = PublicKey::from(&self.dh_self);

        let dh_send = self.dh_self.diffie_hellman(&remote);
        let (root_key, send_chain) = kdf_root(&root_key, dh_send.as_bytes());

        self.root_key.zeroize();
        self.root_key = root_key;
        self.recv_chain = Some(recv_chain);
        self.send_chain = Some(send_chain);
        self.ratchet_steps += 1;
        self.state = SessionState::Active;
    }
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("state", &self.state)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .field("previous_chain_length", &self.previous_chain_length)
            .field("ratchet_steps", &self.ratchet_steps)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}
