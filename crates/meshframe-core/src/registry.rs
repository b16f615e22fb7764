//! Session registry: peer connection id → ratchet session.
//!
//! The registry is the only owner of ratchet state. It is an explicit object
//! handed to whoever needs peer-keyed lookups, so tests can build isolated
//! registries. Shared secrets are cached per remote user, since several
//! connections (devices, reconnects) of one user agree on the same secret.
//! A cached secret is only reused while the user's published key matches the
//! key it was agreed with; a rotated key re-derives it.
//!
//! At most one session exists per peer: [`SessionRegistry::establish`]
//! replaces (and terminates) any earlier session for the same peer.

use std::collections::HashMap;

use meshframe_crypto::{
    EncryptedEnvelope, IdentityKeyPair, RatchetError, RatchetHeader, RatchetSession, SessionState,
    SharedSecret,
};
use meshframe_proto::{LogicalType, RatchetEnvelope, RatchetPayload, WireHeader, associated_data};
use rand::{CryptoRng, RngCore};

use crate::{error::SessionError, mesh::should_initiate};

/// Which side of the ratchet a peer session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends first; primes the peer with `ratchet-init`
    Initiator,
    /// Waits for the initiator's first message
    Responder,
}

impl Role {
    /// Role of `local` towards `remote`: the greater identifier initiates.
    pub fn for_pair(local: &str, remote: &str) -> Self {
        if should_initiate(local, remote) { Self::Initiator } else { Self::Responder }
    }
}

/// Outcome of looking up a peer's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    /// Session can encrypt
    Ready,
    /// Responder session waiting for the initiator's first message
    AwaitingInit,
    /// No session yet; establish one first
    NeedsHandshake,
    /// Session exists but is unusable
    Fatal(SessionError),
}

struct CachedSecret {
    remote_public: [u8; 32],
    secret: SharedSecret,
}

/// Secret for `user_id`, re-derived if `remote_public` is not the key the
/// cached one was agreed with.
fn secret_for<'a>(
    secrets: &'a mut HashMap<String, CachedSecret>,
    identity: &IdentityKeyPair,
    user_id: &str,
    remote_public: &[u8; 32],
) -> &'a SharedSecret {
    let cached = secrets.entry(user_id.to_string()).or_insert_with(|| CachedSecret {
        remote_public: *remote_public,
        secret: identity.agree(remote_public),
    });
    if cached.remote_public != *remote_public {
        tracing::debug!("key for {} changed, re-deriving shared secret", user_id);
        *cached =
            CachedSecret { remote_public: *remote_public, secret: identity.agree(remote_public) };
    }
    &cached.secret
}

#[derive(Debug)]
struct PeerSession {
    user_id: String,
    role: Role,
    session: RatchetSession,
}

/// Peer-keyed ratchet sessions for one local device.
pub struct SessionRegistry {
    local_id: String,
    session_id: String,
    identity: IdentityKeyPair,
    /// Remote user id → agreed secret and the key it was agreed with
    secrets: HashMap<String, CachedSecret>,
    /// Peer connection id → session
    sessions: HashMap<String, PeerSession>,
}

impl SessionRegistry {
    /// Create an empty registry.
    ///
    /// `local_id` is our connection identifier, `session_id` the mesh
    /// session both bound into every envelope's associated data.
    pub fn new(local_id: String, session_id: String, identity: IdentityKeyPair) -> Self {
        Self { local_id, session_id, identity, secrets: HashMap::new(), sessions: HashMap::new() }
    }

    /// Our connection identifier.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Long-term public key to publish in the key directory.
    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key()
    }

    /// Shared secret with a remote user, derived once per published key.
    pub fn shared_secret(&mut self, user_id: &str, remote_public: &[u8; 32]) -> &SharedSecret {
        secret_for(&mut self.secrets, &self.identity, user_id, remote_public)
    }

    /// Create the session for `peer_id`, replacing any existing one.
    ///
    /// The role follows the tie-break rule, so both sides pick complementary
    /// roles without coordination.
    pub fn establish<R: RngCore + CryptoRng>(
        &mut self,
        peer_id: &str,
        user_id: &str,
        remote_public: &[u8; 32],
        rng: &mut R,
    ) -> Role {
        let role = Role::for_pair(&self.local_id, peer_id);
        let identity = &self.identity;
        let session = {
            let secret = secret_for(&mut self.secrets, identity, user_id, remote_public);
            match role {
                Role::Initiator => RatchetSession::init_as_initiator(secret, remote_public, rng),
                Role::Responder => RatchetSession::init_as_responder(secret, identity),
            }
        };

        let entry = PeerSession { user_id: user_id.to_string(), role, session };
        if let Some(mut previous) = self.sessions.insert(peer_id.to_string(), entry) {
            previous.session.terminate();
        }
        role
    }

    /// Whether a message can be sealed for `peer_id` right now.
    pub fn resolve(&self, peer_id: &str) -> SessionLookup {
        let Some(entry) = self.sessions.get(peer_id) else {
            return SessionLookup::NeedsHandshake;
        };
        match entry.session.state() {
            SessionState::Terminated => {
                SessionLookup::Fatal(SessionError::Ratchet(RatchetError::Terminated))
            },
            SessionState::ResponderReady => SessionLookup::AwaitingInit,
            SessionState::InitiatorReady | SessionState::Active => SessionLookup::Ready,
        }
    }

    /// Seal `plaintext` for `peer_id` as an `encrypted-ratchet` envelope.
    ///
    /// # Errors
    ///
    /// - `MissingSession` if no session exists for the peer
    /// - `Ratchet` if the session cannot encrypt (no send chain, terminated)
    pub fn encrypt_for<R: RngCore + CryptoRng>(
        &mut self,
        peer_id: &str,
        logical_type: LogicalType,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<RatchetEnvelope, SessionError> {
        let entry = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| SessionError::MissingSession { peer_id: peer_id.to_string() })?;

        let ad = associated_data(&self.session_id, &self.local_id, peer_id, logical_type);
        let sealed = entry.session.encrypt(plaintext, ad.as_bytes(), rng)?;

        Ok(RatchetEnvelope {
            payload: to_wire(sealed),
            sender_id: self.local_id.clone(),
            original_type: logical_type,
        })
    }

    /// Open an envelope received from `peer_id`.
    ///
    /// The associated data is rebuilt from the link the frame arrived on, so
    /// an envelope replayed onto another link or relabelled with another type
    /// fails authentication.
    ///
    /// # Errors
    ///
    /// - `MissingSession` if no session exists for the peer
    /// - `Ratchet` on authentication or ordering failure; the session is
    ///   unchanged
    pub fn decrypt_from<R: RngCore + CryptoRng>(
        &mut self,
        peer_id: &str,
        envelope: &RatchetEnvelope,
        rng: &mut R,
    ) -> Result<Vec<u8>, SessionError> {
        let entry = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| SessionError::MissingSession { peer_id: peer_id.to_string() })?;

        let ad =
            associated_data(&self.session_id, peer_id, &self.local_id, envelope.original_type);
        let sealed = from_wire(&envelope.payload);
        Ok(entry.session.decrypt(&sealed, ad.as_bytes(), rng)?)
    }

    /// Terminate and remove the session for `peer_id`.
    pub fn remove(&mut self, peer_id: &str) -> bool {
        match self.sessions.remove(peer_id) {
            Some(mut entry) => {
                entry.session.terminate();
                true
            },
            None => false,
        }
    }

    /// True if a session exists for the peer.
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    /// Role of the session with `peer_id`.
    pub fn role(&self, peer_id: &str) -> Option<Role> {
        self.sessions.get(peer_id).map(|e| e.role)
    }

    /// Remote user behind `peer_id`'s session.
    pub fn user_of(&self, peer_id: &str) -> Option<&str> {
        self.sessions.get(peer_id).map(|e| e.user_id.as_str())
    }

    /// Read-only view of the session with `peer_id`.
    pub fn session(&self, peer_id: &str) -> Option<&RatchetSession> {
        self.sessions.get(peer_id).map(|e| &e.session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("local_id", &self.local_id)
            .field("session_id", &self.session_id)
            .field("sessions", &self.sessions.len())
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

fn to_wire(sealed: EncryptedEnvelope) -> RatchetPayload {
    let RatchetHeader { dh, pn, n } = sealed.header;
    RatchetPayload {
        header: WireHeader { dh, pn, n },
        ciphertext: sealed.ciphertext,
        iv: sealed.nonce,
    }
}

fn from_wire(payload: &RatchetPayload) -> EncryptedEnvelope {
    let WireHeader { dh, pn, n } = payload.header;
    EncryptedEnvelope {
        header: RatchetHeader { dh, pn, n },
        ciphertext: payload.ciphertext.clone(),
        nonce: payload.iv,
    }
}
