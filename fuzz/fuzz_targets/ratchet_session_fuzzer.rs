//! Fuzz target for double ratchet sessions
//!
//! Drives an initiator/responder pair through arbitrary send, deliver,
//! reorder, replay and tamper operations.
//!
//! # Invariants
//!
//! - A delivered message decrypts to exactly what was sent, or fails with an
//!   ordering error (never with the wrong plaintext)
//! - Tampered or mislabelled envelopes never decrypt
//! - A failed decrypt leaves the session usable: a later in-order message
//!   still decrypts
//! - Replays are rejected
//! - NEVER panic

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshframe_crypto::{EncryptedEnvelope, IdentityKeyPair, RatchetError, RatchetSession};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

const AD: &[u8] = b"fuzz|initiator|responder|message";

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    /// `true` sends from the initiator
    Send { from_initiator: bool, plaintext: Vec<u8> },
    /// Deliver the in-flight message at `index`
    Deliver { index: u8 },
    /// Deliver a copy with one flipped bit
    Tamper { index: u8, bit: u16 },
    /// Deliver with the wrong associated data
    Mislabel { index: u8 },
    /// Deliver an already-delivered message again
    Replay { index: u8 },
}

struct InFlight {
    from_initiator: bool,
    envelope: EncryptedEnvelope,
    plaintext: Vec<u8>,
}

fuzz_target!(|input: (u64, Vec<Op>)| {
    let (seed, ops) = input;
    let mut rng = ChaCha20Rng::seed_from_u64(seed);

    let alice = IdentityKeyPair::generate(&mut rng);
    let bob = IdentityKeyPair::generate(&mut rng);
    let shared = alice.agree(&bob.public_key());
    let mut initiator = RatchetSession::init_as_initiator(&shared, &bob.public_key(), &mut rng);
    let mut responder = RatchetSession::init_as_responder(&bob.agree(&alice.public_key()), &bob);

    let mut in_flight: Vec<InFlight> = Vec::new();
    let mut delivered: Vec<InFlight> = Vec::new();

    for op in ops.into_iter().take(256) {
        match op {
            Op::Send { from_initiator, plaintext } => {
                let session = if from_initiator { &mut initiator } else { &mut responder };
                // The responder cannot send before it has heard from the initiator
                if let Ok(envelope) = session.encrypt(&plaintext, AD, &mut rng) {
                    in_flight.push(InFlight { from_initiator, envelope, plaintext });
                }
            }

            Op::Deliver { index } => {
                if in_flight.is_empty() {
                    continue;
                }
                let message = in_flight.remove(usize::from(index) % in_flight.len());
                let receiver = if message.from_initiator { &mut responder } else { &mut initiator };
                match receiver.decrypt(&message.envelope, AD, &mut rng) {
                    Ok(plaintext) => {
                        assert_eq!(plaintext, message.plaintext, "decrypted the wrong plaintext");
                        delivered.push(message);
                    }
                    Err(e) => assert!(
                        e.is_ordering() || e == RatchetError::MissingChain,
                        "unexpected {e:?}"
                    ),
                }
            }

            Op::Tamper { index, bit } => {
                let Some(message) = pick(&in_flight, index) else { continue };
                let mut envelope = message.envelope.clone();
                let len = envelope.ciphertext.len();
                if len == 0 {
                    continue;
                }
                let bit = usize::from(bit) % (len * 8);
                envelope.ciphertext[bit / 8] ^= 1 << (bit % 8);

                let receiver = if message.from_initiator { &mut responder } else { &mut initiator };
                let opened = receiver.decrypt(&envelope, AD, &mut rng);
                assert!(opened.is_err(), "tampered ciphertext opened");
            }

            Op::Mislabel { index } => {
                let Some(message) = pick(&in_flight, index) else { continue };
                let receiver = if message.from_initiator { &mut responder } else { &mut initiator };
                let opened = receiver.decrypt(&message.envelope, b"fuzz|other|read", &mut rng);
                assert!(opened.is_err(), "envelope opened under foreign associated data");
            }

            Op::Replay { index } => {
                let Some(message) = pick(&delivered, index) else { continue };
                let receiver = if message.from_initiator { &mut responder } else { &mut initiator };
                let opened = receiver.decrypt(&message.envelope, AD, &mut rng);
                assert!(opened.is_err(), "replay accepted");
            }
        }
    }

    // Whatever happened above, a fresh in-order message from the initiator
    // still gets through once the responder has a receive chain.
    if !delivered.iter().any(|m| m.from_initiator) {
        return;
    }
    let envelope = initiator.encrypt(b"final", AD, &mut rng).expect("initiator can always send");
    let opened = responder.decrypt(&envelope, AD, &mut rng).expect("in-order message rejected");
    assert_eq!(opened, b"final");
});

fn pick(messages: &[InFlight], index: u8) -> Option<&InFlight> {
    if messages.is_empty() {
        None
    } else {
        messages.get(usize::from(index) % messages.len())
    }
}
