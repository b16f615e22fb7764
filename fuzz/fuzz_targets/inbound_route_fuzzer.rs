//! Fuzz target for inbound frame routing
//!
//! Feeds arbitrary frames through `route_inbound` with an opener that returns
//! attacker-chosen "plaintext", modelling a peer that can produce any
//! authenticated payload.
//!
//! # Invariants
//!
//! - The opener runs at most once per frame (no nested unwrapping)
//! - A routed user message is never a clear-text frame
//! - A routed user message's type matches the envelope's declared type
//! - Control and chunk results never come out of an envelope
//! - NEVER panic

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshframe_core::{RouteError, Routed, SessionError, route_inbound};
use meshframe_crypto::RatchetError;
use meshframe_proto::{MessageClass, WireMessage};

#[derive(Debug, Clone, Arbitrary)]
struct Input {
    frame: Vec<u8>,
    inner: Inner,
}

#[derive(Debug, Clone, Arbitrary)]
enum Inner {
    Bytes(Vec<u8>),
    /// Re-use the outer frame as the plaintext, so an envelope opens to
    /// another envelope
    Echo,
    Reject,
}

fuzz_target!(|input: Input| {
    let mut opened = 0usize;
    let mut declared = None;

    let result = route_inbound(&input.frame, |envelope| {
        opened += 1;
        declared = Some(envelope.original_type);
        match &input.inner {
            Inner::Bytes(bytes) => Ok(bytes.clone()),
            Inner::Echo => Ok(input.frame.clone()),
            Inner::Reject => Err(SessionError::Ratchet(RatchetError::AuthenticationFailed)),
        }
    });

    assert!(opened <= 1, "opened {opened} envelopes for one frame");

    let outer = WireMessage::decode(&input.frame).ok();
    match result {
        Ok(Routed::User { message, logical_type }) => {
            assert_eq!(opened, 1, "user message routed without an envelope");
            assert_eq!(Some(logical_type), declared);
            assert_eq!(message.logical_type(), Some(logical_type));
        }
        Ok(Routed::Control(message)) => {
            assert_eq!(opened, 0, "control message came out of an envelope");
            assert_eq!(message.class(), MessageClass::Control);
        }
        Ok(Routed::Chunk(_)) => assert_eq!(opened, 0, "chunk came out of an envelope"),
        Err(RouteError::PlaintextUserMessage(_)) => {
            assert!(outer.is_some_and(|m| m.class() == MessageClass::User));
        }
        Err(_) => {}
    }
});
