//! Fuzz target for CBOR decoding attacks on `WireMessage`
//!
//! # Strategy
//!
//! - Deeply nested: arrays/maps nested to arbitrary depth under a valid tag
//! - Huge lengths: CBOR claiming massive byte/string/array lengths
//! - Random bytes: completely arbitrary CBOR data
//! - Tag confusion: a known `type` tag with another variant's body
//! - Oversized frames: inputs beyond the 1 MiB frame cap
//!
//! # Invariants
//!
//! - Decoding completes quickly (no infinite loops)
//! - Huge claimed lengths are rejected, not allocated
//! - Anything that decodes re-encodes and decodes to the same value
//! - NEVER panic on malformed CBOR

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshframe_proto::{MAX_FRAME_SIZE, WireMessage};

const TAGS: [&str; 12] = [
    "hello",
    "peer-list",
    "member-update",
    "ping",
    "pong",
    "encrypted-ratchet",
    "ratchet-init",
    "message",
    "edit-message",
    "delete-message",
    "read",
    "file-chunk",
];

#[derive(Debug, Clone, Arbitrary)]
enum CborAttack {
    DeeplyNested { depth: u8, tag: u8 },
    HugeLength { claimed_len_exponent: u8, tag: u8 },
    RandomBytes { bytes: Vec<u8> },
    TagConfusion { tag: u8, body: Vec<(String, u64)> },
    Oversized { fill: u8 },
}

fuzz_target!(|attack: CborAttack| {
    match attack {
        CborAttack::DeeplyNested { depth, tag } => {
            let mut bytes = tagged_map_header(tag, 2);
            bytes.extend(text("peers"));
            for _ in 0..(depth % 64) {
                bytes.push(0x81);
            }
            bytes.push(0x01);
            check(&bytes);
        }

        CborAttack::HugeLength { claimed_len_exponent, tag } => {
            let exponent = u32::from(claimed_len_exponent % 33);
            let claimed = if exponent < 32 { 1u32 << exponent } else { u32::MAX };

            for major in [0x5A, 0x7A, 0x9A] {
                let mut bytes = tagged_map_header(tag, 2);
                bytes.extend(text("data"));
                bytes.push(major);
                bytes.extend_from_slice(&claimed.to_be_bytes());
                bytes.extend(vec![0x01; (claimed as usize).min(8)]);
                check(&bytes);
            }
        }

        CborAttack::RandomBytes { bytes } => check(&bytes),

        CborAttack::TagConfusion { tag, body } => {
            let fields = body.len().min(23);
            let mut bytes = tagged_map_header(tag, fields as u8 + 1);
            for (key, value) in body.iter().take(fields) {
                bytes.extend(text(key));
                bytes.push(0x1B);
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            check(&bytes);
        }

        CborAttack::Oversized { fill } => {
            let bytes = vec![fill; MAX_FRAME_SIZE + 1];
            assert!(WireMessage::decode(&bytes).is_err(), "oversized frame accepted");
        }
    }
});

fn check(bytes: &[u8]) {
    if let Ok(message) = WireMessage::decode(bytes) {
        let encoded = message.encode().expect("decoded message must re-encode");
        let again = WireMessage::decode(&encoded).expect("re-encoded message must decode");
        assert_eq!(again, message, "re-encode changed the message");
    }
}

/// Map with `entries` pairs whose first pair is `"type": <tag>`.
fn tagged_map_header(tag: u8, entries: u8) -> Vec<u8> {
    let mut bytes = vec![0xA0 | entries.min(23)];
    bytes.extend(text("type"));
    bytes.extend(text(TAGS[usize::from(tag) % TAGS.len()]));
    bytes
}

fn text(s: &str) -> Vec<u8> {
    let len = s.len().min(23);
    let mut bytes = vec![0x60 | len as u8];
    bytes.extend_from_slice(&s.as_bytes()[..len]);
    bytes
}
