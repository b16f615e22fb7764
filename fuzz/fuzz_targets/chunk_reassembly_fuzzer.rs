//! Fuzz target for attachment chunk reassembly
//!
//! Seals a file, splits it, then feeds the chunks plus arbitrary forged
//! chunks to the reassembler in arbitrary order, linking the announcing
//! message at an arbitrary point.
//!
//! # Invariants
//!
//! - Every completed attachment is the exact file that was sealed
//! - An attachment completes at most once
//! - Malformed chunks are rejected, never panic
//! - `drop_peer` forgets everything from that peer

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshframe_core::ChunkReassembler;
use meshframe_crypto::{AttachmentKey, encrypt_attachment, split_chunks};
use meshframe_proto::{AttachmentRef, FileChunk};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

#[derive(Debug, Clone, Arbitrary)]
struct Input {
    seed: u64,
    file: Vec<u8>,
    chunk_size: u8,
    order: Vec<u8>,
    link_at: u8,
    forged: Vec<Forged>,
}

#[derive(Debug, Clone, Arbitrary)]
struct Forged {
    chunk_index: u32,
    total_chunks: u32,
    data: Vec<u8>,
    same_file: bool,
}

fuzz_target!(|input: Input| {
    let mut rng = ChaCha20Rng::seed_from_u64(input.seed);
    let key = AttachmentKey::generate(&mut rng);
    let blob = encrypt_attachment(&key, &input.file, &mut rng);
    let chunk_size = usize::from(input.chunk_size).max(1) * 16;
    let Ok(chunks) = split_chunks(&blob, chunk_size) else { return };
    let total_chunks = chunks.len() as u32;

    let attachment = AttachmentRef {
        file_id: "file".to_string(),
        name: "fuzz.bin".to_string(),
        mime_type: "application/octet-stream".to_string(),
        size: input.file.len() as u64,
        total_chunks,
        key: key.to_bytes(),
    };

    let mut frames: Vec<FileChunk> = chunks
        .into_iter()
        .enumerate()
        .map(|(index, data)| FileChunk {
            file_id: "file".to_string(),
            chunk_index: index as u32,
            total_chunks,
            data,
        })
        .collect();

    // Arbitrary delivery order
    for (i, swap) in input.order.iter().enumerate() {
        let len = frames.len();
        frames.swap(i % len, usize::from(*swap) % len);
    }

    let mut reassembler = ChunkReassembler::default();
    let mut completed = 0;
    let link_at = usize::from(input.link_at) % (frames.len() + 1);

    for forged in input.forged.iter().take(16) {
        let file_id = if forged.same_file { "file" } else { "other" };
        let chunk = FileChunk {
            file_id: file_id.to_string(),
            chunk_index: forged.chunk_index,
            total_chunks: forged.total_chunks,
            data: forged.data.clone(),
        };
        if let Ok(Some(done)) = reassembler.accept_chunk("mallory", chunk) {
            assert_ne!(done.data, input.file, "forged chunks produced the real file");
        }
    }

    for (position, frame) in frames.into_iter().enumerate() {
        if position == link_at {
            if let Ok(Some(done)) = reassembler.link("alice", "msg", &attachment) {
                assert_eq!(done.data, input.file);
                completed += 1;
            }
        }
        if let Ok(Some(done)) = reassembler.accept_chunk("alice", frame) {
            assert_eq!(done.data, input.file);
            completed += 1;
        }
    }
    if link_at == total_chunks as usize {
        if let Ok(Some(done)) = reassembler.link("alice", "msg", &attachment) {
            assert_eq!(done.data, input.file);
            completed += 1;
        }
    }

    assert_eq!(completed, 1, "attachment completed {completed} times");

    reassembler.drop_peer("mallory");
    assert_eq!(reassembler.pending(), 0);
});
