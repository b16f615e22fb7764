//! Chunked transfer reassembly.
//!
//! Attachments arrive as pre-sealed chunks plus, separately, a message whose
//! attachment reference carries the file key. Either may come first. A
//! transfer completes once every chunk is present *and* the reference has
//! been linked; the chunks are joined in index order and opened with the key.
//!
//! Chunks are idempotent: a repeated index overwrites the earlier data and is
//! never counted twice. Once a transfer has finished (or failed to open), late
//! chunks and re-links for the same file are ignored, so an edit that repeats
//! an attachment reference does not reopen it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use meshframe_crypto::{AttachmentKey, DEFAULT_CHUNK_SIZE, decrypt_attachment};
use meshframe_proto::{AttachmentRef, FileChunk};

use crate::error::ReassemblyError;

/// Largest accepted chunk count per file (64 MiB at the default chunk size).
pub const MAX_TOTAL_CHUNKS: u32 = 4096;

/// Most transfers one peer may have in flight.
pub const MAX_PENDING_TRANSFERS: usize = 64;

/// Largest sealed blob buffered for one file.
pub const MAX_TRANSFER_BYTES: usize = MAX_TOTAL_CHUNKS as usize * DEFAULT_CHUNK_SIZE;

/// Finished file ids remembered to ignore late chunks.
pub const MAX_COMPLETED_TRANSFERS: usize = 1024;

/// Chunks of one sealed file, keyed by index.
#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    total: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
    max_bytes: usize,
}

impl ChunkBuffer {
    /// Empty buffer expecting `total` chunks.
    pub fn new(total: u32) -> Self {
        Self::with_byte_limit(total, MAX_TRANSFER_BYTES)
    }

    /// Empty buffer holding at most `max_bytes` of chunk data.
    pub fn with_byte_limit(total: u32, max_bytes: usize) -> Self {
        Self { total, chunks: BTreeMap::new(), bytes: 0, max_bytes }
    }

    /// Store a chunk, replacing any earlier data at the same index.
    ///
    /// # Errors
    ///
    /// - `IndexOutOfRange` if `index >= total`
    /// - `TransferTooLarge` if the buffer would exceed its byte limit; the
    ///   chunk is not stored
    pub fn insert(&mut self, index: u32, data: Vec<u8>) -> Result<(), ReassemblyError> {
        if index >= self.total {
            return Err(ReassemblyError::IndexOutOfRange { index, total: self.total });
        }
        let replaced = self.chunks.get(&index).map_or(0, Vec::len);
        let bytes = self.bytes - replaced + data.len();
        if bytes > self.max_bytes {
            return Err(ReassemblyError::TransferTooLarge { max: self.max_bytes });
        }
        self.bytes = bytes;
        self.chunks.insert(index, data);
        Ok(())
    }

    /// Bytes buffered so far.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Expected chunk count.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Distinct indices received.
    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// True once every index is present.
    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    /// Concatenate in index order; `None` while incomplete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        self.is_complete().then(|| self.chunks.values().flatten().copied().collect())
    }
}

/// A finished, decrypted attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// Attachment identifier
    pub file_id: String,
    /// Message the attachment belongs to
    pub message_id: String,
    /// Original file name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Plaintext bytes
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct LinkedMessage {
    message_id: String,
    name: String,
    mime_type: String,
    key: AttachmentKey,
}

#[derive(Debug)]
struct Transfer {
    buffer: ChunkBuffer,
    linked: Option<LinkedMessage>,
}

type TransferKey = (String, String);

/// In-flight transfers keyed by (peer, file id).
#[derive(Debug)]
pub struct ChunkReassembler {
    transfers: HashMap<TransferKey, Transfer>,
    /// Finished transfers, oldest first
    completed: VecDeque<TransferKey>,
    completed_set: HashSet<TransferKey>,
    max_total_chunks: u32,
    max_pending: usize,
    max_transfer_bytes: usize,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(MAX_TOTAL_CHUNKS, MAX_PENDING_TRANSFERS)
    }
}

impl ChunkReassembler {
    /// Reassembler with custom limits.
    pub fn new(max_total_chunks: u32, max_pending: usize) -> Self {
        Self {
            transfers: HashMap::new(),
            completed: VecDeque::new(),
            completed_set: HashSet::new(),
            max_total_chunks,
            max_pending,
            max_transfer_bytes: MAX_TRANSFER_BYTES,
        }
    }

    /// Cap the sealed bytes buffered per file.
    #[must_use]
    pub fn with_max_transfer_bytes(mut self, max: usize) -> Self {
        self.max_transfer_bytes = max;
        self
    }

    /// Buffer a chunk from `peer_id`. Returns the attachment if this chunk
    /// completed an already-linked transfer.
    ///
    /// # Errors
    ///
    /// - `InvalidTotal`, `IndexOutOfRange`, `TotalMismatch` for malformed
    ///   chunks
    /// - `TooManyPending` if the peer has too many open transfers
    /// - `TransferTooLarge` if the file outgrows the byte limit; the transfer
    ///   is discarded
    /// - `Attachment` if the completed blob fails to open; the transfer is
    ///   discarded
    pub fn accept_chunk(
        &mut self,
        peer_id: &str,
        chunk: FileChunk,
    ) -> Result<Option<Reassembled>, ReassemblyError> {
        let key = (peer_id.to_string(), chunk.file_id);
        if self.completed_set.contains(&key) {
            tracing::trace!("late chunk of finished {} from {}", key.1, key.0);
            return Ok(None);
        }

        let transfer = self.transfer_mut(&key, chunk.total_chunks)?;
        if let Err(e) = transfer.buffer.insert(chunk.chunk_index, chunk.data) {
            if matches!(e, ReassemblyError::TransferTooLarge { .. }) {
                self.transfers.remove(&key);
            }
            return Err(e);
        }
        self.try_complete(&key)
    }

    /// Link a transfer to the message that announced it. Returns the
    /// attachment if all chunks had already arrived.
    ///
    /// # Errors
    ///
    /// Same as [`Self::accept_chunk`].
    pub fn link(
        &mut self,
        peer_id: &str,
        message_id: &str,
        attachment: &AttachmentRef,
    ) -> Result<Option<Reassembled>, ReassemblyError> {
        let key = (peer_id.to_string(), attachment.file_id.clone());
        if self.completed_set.contains(&key) {
            tracing::trace!("{} from {} already finished", key.1, key.0);
            return Ok(None);
        }

        let transfer = self.transfer_mut(&key, attachment.total_chunks)?;
        transfer.linked = Some(LinkedMessage {
            message_id: message_id.to_string(),
            name: attachment.name.clone(),
            mime_type: attachment.mime_type.clone(),
            key: AttachmentKey::from_bytes(attachment.key),
        });
        self.try_complete(&key)
    }

    /// Discard every transfer from `peer_id`. Returns how many were dropped.
    pub fn drop_peer(&mut self, peer_id: &str) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|(peer, _), _| peer != peer_id);
        self.completed.retain(|(peer, _)| peer != peer_id);
        self.completed_set.retain(|(peer, _)| peer != peer_id);
        before - self.transfers.len()
    }

    /// Number of unfinished transfers across all peers.
    pub fn pending(&self) -> usize {
        self.transfers.len()
    }

    fn transfer_mut(
        &mut self,
        key: &TransferKey,
        total: u32,
    ) -> Result<&mut Transfer, ReassemblyError> {
        if total == 0 || total > self.max_total_chunks {
            return Err(ReassemblyError::InvalidTotal { total, max: self.max_total_chunks });
        }

        if !self.transfers.contains_key(key) {
            let open = self.transfers.keys().filter(|(peer, _)| *peer == key.0).count();
            if open >= self.max_pending {
                return Err(ReassemblyError::TooManyPending { max: self.max_pending });
            }
        }

        let max_bytes = self.max_transfer_bytes;
        let transfer = self.transfers.entry(key.clone()).or_insert_with(|| Transfer {
            buffer: ChunkBuffer::with_byte_limit(total, max_bytes),
            linked: None,
        });

        if transfer.buffer.total() != total {
            return Err(ReassemblyError::TotalMismatch {
                expected: transfer.buffer.total(),
                actual: total,
            });
        }
        Ok(transfer)
    }

    fn try_complete(&mut self, key: &TransferKey) -> Result<Option<Reassembled>, ReassemblyError> {
        let ready = self
            .transfers
            .get(key)
            .is_some_and(|t| t.linked.is_some() && t.buffer.is_complete());
        if !ready {
            return Ok(None);
        }

        let Some(Transfer { buffer, linked: Some(linked) }) = self.transfers.remove(key) else {
            return Ok(None);
        };
        self.remember_completed(key.clone());
        let Some(blob) = buffer.assemble() else {
            return Ok(None);
        };

        let data = decrypt_attachment(&linked.key, &blob)?;
        Ok(Some(Reassembled {
            file_id: key.1.clone(),
            message_id: linked.message_id,
            name: linked.name,
            mime_type: linked.mime_type,
            data,
        }))
    }

    fn remember_completed(&mut self, key: TransferKey) {
        if !self.completed_set.insert(key.clone()) {
            return;
        }
        self.completed.push_back(key);
        if self.completed.len() > MAX_COMPLETED_TRANSFERS {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_set.remove(&oldest);
            }
        }
    }
}
