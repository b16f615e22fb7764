//! Bounded cache of message keys for indices that arrived out of order.

use std::collections::{HashMap, VecDeque};

use crate::chain::MessageKey;

/// Cache key: the sender's ratchet public key and the message index.
type SlotId = ([u8; 32], u32);

/// FIFO-evicting store of skipped message keys.
///
/// A key is removed the moment it is used, so a replayed message cannot be
/// decrypted twice.
#[derive(Clone, Debug)]
pub(crate) struct SkippedKeys {
    keys: HashMap<SlotId, MessageKey>,
    order: VecDeque<SlotId>,
    capacity: usize,
}

impl SkippedKeys {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { keys: HashMap::new(), order: VecDeque::new(), capacity }
    }

    pub(crate) fn insert(&mut self, dh: [u8; 32], key: MessageKey) {
        let slot = (dh, key.index());
        if self.keys.insert(slot, key).is_none() {
            self.order.push_back(slot);
        }

        while self.keys.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
        }
    }

    pub(crate) fn get(&self, dh: &[u8; 32], index: u32) -> Option<&MessageKey> {
        self.keys.get(&(*dh, index))
    }

    pub(crate) fn take(&mut self, dh: &[u8; 32], index: u32) -> Option<MessageKey> {
        let slot = (*dh, index);
        let key = self.keys.remove(&slot)?;
        self.order.retain(|s| *s != slot);
        Some(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainKey;

    fn keys(n: u32) -> Vec<MessageKey> {
        let mut chain = ChainKey::from_bytes([3u8; 32]);
        let mut out = Vec::new();
        for i in 0..n {
            let (next, key) = chain.step(i);
            out.push(key);
            chain = next;
        }
        out
    }

    #[test]
    fn take_consumes_key() {
        let mut cache = SkippedKeys::new(8);
        for key in keys(3) {
            cache.insert([1; 32], key);
        }

        assert!(cache.take(&[1; 32], 1).is_some());
        assert!(cache.take(&[1; 32], 1).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut cache = SkippedKeys::new(2);
        for key in keys(3) {
            cache.insert([1; 32], key);
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&[1; 32], 0).is_none());
        assert!(cache.get(&[1; 32], 2).is_some());
    }

    #[test]
    fn slots_are_scoped_by_ratchet_key() {
        let mut cache = SkippedKeys::new(8);
        for key in keys(1) {
            cache.insert([1; 32], key);
        }

        assert!(cache.get(&[2; 32], 0).is_none());
        assert!(cache.get(&[1; 32], 0).is_some());
    }
}
