//! Packet fingerprints and short-window duplicate suppression.

use std::collections::HashSet;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// Fingerprint of an opaque packet: the first 8 bytes of its SHA-256,
/// read big-endian.
pub fn packet_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Bounded membership set of packet fingerprints.
///
/// When the set reaches capacity it is cleared wholesale. The brief
/// re-delivery window this opens is acceptable: the application layer
/// deduplicates again end to end.
#[derive(Debug)]
pub struct Deduplicator {
    seen: Mutex<HashSet<u64>>,
    max_entries: usize,
}

impl Deduplicator {
    pub fn new(max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::with_capacity(max_entries)),
            max_entries,
        }
    }

    /// Atomic check-and-insert.
    ///
    /// Returns true when `hash` was already present. Otherwise records it
    /// and returns false.
    pub fn is_duplicate(&self, hash: u64) -> bool {
        let mut seen = self.seen.lock().expect("dedup lock poisoned");
        if seen.contains(&hash) {
            return true;
        }
        if seen.len() >= self.max_entries {
            seen.clear();
        }
        seen.insert(hash);
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().expect("dedup lock poisoned").len()
    }
}
