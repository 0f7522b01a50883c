//! Store-and-forward ring buffer.
//!
//! Holds owned copies of the most recent packets so that a newly joining
//! client can be caught up at registration time.

use std::sync::Mutex;

use bytes::Bytes;

/// Fixed-capacity FIFO of recent packets.
///
/// At capacity the oldest entry is overwritten. Entries are immutable
/// copies; callers never receive a mutable view of buffered data.
#[derive(Debug)]
pub struct PacketBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Bytes>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: vec![Bytes::new(); capacity],
                capacity,
                head: 0,
                len: 0,
            }),
        }
    }

    /// Store an owned copy of `packet` at the write head.
    pub fn push(&self, packet: &[u8]) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        if inner.capacity == 0 {
            return;
        }
        let head = inner.head;
        inner.slots[head] = Bytes::copy_from_slice(packet);
        inner.head = (head + 1) % inner.capacity;
        inner.len = (inner.len + 1).min(inner.capacity);
    }

    /// Snapshot of the stored packets, oldest first.
    pub fn snapshot(&self) -> Vec<Bytes> {
        let inner = self.inner.lock().expect("buffer lock poisoned");
        let mut out = Vec::with_capacity(inner.len);
        // Oldest entry sits at head when full, at slot 0 otherwise.
        let start = if inner.len == inner.capacity {
            inner.head
        } else {
            0
        };
        for i in 0..inner.len {
            out.push(inner.slots[(start + i) % inner.capacity].clone());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer lock poisoned").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(buffer: &PacketBuffer) -> Vec<Vec<u8>> {
        buffer.snapshot().iter().map(|b| b.to_vec()).collect()
    }

    #[test]
    fn empty_buffer_has_no_entries() {
        let buffer = PacketBuffer::new(3);
        assert!(buffer.is_empty());
        assert!(buffer.snapshot().is_empty());
    }

    #[test]
    fn partial_fill_preserves_insertion_order() {
        let buffer = PacketBuffer::new(3);
        buffer.push(b"a");
        buffer.push(b"b");
        assert_eq!(contents(&buffer), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn overwrite_drops_oldest_first() {
        let buffer = PacketBuffer::new(3);
        for p in [b"a", b"b", b"c", b"d"] {
            buffer.push(p);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(
            contents(&buffer),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn len_caps_at_capacity() {
        let buffer = PacketBuffer::new(2);
        for _ in 0..10 {
            buffer.push(b"x");
        }
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let buffer = PacketBuffer::new(2);
        buffer.push(b"a");
        let first = buffer.snapshot();
        buffer.push(b"b");
        buffer.push(b"c");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref(), b"a");
    }

    #[test]
    fn zero_capacity_buffer_stays_empty() {
        let buffer = PacketBuffer::new(0);
        buffer.push(b"a");
        assert!(buffer.is_empty());
    }
}
