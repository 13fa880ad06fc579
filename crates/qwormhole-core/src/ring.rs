//! Ring-buffered slot pool backing the batch framer (component B).

use bytes::{Bytes, BytesMut};

/// Default number of slots in a framer's ring buffer.
pub const DEFAULT_RING_SLOTS: usize = 128;

/// Default initial capacity of each ring slot, in bytes.
pub const DEFAULT_SLOT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Slot {
    buf: BytesMut,
    in_use: bool,
}

/// Where an encoded frame's bytes live.
///
/// Transient buffers exist so `encode` never blocks when every ring slot is
/// busy; they never occupy a slot index and are simply dropped when the
/// batch's write completes. This keeps the "every slot busy" fallback path
/// structurally distinct from real slot indices, rather than overloading a
/// sentinel index to mean "not actually a slot".
#[derive(Debug, Clone)]
pub enum SlotRef {
    /// Bytes live in ring slot `usize`, valid until the owning batch
    /// releases it.
    Ring(usize),
    /// Bytes live in a one-off heap allocation outside the ring.
    Transient(Bytes),
}

/// A fixed-capacity pool of reusable byte buffers.
///
/// Slots grow on demand (to fit an oversized payload) and are never shrunk.
/// A slot marked in-use is owned by exactly one in-flight [`super::framer::OutboundBatch`]
/// at a time.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Slot>,
}

impl RingBuffer {
    /// Construct a ring with `num_slots` slots, each starting at
    /// `initial_capacity` bytes.
    #[must_use]
    pub fn new(num_slots: usize, initial_capacity: usize) -> Self {
        let slots = (0..num_slots)
            .map(|_| Slot { buf: BytesMut::with_capacity(initial_capacity), in_use: false })
            .collect();
        Self { slots }
    }

    /// Number of slots in the ring (fixed for the ring's lifetime).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently marked in-use.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Acquire a free slot, growing it if it is smaller than `needed`.
    /// Returns `None` if every slot is currently in use; the caller should
    /// fall back to a transient heap buffer.
    pub fn acquire(&mut self, needed: usize) -> Option<usize> {
        let idx = self.slots.iter().position(|s| !s.in_use)?;
        let slot = &mut self.slots[idx];
        if slot.buf.capacity() < needed {
            slot.buf.reserve(needed - slot.buf.capacity());
        }
        slot.in_use = true;
        Some(idx)
    }

    /// Overwrite a slot's contents.
    pub fn write(&mut self, idx: usize, bytes: &[u8]) {
        let slot = &mut self.slots[idx];
        slot.buf.clear();
        slot.buf.extend_from_slice(bytes);
    }

    /// Borrow a slot's current contents.
    #[must_use]
    pub fn slot_bytes(&self, idx: usize) -> &[u8] {
        &self.slots[idx].buf
    }

    /// Release a slot back to the free pool.
    pub fn release(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.buf.clear();
        slot.in_use = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_marks_in_use_and_release_frees() {
        let mut ring = RingBuffer::new(2, 16);
        let a = ring.acquire(8).unwrap();
        assert_eq!(ring.in_use_count(), 1);
        ring.release(a);
        assert_eq!(ring.in_use_count(), 0);
    }

    #[test]
    fn acquire_returns_none_when_all_busy() {
        let mut ring = RingBuffer::new(1, 16);
        let a = ring.acquire(8).unwrap();
        assert!(ring.acquire(8).is_none());
        ring.release(a);
        assert!(ring.acquire(8).is_some());
    }

    #[test]
    fn slot_grows_for_oversized_payload() {
        let mut ring = RingBuffer::new(1, 4);
        let idx = ring.acquire(100).unwrap();
        ring.write(idx, &vec![1u8; 100]);
        assert_eq!(ring.slot_bytes(idx).len(), 100);
    }

    #[test]
    fn write_overwrites_previous_contents() {
        let mut ring = RingBuffer::new(1, 16);
        let idx = ring.acquire(4).unwrap();
        ring.write(idx, b"abcd");
        ring.write(idx, b"ef");
        assert_eq!(ring.slot_bytes(idx), b"ef");
    }
}
