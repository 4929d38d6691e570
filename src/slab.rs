//! Slab: metadata for one arena, split into equal-sized blocks.
//!
//! The bitmap is the authoritative record of block occupancy. A small FIFO
//! ring of free block indices sits in front of it so the hot path touches
//! the bitmap only once per `CACHE_BATCH` operations: an empty ring refills
//! by scanning the bitmap for clear bits (setting them as "reserved"), a
//! full ring drains its oldest half back by clearing bits.
//!
//! A bit is set iff the block is either issued to a caller or parked in the
//! ring; `allocated` counts only caller-held blocks.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use log::warn;

use crate::config::{ARENA_SIZE, CACHE_BATCH, CACHE_CAP};
use crate::error::Error;
use crate::size_class;
use crate::sync::SpinMutex;

/// Occupancy bitmap with one bit per block.
///
/// Owned by the slab as a separately allocated buffer; all bit arithmetic
/// stays behind `is_set`/`set`/`clear`.
struct Bitmap {
    words: Box<[u64]>,
    bits: u32,
}

impl Bitmap {
    fn new(bits: u32) -> Self {
        let words = vec![0u64; (bits as usize).div_ceil(64)].into_boxed_slice();
        Self { words, bits }
    }

    #[inline]
    fn is_set(&self, i: u32) -> bool {
        (self.words[i as usize / 64] >> (i % 64)) & 1 != 0
    }

    #[inline]
    fn set(&mut self, i: u32) {
        self.words[i as usize / 64] |= 1u64 << (i % 64);
    }

    #[inline]
    fn clear(&mut self, i: u32) {
        self.words[i as usize / 64] &= !(1u64 << (i % 64));
    }

    /// Lowest clear bit at or above `from`, if any.
    fn find_clear(&self, from: u32) -> Option<u32> {
        let mut word_idx = from as usize / 64;
        let mut mask = !0u64 << (from % 64);
        while word_idx < self.words.len() {
            let candidates = !self.words[word_idx] & mask;
            if candidates != 0 {
                let bit = word_idx as u32 * 64 + candidates.trailing_zeros();
                if bit < self.bits {
                    return Some(bit);
                }
                return None;
            }
            word_idx += 1;
            mask = !0u64;
        }
        None
    }

    #[cfg(test)]
    fn popcount(&self) -> u32 {
        // The tail word past `bits` is never set, so a plain sum is exact.
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// FIFO ring of free block indices. Every index in here has its bitmap bit
/// set ("reserved"): it is neither caller-held nor eligible for refill.
struct FreeIndexRing {
    buf: [u32; CACHE_CAP],
    head: usize,
    len: usize,
}

impl FreeIndexRing {
    const fn new() -> Self {
        Self {
            buf: [0; CACHE_CAP],
            head: 0,
            len: 0,
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.len == CACHE_CAP
    }

    #[inline]
    fn push(&mut self, idx: u32) {
        debug_assert!(!self.is_full());
        self.buf[(self.head + self.len) % CACHE_CAP] = idx;
        self.len += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<u32> {
        if self.len == 0 {
            return None;
        }
        let idx = self.buf[self.head];
        self.head = (self.head + 1) % CACHE_CAP;
        self.len -= 1;
        Some(idx)
    }

    fn contains(&self, idx: u32) -> bool {
        (0..self.len).any(|i| self.buf[(self.head + i) % CACHE_CAP] == idx)
    }

    /// Remove a specific index, preserving FIFO order of the rest.
    /// Used by recovery when a restored block happens to sit in the ring.
    fn remove(&mut self, idx: u32) -> bool {
        for i in 0..self.len {
            if self.buf[(self.head + i) % CACHE_CAP] == idx {
                for j in i..self.len - 1 {
                    self.buf[(self.head + j) % CACHE_CAP] =
                        self.buf[(self.head + j + 1) % CACHE_CAP];
                }
                self.len -= 1;
                return true;
            }
        }
        false
    }
}

/// Bitmap + ring, guarded together by the slab spinlock.
struct SlabState {
    bitmap: Bitmap,
    ring: FreeIndexRing,
}

/// Descriptor managing one arena for one size class.
///
/// Slabs are built when the central heap carves an arena and destroyed only
/// at allocator teardown; empty slabs stay registered and chained.
pub struct Slab {
    /// Base offset of the managed arena within the region.
    arena_offset: u64,
    /// Size class index.
    class: usize,
    /// Fixed block size for this slab.
    block_size: u32,
    /// Blocks in the arena (`ARENA_SIZE / block_size`).
    total_blocks: u32,
    /// Caller-held block count. Relaxed reads back `is_full`/`is_empty` so
    /// shard traversal never takes the slab lock.
    allocated: AtomicU32,
    /// Next slab in the owning shard's per-class chain. Written only by the
    /// shard-owning CPU.
    next_in_chain: AtomicPtr<Slab>,
    state: SpinMutex<SlabState>,
}

// SAFETY: all mutable state is behind the SpinMutex or atomic; the chain
// pointer is only dereferenced while the allocator (which owns every slab)
// is alive.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Build the descriptor for the arena starting at `arena_offset`.
    ///
    /// `arena_offset` must be arena-aligned; `class` must be a valid size
    /// class index. Both are programmer errors, not runtime conditions.
    pub fn new(class: usize, arena_offset: u64) -> Self {
        assert!(class < size_class::SC_COUNT, "invalid size class {}", class);
        assert_eq!(
            arena_offset % ARENA_SIZE as u64,
            0,
            "arena offset {:#x} not arena-aligned",
            arena_offset
        );

        let block_size = size_class::class_to_size(class) as u32;
        let total_blocks = (ARENA_SIZE / block_size as usize) as u32;

        Self {
            arena_offset,
            class,
            block_size,
            total_blocks,
            allocated: AtomicU32::new(0),
            next_in_chain: AtomicPtr::new(core::ptr::null_mut()),
            state: SpinMutex::new(SlabState {
                bitmap: Bitmap::new(total_blocks),
                ring: FreeIndexRing::new(),
            }),
        }
    }

    #[inline]
    pub fn arena_offset(&self) -> u64 {
        self.arena_offset
    }

    #[inline]
    pub fn class(&self) -> usize {
        self.class
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Caller-held block count (relaxed; may be stale).
    #[inline]
    pub fn allocated_count(&self) -> u32 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Lock-free fullness check. A stale answer only costs the caller a
    /// retry after `alloc` reports the slab full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.allocated.load(Ordering::Relaxed) >= self.total_blocks
    }

    /// Lock-free emptiness check.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated.load(Ordering::Relaxed) == 0
    }

    /// Allocate one block. Returns the block index, or `None` when the
    /// arena has no free block left.
    pub fn alloc(&self) -> Option<u32> {
        let mut state = self.state.lock();
        if state.ring.is_empty() {
            Self::refill_ring(&mut state);
        }
        let idx = state.ring.pop()?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(idx)
    }

    /// Return a block to the slab.
    ///
    /// Panics on an out-of-range index (the façade derives indices from the
    /// pointer geometry, so out-of-range means a corrupted caller). A double
    /// free is diagnosed and ignored.
    pub fn free(&self, block_idx: u32) {
        assert!(
            block_idx < self.total_blocks,
            "block index {} out of range for slab with {} blocks",
            block_idx,
            self.total_blocks
        );

        let mut state = self.state.lock();

        // A caller-held block has its bit set and is not in the ring. Any
        // other combination is a double free.
        if !state.bitmap.is_set(block_idx) || state.ring.contains(block_idx) {
            warn!(
                "double free of block {} in arena {:#x}",
                block_idx, self.arena_offset
            );
            return;
        }

        if state.ring.is_full() {
            Self::drain_ring(&mut state);
        }
        state.ring.push(block_idx);

        if self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_err()
        {
            warn!(
                "free on empty slab at arena {:#x}, allocated count stays 0",
                self.arena_offset
            );
        }
    }

    /// Mark a block caller-held, idempotently. Used by recovery replay.
    ///
    /// A block already marked occupied is success; a block parked in the
    /// ring is pulled out so it can never be handed out again.
    pub fn set_occupied(&self, block_idx: u32) -> Result<(), Error> {
        if block_idx >= self.total_blocks {
            return Err(Error::InvalidArgument("block index out of range"));
        }

        let mut state = self.state.lock();
        if state.bitmap.is_set(block_idx) {
            if state.ring.remove(block_idx) {
                self.allocated.fetch_add(1, Ordering::Relaxed);
            }
            // Already caller-held: nothing to do.
        } else {
            state.bitmap.set(block_idx);
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Scan the bitmap for clear bits and park up to `CACHE_BATCH` of them
    /// in the ring, marking each reserved.
    fn refill_ring(state: &mut SlabState) {
        let mut from = 0;
        for _ in 0..CACHE_BATCH {
            match state.bitmap.find_clear(from) {
                Some(idx) => {
                    state.bitmap.set(idx);
                    state.ring.push(idx);
                    from = idx + 1;
                }
                None => break,
            }
        }
    }

    /// Write the oldest ring entries back to the bitmap until only
    /// `CACHE_BATCH` remain, making room for incoming frees.
    fn drain_ring(state: &mut SlabState) {
        while state.ring.len > CACHE_BATCH {
            let idx = state.ring.pop().expect("ring drained below zero");
            state.bitmap.clear(idx);
        }
    }

    #[inline]
    pub(crate) fn next_in_chain(&self) -> *mut Slab {
        self.next_in_chain.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_next_in_chain(&self, next: *mut Slab) {
        self.next_in_chain.store(next, Ordering::Release);
    }

    /// Bookkeeping identity: caller-held + ring-parked == bits set.
    #[cfg(test)]
    pub(crate) fn check_bookkeeping(&self) {
        let state = self.state.lock();
        let cached = state.ring.len as u32;
        assert_eq!(
            self.allocated.load(Ordering::Relaxed) + cached,
            state.bitmap.popcount(),
        );
        for i in 0..state.ring.len {
            let idx = state.ring.buf[(state.ring.head + i) % CACHE_CAP];
            assert!(state.bitmap.is_set(idx), "ring entry {} not reserved", idx);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_count(&self) -> usize {
        self.state.lock().ring.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_slab() -> Slab {
        // Largest class => fewest blocks (512 by default), fastest to exhaust.
        Slab::new(size_class::SC_COUNT - 1, 0)
    }

    #[test]
    fn test_alloc_returns_distinct_indices() {
        let slab = Slab::new(0, 0);
        let a = slab.alloc().unwrap();
        let b = slab.alloc().unwrap();
        let c = slab.alloc().unwrap();
        assert!(a != b && b != c && a != c);
        assert_eq!(slab.allocated_count(), 3);
        slab.check_bookkeeping();
    }

    #[test]
    fn test_alloc_until_full() {
        let slab = small_slab();
        let total = slab.total_blocks();
        for _ in 0..total {
            assert!(slab.alloc().is_some());
        }
        assert!(slab.is_full());
        assert!(slab.alloc().is_none());
        slab.check_bookkeeping();
    }

    #[test]
    fn test_free_makes_room() {
        let slab = small_slab();
        let total = slab.total_blocks();
        let mut held = Vec::new();
        for _ in 0..total {
            held.push(slab.alloc().unwrap());
        }
        assert!(slab.alloc().is_none());

        slab.free(held.pop().unwrap());
        assert!(!slab.is_full());
        assert!(slab.alloc().is_some());
        slab.check_bookkeeping();
    }

    #[test]
    fn test_free_all_empties_slab() {
        let slab = small_slab();
        let held: Vec<u32> = (0..200).map(|_| slab.alloc().unwrap()).collect();
        for idx in held {
            slab.free(idx);
        }
        assert!(slab.is_empty());
        assert_eq!(slab.allocated_count(), 0);
        slab.check_bookkeeping();
    }

    #[test]
    fn test_refill_is_batched() {
        let slab = small_slab();
        slab.alloc().unwrap();
        // One refill parks CACHE_BATCH indices; one was handed out.
        assert_eq!(slab.cached_count(), CACHE_BATCH - 1);
        slab.check_bookkeeping();
    }

    #[test]
    fn test_drain_on_full_ring() {
        let slab = small_slab();
        let held: Vec<u32> = (0..CACHE_CAP as u32 + 8).map(|_| slab.alloc().unwrap()).collect();
        // Free enough to fill the ring past capacity and force a drain.
        for idx in &held {
            slab.free(*idx);
        }
        assert!(slab.cached_count() <= CACHE_CAP);
        assert!(slab.is_empty());
        slab.check_bookkeeping();
    }

    #[test]
    fn test_double_free_ignored() {
        let slab = small_slab();
        let idx = slab.alloc().unwrap();
        slab.free(idx);
        let count_after_first = slab.allocated_count();
        slab.free(idx); // ignored with a diagnostic
        assert_eq!(slab.allocated_count(), count_after_first);
        slab.check_bookkeeping();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_free_out_of_range_panics() {
        let slab = small_slab();
        slab.free(slab.total_blocks());
    }

    #[test]
    fn test_set_occupied_is_idempotent() {
        let slab = small_slab();
        slab.set_occupied(7).unwrap();
        assert_eq!(slab.allocated_count(), 1);
        slab.set_occupied(7).unwrap();
        assert_eq!(slab.allocated_count(), 1);
        slab.check_bookkeeping();
    }

    #[test]
    fn test_set_occupied_out_of_range() {
        let slab = small_slab();
        assert!(slab.set_occupied(slab.total_blocks()).is_err());
    }

    #[test]
    fn test_set_occupied_pulls_from_ring() {
        let slab = small_slab();
        // A single alloc parks CACHE_BATCH - 1 indices in the ring; index 1
        // is one of them (index 0 went to the caller).
        let first = slab.alloc().unwrap();
        assert_eq!(first, 0);
        slab.set_occupied(1).unwrap();
        assert_eq!(slab.allocated_count(), 2);
        // The restored block must never be handed out again.
        for _ in 0..slab.total_blocks() - 2 {
            let idx = slab.alloc().unwrap();
            assert_ne!(idx, 1);
        }
        assert!(slab.alloc().is_none());
        slab.check_bookkeeping();
    }

    #[test]
    fn test_restored_block_can_be_freed() {
        let slab = small_slab();
        slab.set_occupied(3).unwrap();
        slab.free(3);
        assert!(slab.is_empty());
        slab.check_bookkeeping();
    }

    #[test]
    fn test_concurrent_alloc_free() {
        use std::sync::Arc;

        let slab = Arc::new(Slab::new(size_class::SC_COUNT - 1, 0));
        let threads = 4;
        let rounds = 500;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let s = Arc::clone(&slab);
                std::thread::spawn(move || {
                    for _ in 0..rounds {
                        if let Some(idx) = s.alloc() {
                            s.free(idx);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(slab.is_empty());
        slab.check_bookkeeping();
    }
}
