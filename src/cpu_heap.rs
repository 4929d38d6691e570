//! Per-CPU shards: the allocation fast path.
//!
//! Each shard holds one slab chain per size class, linked through the
//! slabs' `next_in_chain` pointers. A slab joins the shard that carved it
//! and stays there for its whole life; remote frees go through the slab
//! index and never touch any shard.
//!
//! Shard chains are mutated only by code running on the owning CPU, so
//! there is no shard lock. The CPU id is advisory (a thread may be
//! migrated between operations), so the heads are atomics: a rare push
//! from a stale CPU id stays memory-safe and at worst duplicates an arena
//! carve. Shards are cache-line-aligned to keep neighboring CPUs from
//! false-sharing the head pointers.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::config::MAX_CPUS;
use crate::size_class::SC_COUNT;
use crate::slab::Slab;

#[repr(align(64))]
struct Shard {
    heads: [AtomicPtr<Slab>; SC_COUNT],
}

impl Shard {
    fn new() -> Self {
        Self {
            heads: core::array::from_fn(|_| AtomicPtr::new(core::ptr::null_mut())),
        }
    }
}

pub struct PerCpuHeap {
    shards: Box<[Shard]>,
}

impl PerCpuHeap {
    pub fn new() -> Self {
        Self {
            shards: (0..MAX_CPUS).map(|_| Shard::new()).collect(),
        }
    }

    /// First slab in the shard's class chain that is not full, observed
    /// through the relaxed occupancy counter. A stale answer costs the
    /// caller one retry, nothing more.
    pub fn find_nonfull(&self, cpu: usize, class: usize) -> *mut Slab {
        let mut slab = self.shards[cpu].heads[class].load(Ordering::Acquire);
        while !slab.is_null() {
            // SAFETY: chained slabs stay alive until allocator teardown.
            unsafe {
                if !(*slab).is_full() {
                    return slab;
                }
                slab = (*slab).next_in_chain();
            }
        }
        core::ptr::null_mut()
    }

    /// Prepend a freshly registered slab to the shard's class chain.
    ///
    /// Only the CPU owning `cpu` may call this; the chain has no lock.
    pub fn push(&self, cpu: usize, class: usize, slab: *mut Slab) {
        let head = &self.shards[cpu].heads[class];
        // SAFETY: `slab` is valid and not yet in any chain.
        unsafe { (*slab).set_next_in_chain(head.load(Ordering::Relaxed)) };
        head.store(slab, Ordering::Release);
    }

    /// Number of slabs currently chained for (`cpu`, `class`).
    #[cfg(test)]
    pub(crate) fn chain_len(&self, cpu: usize, class: usize) -> usize {
        let mut n = 0;
        let mut slab = self.shards[cpu].heads[class].load(Ordering::Acquire);
        while !slab.is_null() {
            n += 1;
            slab = unsafe { (*slab).next_in_chain() };
        }
        n
    }
}

impl Default for PerCpuHeap {
    fn default() -> Self {
        Self::new()
    }
}
