//! Central heap (slow path): owns the free-segment manager and the slab
//! index, and mediates arena acquisition, recovery reservation, and slab
//! registration.
//!
//! There is no central lock. Each operation is serialized by the component
//! it touches: the free-segment mutex for carving, the index writer lock
//! for registration. A successful registration happens-before any lookup
//! that returns the slab, courtesy of the index lock.

use parking_lot::Mutex;

use crate::error::Error;
use crate::free_space::FreeSpaceManager;
use crate::slab::Slab;
use crate::slab_index::SlabIndex;
use crate::stat_inc;

pub struct CentralHeap {
    free_space: Mutex<FreeSpaceManager>,
    index: SlabIndex,
}

impl CentralHeap {
    pub fn new(region_len: u64) -> Self {
        Self {
            free_space: Mutex::new(FreeSpaceManager::new(0, region_len)),
            index: SlabIndex::new(),
        }
    }

    /// Carve a fresh arena, build a slab of `class` over it, and register
    /// it in the index. On registration failure the arena goes back to the
    /// free list and the descriptor is destroyed.
    pub fn carve_and_register(&self, class: usize) -> Result<*mut Slab, Error> {
        let offset = self.free_space.lock().acquire_arena()?;
        self.build_and_register(class, offset)
    }

    /// Recovery path: claim the specific arena window at `offset`, then
    /// build and register a slab exactly like the carve path.
    pub fn reserve_and_register(&self, offset: u64, class: usize) -> Result<*mut Slab, Error> {
        self.free_space.lock().reserve_at(offset)?;
        stat_inc!(arena_reserves);
        self.build_and_register(class, offset)
    }

    fn build_and_register(&self, class: usize, offset: u64) -> Result<*mut Slab, Error> {
        let slab = Box::into_raw(Box::new(Slab::new(class, offset)));
        if let Err(e) = self.index.insert(offset, slab) {
            // SAFETY: the slab was just created here and escaped nowhere.
            unsafe { drop(Box::from_raw(slab)) };
            self.free_space.lock().release_arena(offset);
            return Err(e);
        }
        stat_inc!(arena_carves);
        Ok(slab)
    }

    /// Reverse lookup for `free` and recovery. Null when the arena base is
    /// not managed.
    #[inline]
    pub fn lookup(&self, arena_base: u64) -> *mut Slab {
        self.index.lookup(arena_base)
    }

    /// Number of registered arenas.
    pub fn arena_count(&self) -> usize {
        self.index.len()
    }

    /// Destroy every slab descriptor. Called once, at allocator teardown.
    pub(crate) fn reclaim_slabs(&self) {
        for slab in self.index.drain_slabs() {
            // SAFETY: drain_slabs yields each registered slab exactly once,
            // and nothing dereferences slab pointers after teardown begins.
            unsafe { drop(Box::from_raw(slab)) };
        }
    }

    /// Free-segment snapshot for white-box assertions.
    #[cfg(test)]
    pub(crate) fn segments(&self) -> Vec<(u64, u64)> {
        self.free_space.lock().segments()
    }
}
