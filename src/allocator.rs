//! Allocator façade: size-class mapping, per-CPU fast path, slow-path
//! orchestration, reverse lookup on free, and recovery replay.
//!
//! [`NvmAllocator`] is explicit state over a caller-provided region, so
//! tests can build and tear down instances freely. The process-wide
//! singleton entry points ([`init`], [`destroy`], [`malloc`], [`free`],
//! [`restore`]) route through a single atomic instance slot.
//!
//! Pointers exist only at this boundary: internally everything is a `u64`
//! offset relative to the region base, and the `base + offset` conversion
//! happens in exactly one place per direction.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use log::warn;

use crate::central::CentralHeap;
use crate::config::{ARENA_SIZE, MAX_CPUS};
use crate::cpu_heap::PerCpuHeap;
use crate::error::Error;
use crate::platform;
use crate::size_class;
use crate::{stat_add, stat_inc};

/// Slab allocator over a contiguous byte-addressable region.
///
/// The allocator only keeps bookkeeping in host memory; it never reads or
/// writes the managed region itself. Blocks above the largest size class
/// are not supported; there is no large-object path.
pub struct NvmAllocator {
    base: *mut u8,
    len: usize,
    central: CentralHeap,
    cpu_heaps: PerCpuHeap,
}

// SAFETY: `base` is only used for address arithmetic under the region
// contract given to `new`; all mutable state is internally synchronized
// (slab spinlocks, free-space mutex, index rwlock, shard atomics).
unsafe impl Send for NvmAllocator {}
unsafe impl Sync for NvmAllocator {}

impl NvmAllocator {
    /// Take over the region `[base, base + len)`.
    ///
    /// # Safety
    ///
    /// `base` must point to a region of at least `len` bytes that stays
    /// valid for the allocator's lifetime and is not handed to anything
    /// else; pointers returned by [`malloc`](Self::malloc) alias into it.
    pub unsafe fn new(base: *mut u8, len: usize) -> Result<Self, Error> {
        if base.is_null() {
            return Err(Error::InvalidArgument("null region base"));
        }
        if len < ARENA_SIZE {
            return Err(Error::InvalidArgument("region smaller than one arena"));
        }
        Ok(Self {
            base,
            len,
            central: CentralHeap::new(len as u64),
            cpu_heaps: PerCpuHeap::new(),
        })
    }

    /// Allocate a block of at least `size` bytes.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-size request"));
        }
        let class = size_class::size_to_class(size)
            .ok_or(Error::InvalidArgument("request above largest size class"))?;

        stat_inc!(malloc_count);
        stat_add!(malloc_bytes, size);

        let cpu = platform::current_cpu_id() % MAX_CPUS;
        loop {
            let mut slab = self.cpu_heaps.find_nonfull(cpu, class);
            if slab.is_null() {
                stat_inc!(shard_misses);
                slab = self.central.carve_and_register(class)?;
                self.cpu_heaps.push(cpu, class, slab);
            } else {
                stat_inc!(shard_hits);
            }

            // SAFETY: slabs live until allocator teardown.
            let slab = unsafe { &*slab };
            if let Some(block_idx) = slab.alloc() {
                let offset = slab.arena_offset() + block_idx as u64 * slab.block_size() as u64;
                // SAFETY: offset < len by construction; base + offset stays
                // inside the region handed to `new`.
                let ptr = unsafe { self.base.add(offset as usize) };
                return Ok(unsafe { NonNull::new_unchecked(ptr) });
            }
            // The fullness observer is relaxed: another thread can fill the
            // slab between our check and the alloc. Walk the shard again.
        }
    }

    /// Return a block. Null is a no-op; a pointer that does not resolve to
    /// a managed arena is diagnosed and ignored.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        stat_inc!(free_count);

        let Some(offset) = self.offset_of(ptr) else {
            stat_inc!(unmanaged_frees);
            warn!("free of pointer {:p} outside the managed region", ptr);
            return;
        };
        let arena_base = offset & !(ARENA_SIZE as u64 - 1);

        let slab = self.central.lookup(arena_base);
        if slab.is_null() {
            stat_inc!(unmanaged_frees);
            warn!("free of pointer {:p} with no registered arena", ptr);
            return;
        }

        // SAFETY: index entries stay valid until teardown.
        let slab = unsafe { &*slab };
        let block_idx = ((offset - arena_base) / slab.block_size() as u64) as u32;
        slab.free(block_idx);
    }

    /// Replay one live object after a restart: re-materialize the arena's
    /// slab if needed and mark the block occupied. Idempotent.
    pub fn restore(&self, ptr: *mut u8, size: usize) -> Result<(), Error> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null pointer"));
        }
        if size == 0 {
            return Err(Error::InvalidArgument("zero-size object"));
        }
        let class = size_class::size_to_class(size)
            .ok_or(Error::InvalidArgument("size above largest size class"))?;
        let offset = self
            .offset_of(ptr)
            .ok_or(Error::InvalidArgument("pointer outside the managed region"))?;
        let arena_base = offset & !(ARENA_SIZE as u64 - 1);

        let mut slab = self.central.lookup(arena_base);
        if slab.is_null() {
            slab = self.central.reserve_and_register(arena_base, class)?;
            // Recovery runs before any CPU has touched the heap; shard 0
            // adopts every re-materialized slab.
            self.cpu_heaps.push(0, class, slab);
        } else if unsafe { (*slab).class() } != class {
            return Err(Error::Conflict("size class mismatch with existing slab"));
        }

        // SAFETY: slab is registered, hence alive until teardown.
        let slab = unsafe { &*slab };
        let block_idx = ((offset - arena_base) / slab.block_size() as u64) as u32;
        slab.set_occupied(block_idx)?;
        stat_inc!(restore_count);
        Ok(())
    }

    /// Offset of `ptr` relative to the region base, if it is inside.
    #[inline]
    fn offset_of(&self, ptr: *mut u8) -> Option<u64> {
        let addr = ptr as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.len {
            return None;
        }
        Some((addr - base) as u64)
    }

    #[cfg(test)]
    pub(crate) fn central(&self) -> &CentralHeap {
        &self.central
    }

    /// Slab owning `ptr`, for white-box assertions.
    #[cfg(test)]
    pub(crate) fn slab_of(&self, ptr: *mut u8) -> *mut crate::slab::Slab {
        let offset = self.offset_of(ptr).expect("pointer outside region");
        self.central.lookup(offset & !(ARENA_SIZE as u64 - 1))
    }
}

impl Drop for NvmAllocator {
    fn drop(&mut self) {
        self.central.reclaim_slabs();
    }
}

// ---------------------------------------------------------------------------
// Process-wide singleton
// ---------------------------------------------------------------------------

static INSTANCE: AtomicPtr<NvmAllocator> = AtomicPtr::new(core::ptr::null_mut());

#[inline]
fn instance() -> Result<&'static NvmAllocator, Error> {
    let heap = INSTANCE.load(Ordering::Acquire);
    if heap.is_null() {
        return Err(Error::Uninitialized);
    }
    // SAFETY: the instance is only dropped by `destroy`, whose contract
    // requires all other allocator calls to have quiesced.
    Ok(unsafe { &*heap })
}

/// Initialize the process-wide allocator over `[base, base + len)`.
///
/// Fails with [`Error::AlreadyInitialized`] if an instance is live.
///
/// # Safety
///
/// Same region contract as [`NvmAllocator::new`].
pub unsafe fn init(base: *mut u8, len: usize) -> Result<(), Error> {
    let heap = Box::into_raw(Box::new(unsafe { NvmAllocator::new(base, len) }?));
    match INSTANCE.compare_exchange(
        core::ptr::null_mut(),
        heap,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Ok(()),
        Err(_) => {
            // Lost the race (or double init): discard the fresh instance.
            unsafe { drop(Box::from_raw(heap)) };
            Err(Error::AlreadyInitialized)
        }
    }
}

/// Tear down the process-wide allocator, freeing all host-side metadata.
/// A no-op when uninitialized. Callers must ensure no allocator operation
/// is still in flight.
pub fn destroy() {
    let heap = INSTANCE.swap(core::ptr::null_mut(), Ordering::AcqRel);
    if !heap.is_null() {
        // SAFETY: the slot was swapped to null, so no new caller can reach
        // the instance; in-flight quiescence is the caller's contract.
        unsafe { drop(Box::from_raw(heap)) };
    }
}

/// Allocate from the process-wide allocator. See [`NvmAllocator::malloc`].
pub fn malloc(size: usize) -> Result<NonNull<u8>, Error> {
    instance()?.malloc(size)
}

/// Free into the process-wide allocator. See [`NvmAllocator::free`].
pub fn free(ptr: *mut u8) {
    match instance() {
        Ok(heap) => heap.free(ptr),
        Err(_) => warn!("free called before init, pointer {:p} dropped", ptr),
    }
}

/// Replay a live object into the process-wide allocator. See
/// [`NvmAllocator::restore`].
pub fn restore(ptr: *mut u8, size: usize) -> Result<(), Error> {
    instance()?.restore(ptr, size)
}
