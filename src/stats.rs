//! Allocation statistics counters, populated with `--features stats`.
//!
//! All counters use `Relaxed` ordering: they are observational only and
//! never used for synchronization; the allocator's own locks provide the
//! ordering guarantees. With the feature enabled, obtain a `Snapshot` with
//! `snapshot()`; the individual loads are atomic but the snapshot as a
//! whole is not globally consistent, which is fine for monitoring.
//!
//! Call sites update counters through `stat_inc!` / `stat_add!`, which the
//! hot paths can use freely: both expand to nothing in default builds. The
//! macros live here so the counter set and its updaters stay in one file;
//! only they are compiled when the feature is off.

#[cfg(feature = "stats")]
use core::sync::atomic::{AtomicU64, Ordering};

/// Bump one of the allocation counters by one.
///
/// The whole invocation vanishes unless built with `--features stats`, so
/// it is safe to sprinkle on hot paths.
#[macro_export]
macro_rules! stat_inc {
    ($counter:ident) => {
        #[cfg(feature = "stats")]
        {
            $crate::stats::STATS
                .$counter
                .fetch_add(1, ::core::sync::atomic::Ordering::Relaxed);
        }
    };
}

/// Add an amount to one of the allocation counters.
///
/// Without `--features stats` nothing is emitted, including the amount
/// expression itself, so the argument must be side-effect free.
#[macro_export]
macro_rules! stat_add {
    ($counter:ident, $val:expr) => {
        #[cfg(feature = "stats")]
        {
            $crate::stats::STATS
                .$counter
                .fetch_add($val as u64, ::core::sync::atomic::Ordering::Relaxed);
        }
    };
}

#[cfg(feature = "stats")]
pub(crate) struct Stats {
    // ---- API traffic ----
    /// Calls to malloc that passed argument validation.
    pub malloc_count: AtomicU64,
    /// Calls to free with a non-null pointer.
    pub free_count: AtomicU64,
    /// Successful restore replays.
    pub restore_count: AtomicU64,
    /// Sum of requested byte sizes passed to malloc.
    pub malloc_bytes: AtomicU64,

    // ---- Fast/slow path breakdown ----
    /// Mallocs served by a slab already chained in the shard.
    pub shard_hits: AtomicU64,
    /// Mallocs that had to carve a new arena.
    pub shard_misses: AtomicU64,

    // ---- Central heap ----
    /// Arenas carved from the free list (malloc and restore paths).
    pub arena_carves: AtomicU64,
    /// Arena windows claimed at a fixed offset during recovery.
    pub arena_reserves: AtomicU64,

    // ---- Diagnostics ----
    /// Frees of pointers with no registered arena.
    pub unmanaged_frees: AtomicU64,
}

#[cfg(feature = "stats")]
impl Stats {
    const fn new() -> Self {
        Self {
            malloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            restore_count: AtomicU64::new(0),
            malloc_bytes: AtomicU64::new(0),
            shard_hits: AtomicU64::new(0),
            shard_misses: AtomicU64::new(0),
            arena_carves: AtomicU64::new(0),
            arena_reserves: AtomicU64::new(0),
            unmanaged_frees: AtomicU64::new(0),
        }
    }
}

#[cfg(feature = "stats")]
pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of the allocation counters.
#[cfg(feature = "stats")]
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Calls to malloc that passed argument validation.
    pub malloc_count: u64,
    /// Calls to free with a non-null pointer.
    pub free_count: u64,
    /// Successful restore replays.
    pub restore_count: u64,
    /// Sum of requested byte sizes passed to malloc.
    pub malloc_bytes: u64,
    /// Mallocs served by a slab already chained in the shard.
    pub shard_hits: u64,
    /// Mallocs that had to carve a new arena.
    pub shard_misses: u64,
    /// Arenas carved from the free list.
    pub arena_carves: u64,
    /// Arena windows claimed at a fixed offset during recovery.
    pub arena_reserves: u64,
    /// Frees of pointers with no registered arena.
    pub unmanaged_frees: u64,
}

/// Load all counters with `Relaxed` ordering.
#[cfg(feature = "stats")]
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        malloc_count: s.malloc_count.load(Ordering::Relaxed),
        free_count: s.free_count.load(Ordering::Relaxed),
        restore_count: s.restore_count.load(Ordering::Relaxed),
        malloc_bytes: s.malloc_bytes.load(Ordering::Relaxed),
        shard_hits: s.shard_hits.load(Ordering::Relaxed),
        shard_misses: s.shard_misses.load(Ordering::Relaxed),
        arena_carves: s.arena_carves.load(Ordering::Relaxed),
        arena_reserves: s.arena_reserves.load(Ordering::Relaxed),
        unmanaged_frees: s.unmanaged_frees.load(Ordering::Relaxed),
    }
}
