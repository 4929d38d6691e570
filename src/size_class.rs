//! Size class table and lookup functions.
//!
//! Block sizes are powers of two declared in `nvmalloc.toml` (8 bytes up to
//! 4 KiB by default). A request is served by the smallest class whose block
//! size covers it; anything above the largest class is rejected, since this
//! allocator has no large-object path.

use crate::config::ARENA_SIZE;

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Map an allocation size to its size class index.
///
/// Returns `None` for `size == 0` and for sizes above the largest class.
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    // SC_COUNT is tiny (10 by default); a linear scan beats a lookup table
    // for tables this small and stays correct for any configured class set.
    SIZE_CLASSES.iter().position(|&block| block >= size)
}

/// Block size served by a size class.
#[inline]
pub fn class_to_size(class: usize) -> usize {
    SIZE_CLASSES[class]
}

/// Number of blocks a slab of this class carves out of one arena.
#[inline]
pub fn blocks_per_arena(class: usize) -> usize {
    ARENA_SIZE / SIZE_CLASSES[class]
}

/// Largest request the slab layer accepts.
#[inline]
pub fn max_size() -> usize {
    SIZE_CLASSES[SC_COUNT - 1]
}
