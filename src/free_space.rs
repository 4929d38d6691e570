//! Free-segment manager: carves arena-sized extents out of the backing
//! region and takes them back with neighbor coalescing.
//!
//! Segments form a doubly linked list sorted strictly by offset. Offsets and
//! sizes are always non-zero multiples of `ARENA_SIZE`, and two neighboring
//! nodes are never contiguous; a release that would create contiguity
//! merges instead. Recovery can also claim a specific arena window out of
//! the middle of a segment (`reserve_at`).
//!
//! The list is not self-synchronizing; the central heap wraps it in a mutex.

use log::warn;

use crate::config::ARENA_SIZE;
use crate::error::Error;

struct Segment {
    offset: u64,
    size: u64,
    prev: *mut Segment,
    next: *mut Segment,
}

pub struct FreeSpaceManager {
    head: *mut Segment,
    tail: *mut Segment,
}

// SAFETY: nodes are reachable only through this struct and the central heap
// serializes access behind a mutex.
unsafe impl Send for FreeSpaceManager {}

const ARENA: u64 = ARENA_SIZE as u64;

impl FreeSpaceManager {
    /// Track `[start_offset, start_offset + len)`. A trailing remainder
    /// smaller than one arena is unusable and trimmed up front.
    pub fn new(start_offset: u64, len: u64) -> Self {
        let usable = len - len % ARENA;
        let mut mgr = Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
        };
        if usable > 0 {
            let node = Self::new_node(start_offset, usable);
            mgr.head = node;
            mgr.tail = node;
        }
        mgr
    }

    fn new_node(offset: u64, size: u64) -> *mut Segment {
        Box::into_raw(Box::new(Segment {
            offset,
            size,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        }))
    }

    /// Unlink `node` from the list and free it.
    ///
    /// # Safety
    ///
    /// `node` must be a valid pointer to a node currently in this list.
    unsafe fn unlink(&mut self, node: *mut Segment) {
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            drop(Box::from_raw(node));
        }
    }

    /// Link a fresh node between `prev` and `next` (either may be null,
    /// meaning list head / tail).
    ///
    /// # Safety
    ///
    /// `prev` and `next` must be adjacent positions in this list.
    unsafe fn link_between(&mut self, node: *mut Segment, prev: *mut Segment, next: *mut Segment) {
        unsafe {
            (*node).prev = prev;
            (*node).next = next;
            if prev.is_null() {
                self.head = node;
            } else {
                (*prev).next = node;
            }
            if next.is_null() {
                self.tail = node;
            } else {
                (*next).prev = node;
            }
        }
    }

    /// Carve one arena, first-fit over the sorted list.
    pub fn acquire_arena(&mut self) -> Result<u64, Error> {
        let mut node = self.head;
        while !node.is_null() {
            unsafe {
                if (*node).size >= ARENA {
                    let offset = (*node).offset;
                    if (*node).size == ARENA {
                        self.unlink(node);
                    } else {
                        (*node).offset += ARENA;
                        (*node).size -= ARENA;
                    }
                    return Ok(offset);
                }
                node = (*node).next;
            }
        }
        Err(Error::NoSpace)
    }

    /// Return the arena starting at `offset`, merging with whichever
    /// neighbors touch it.
    pub fn release_arena(&mut self, offset: u64) {
        assert_eq!(offset % ARENA, 0, "released offset {:#x} not arena-aligned", offset);

        // Successor: first segment strictly past the released arena.
        let mut succ = self.head;
        while !succ.is_null() && unsafe { (*succ).offset } <= offset {
            succ = unsafe { (*succ).next };
        }
        let pred = if succ.is_null() {
            self.tail
        } else {
            unsafe { (*succ).prev }
        };

        unsafe {
            if !pred.is_null() && (*pred).offset + (*pred).size > offset {
                warn!("release of arena {:#x} overlapping free space, dropped", offset);
                return;
            }

            let merge_left = !pred.is_null() && (*pred).offset + (*pred).size == offset;
            let merge_right = !succ.is_null() && offset + ARENA == (*succ).offset;

            match (merge_left, merge_right) {
                (true, true) => {
                    (*pred).size += ARENA + (*succ).size;
                    self.unlink(succ);
                }
                (true, false) => {
                    (*pred).size += ARENA;
                }
                (false, true) => {
                    (*succ).offset = offset;
                    (*succ).size += ARENA;
                }
                (false, false) => {
                    let node = Self::new_node(offset, ARENA);
                    self.link_between(node, pred, succ);
                }
            }
        }
    }

    /// Claim the specific arena window starting at `offset`, for recovery.
    ///
    /// Fails when the window is not wholly inside one free segment. An
    /// interior window splits its segment in two.
    pub fn reserve_at(&mut self, offset: u64) -> Result<(), Error> {
        assert_eq!(offset % ARENA, 0, "reserved offset {:#x} not arena-aligned", offset);

        let mut node = self.head;
        while !node.is_null() {
            unsafe {
                let seg_start = (*node).offset;
                let seg_end = seg_start + (*node).size;
                if seg_start > offset {
                    break; // sorted: no later segment can contain the window
                }
                if seg_end >= offset + ARENA {
                    let lead = offset - seg_start;
                    let trail = seg_end - (offset + ARENA);
                    match (lead, trail) {
                        (0, 0) => self.unlink(node),
                        (0, _) => {
                            (*node).offset += ARENA;
                            (*node).size -= ARENA;
                        }
                        (_, 0) => {
                            (*node).size -= ARENA;
                        }
                        (_, _) => {
                            (*node).size = lead;
                            let rest = Self::new_node(offset + ARENA, trail);
                            let next = (*node).next;
                            self.link_between(rest, node, next);
                        }
                    }
                    return Ok(());
                }
                node = (*node).next;
            }
        }
        Err(Error::Conflict("arena window not wholly free"))
    }

    /// Snapshot of `(offset, size)` pairs in list order.
    #[cfg(test)]
    pub(crate) fn segments(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut node = self.head;
        while !node.is_null() {
            unsafe {
                out.push(((*node).offset, (*node).size));
                node = (*node).next;
            }
        }
        out
    }

    /// Sortedness, coalescing, and arena-multiple invariants, plus the
    /// back-link consistency of the doubly linked list.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut node = self.head;
        let mut prev: *mut Segment = core::ptr::null_mut();
        while !node.is_null() {
            unsafe {
                assert_eq!((*node).prev, prev);
                assert!((*node).size >= ARENA);
                assert_eq!((*node).offset % ARENA, 0);
                assert_eq!((*node).size % ARENA, 0);
                if !prev.is_null() {
                    let prev_end = (*prev).offset + (*prev).size;
                    assert!(prev_end < (*node).offset, "adjacent segments are contiguous");
                }
                prev = node;
                node = (*node).next;
            }
        }
        assert_eq!(self.tail, prev);
    }
}

impl Drop for FreeSpaceManager {
    fn drop(&mut self) {
        let mut node = self.head;
        while !node.is_null() {
            unsafe {
                let next = (*node).next;
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}
