//! Slab index: maps an arena base offset to its slab descriptor.
//!
//! This is what makes `free` work from any thread: a pointer is masked down
//! to its arena base and looked up here, so the freeing thread never needs
//! to know which shard owns the slab. Recovery uses the same map to decide
//! whether an arena is already materialized.
//!
//! Closed addressing with per-bucket chains. The hash input is the dense
//! arena index (offset / ARENA_SIZE) taken modulo a prime bucket count, so
//! chains stay short for any realistic arena population and the table never
//! resizes. Lookups take the read lock and run in parallel; inserts and
//! removes exclude everything.

use parking_lot::RwLock;

use crate::config::{ARENA_SIZE, INDEX_BUCKETS};
use crate::error::Error;
use crate::slab::Slab;

struct Entry {
    key: u64,
    slab: *mut Slab,
    next: *mut Entry,
}

struct Table {
    buckets: Box<[*mut Entry]>,
    count: usize,
}

// SAFETY: entry nodes are reachable only through the enclosing RwLock; slab
// pointers stay valid until allocator teardown.
unsafe impl Send for Table {}
unsafe impl Sync for Table {}

pub struct SlabIndex {
    table: RwLock<Table>,
}

impl SlabIndex {
    pub fn new() -> Self {
        Self::with_buckets(INDEX_BUCKETS)
    }

    /// Callers expecting an unusually large arena population can raise the
    /// bucket count at construction; there is no resizing later.
    pub fn with_buckets(buckets: usize) -> Self {
        assert!(buckets > 0);
        Self {
            table: RwLock::new(Table {
                buckets: vec![core::ptr::null_mut(); buckets].into_boxed_slice(),
                count: 0,
            }),
        }
    }

    #[inline]
    fn bucket_of(key: u64, buckets: usize) -> usize {
        ((key / ARENA_SIZE as u64) % buckets as u64) as usize
    }

    /// Register a slab under its arena base offset.
    pub fn insert(&self, key: u64, slab: *mut Slab) -> Result<(), Error> {
        let mut table = self.table.write();
        let bucket = Self::bucket_of(key, table.buckets.len());

        let mut node = table.buckets[bucket];
        while !node.is_null() {
            unsafe {
                if (*node).key == key {
                    return Err(Error::Conflict("arena base already registered"));
                }
                node = (*node).next;
            }
        }

        let entry = Box::into_raw(Box::new(Entry {
            key,
            slab,
            next: table.buckets[bucket],
        }));
        table.buckets[bucket] = entry;
        table.count += 1;
        Ok(())
    }

    /// Look up the slab owning `key`. Returns null when the arena is not
    /// registered. The returned pointer is non-owning; it stays valid
    /// because slabs are only destroyed at allocator teardown.
    pub fn lookup(&self, key: u64) -> *mut Slab {
        let table = self.table.read();
        let mut node = table.buckets[Self::bucket_of(key, table.buckets.len())];
        while !node.is_null() {
            unsafe {
                if (*node).key == key {
                    return (*node).slab;
                }
                node = (*node).next;
            }
        }
        core::ptr::null_mut()
    }

    /// Unregister an arena. Returns the slab pointer that was stored, or
    /// null if the key was absent. Only teardown calls this.
    pub fn remove(&self, key: u64) -> *mut Slab {
        let mut table = self.table.write();
        let bucket = Self::bucket_of(key, table.buckets.len());

        let mut link: *mut *mut Entry = &mut table.buckets[bucket];
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                if (*node).key == key {
                    *link = (*node).next;
                    let slab = (*node).slab;
                    drop(Box::from_raw(node));
                    table.count -= 1;
                    return slab;
                }
                link = &mut (*node).next;
            }
        }
        core::ptr::null_mut()
    }

    /// Number of registered arenas.
    pub fn len(&self) -> usize {
        self.table.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the table and hand back every registered slab pointer, so the
    /// allocator can reclaim the descriptors at teardown.
    pub(crate) fn drain_slabs(&self) -> Vec<*mut Slab> {
        let mut table = self.table.write();
        let mut slabs = Vec::with_capacity(table.count);
        for bucket in table.buckets.iter_mut() {
            let mut node = *bucket;
            *bucket = core::ptr::null_mut();
            while !node.is_null() {
                unsafe {
                    let next = (*node).next;
                    slabs.push((*node).slab);
                    drop(Box::from_raw(node));
                    node = next;
                }
            }
        }
        table.count = 0;
        slabs
    }
}

impl Default for SlabIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SlabIndex {
    fn drop(&mut self) {
        // Frees the entry nodes only; slab ownership is handled by the
        // allocator via drain_slabs.
        self.drain_slabs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: u64 = ARENA_SIZE as u64;

    fn make_slab(class: usize, offset: u64) -> *mut Slab {
        Box::into_raw(Box::new(Slab::new(class, offset)))
    }

    fn free_slab(slab: *mut Slab) {
        unsafe { drop(Box::from_raw(slab)) };
    }

    #[test]
    fn test_lookup_empty() {
        let index = SlabIndex::new();
        assert!(index.lookup(0).is_null());
        assert!(index.lookup(7 * ARENA).is_null());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_insert_and_lookup() {
        let index = SlabIndex::new();
        let slab = make_slab(0, ARENA);
        index.insert(ARENA, slab).unwrap();

        assert_eq!(index.lookup(ARENA), slab);
        assert!(index.lookup(0).is_null());
        assert!(index.lookup(2 * ARENA).is_null());
        assert_eq!(index.len(), 1);

        for s in index.drain_slabs() {
            free_slab(s);
        }
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let index = SlabIndex::new();
        let slab = make_slab(0, 0);
        index.insert(0, slab).unwrap();
        assert!(index.insert(0, slab).is_err());
        assert_eq!(index.len(), 1);

        for s in index.drain_slabs() {
            free_slab(s);
        }
    }

    #[test]
    fn test_remove() {
        let index = SlabIndex::new();
        let slab = make_slab(1, 3 * ARENA);
        index.insert(3 * ARENA, slab).unwrap();

        assert_eq!(index.remove(3 * ARENA), slab);
        assert!(index.lookup(3 * ARENA).is_null());
        assert_eq!(index.len(), 0);
        assert!(index.remove(3 * ARENA).is_null());

        free_slab(slab);
    }

    #[test]
    fn test_colliding_keys_chain() {
        // Bucket count 7 forces arena indices 0, 7, 14 into one chain.
        let index = SlabIndex::with_buckets(7);
        let keys = [0, 7 * ARENA, 14 * ARENA];
        let slabs: Vec<_> = keys.iter().map(|&k| make_slab(0, k)).collect();
        for (&key, &slab) in keys.iter().zip(&slabs) {
            index.insert(key, slab).unwrap();
        }

        for (&key, &slab) in keys.iter().zip(&slabs) {
            assert_eq!(index.lookup(key), slab);
        }
        assert_eq!(index.len(), 3);

        // Removing the middle of the chain leaves the others reachable.
        assert_eq!(index.remove(7 * ARENA), slabs[1]);
        assert_eq!(index.lookup(0), slabs[0]);
        assert_eq!(index.lookup(14 * ARENA), slabs[2]);

        free_slab(slabs[1]);
        for s in index.drain_slabs() {
            free_slab(s);
        }
    }

    #[test]
    fn test_parallel_lookups() {
        use std::sync::Arc;

        let index = Arc::new(SlabIndex::new());
        let slabs: Vec<_> = (0..16).map(|i| make_slab(0, i * ARENA)).collect();
        for (i, &slab) in slabs.iter().enumerate() {
            index.insert(i as u64 * ARENA, slab).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let idx = Arc::clone(&index);
                std::thread::spawn(move || {
                    for round in 0..1000u64 {
                        let key = (round % 16) * ARENA;
                        assert!(!idx.lookup(key).is_null());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for s in index.drain_slabs() {
            free_slab(s);
        }
    }
}
