//! Thread-to-CPU mapping.
//!
//! The shard selector wants to know which CPU the current thread runs on.
//! The answer is advisory: the scheduler may migrate the thread before the
//! next instruction, and correctness never depends on it. On Linux we ask
//! the kernel; elsewhere a hash of the thread id spreads threads across
//! shards with the same contract.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// CPU the calling thread is currently scheduled on.
        #[inline]
        pub fn current_cpu_id() -> usize {
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu < 0 { 0 } else { cpu as usize }
        }
    } else {
        /// Stable per-thread shard hint derived from the thread id.
        #[inline]
        pub fn current_cpu_id() -> usize {
            use std::hash::{Hash, Hasher};
            // DefaultHasher::new() is deterministic, so the same thread
            // always lands on the same shard.
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            hasher.finish() as usize
        }
    }
}
