//! Process-wide singleton lifecycle.
//!
//! Everything lives in one test function: the singleton is process state,
//! and the test harness runs functions in parallel threads.

use nvmalloc::config::ARENA_SIZE;
use nvmalloc::{Error, destroy, free, init, malloc, restore};

#[test]
fn singleton_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Before init every operation refuses (free just logs).
    assert_eq!(malloc(64), Err(Error::Uninitialized));
    assert_eq!(restore(core::ptr::null_mut(), 64), Err(Error::Uninitialized));
    free(core::ptr::null_mut());

    let mut region = vec![0u8; 4 * ARENA_SIZE];
    unsafe { init(region.as_mut_ptr(), region.len()).unwrap() };

    // Double init fails and leaves the live instance untouched.
    let mut other = vec![0u8; ARENA_SIZE];
    assert_eq!(
        unsafe { init(other.as_mut_ptr(), other.len()) },
        Err(Error::AlreadyInitialized)
    );

    // Plain malloc/free round trip through the globals.
    let p = malloc(100).unwrap();
    let q = malloc(100).unwrap();
    assert_ne!(p, q);
    free(p.as_ptr());
    free(q.as_ptr());

    // Restore replay against the same instance.
    let live = unsafe { region.as_mut_ptr().add(ARENA_SIZE + 256) };
    restore(live, 256).unwrap();
    restore(live, 256).unwrap(); // idempotent
    assert!(matches!(restore(live, 4096), Err(Error::Conflict(_))));

    destroy();
    assert_eq!(malloc(64), Err(Error::Uninitialized));
    destroy(); // no-op when already torn down

    // A fresh init over the same region starts from a clean slate.
    unsafe { init(region.as_mut_ptr(), region.len()).unwrap() };
    let r = malloc(8).unwrap();
    free(r.as_ptr());
    destroy();
}
