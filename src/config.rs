//! Build-time constants generated from `nvmalloc.toml` by `build.rs`.
//!
//! `ARENA_SIZE` is the unit of carving from the backing region; every slab
//! manages exactly one arena. `CACHE_CAP` is the per-slab free-index ring
//! capacity and `CACHE_BATCH` (half of it) the refill/drain batch.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
