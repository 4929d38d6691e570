//! Allocator error type.
//!
//! `free` never reports errors; misuse there is diagnosed through `log` and
//! ignored, matching the usual free semantics. Everything else surfaces one
//! of these variants.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Null base, zero-size or oversize request, pointer outside the region.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free segment large enough to carve another arena.
    #[error("backing region exhausted")]
    NoSpace,

    /// Host-memory allocation for allocator metadata failed.
    #[error("host memory exhausted")]
    OutOfHostMemory,

    /// API call before `init` or after `destroy`.
    #[error("allocator not initialized")]
    Uninitialized,

    /// Second `init` without an intervening `destroy`.
    #[error("allocator already initialized")]
    AlreadyInitialized,

    /// Recovery replay disagrees with existing state: size class mismatch,
    /// duplicate registration, or a requested arena window that is not
    /// wholly free.
    #[error("conflict: {0}")]
    Conflict(&'static str),
}
