//! Typed errors for the audit and teardown paths.
//!
//! The hot paths report failure in-band (`None` from allocate/reallocate,
//! `None` from find); only the integrity audit and explicit shutdown carry
//! enough structure to deserve error types.

use thiserror::Error;

/// A full-scan audit disagreed with the running counters.
///
/// Returned by [`crate::Allocator::integrity_check`]; the allocator never
/// attempts a repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// Live records found by scanning differ from the registered count.
    #[error("valid entry mismatch: found {found} live entries, but {registered} were registered")]
    EntryCountMismatch { found: usize, registered: usize },

    /// Bytes held by live records differ from the registered frontend total.
    #[error("valid byte usage mismatch: found {found} bytes in use, but {registered} were registered")]
    ByteCountMismatch { found: usize, registered: usize },
}

/// Explicit teardown was requested while allocations are still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// Pools with live records remain after garbage collection.
    #[error("{pools} pool(s) still hold live allocations")]
    PoolsInUse { pools: usize },
}
