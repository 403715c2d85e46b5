//! Fractal pool allocator.
//!
//! A user-space memory manager between a client library and the system's
//! page allocator. Memory is served from power-of-two arenas ("pools")
//! indexed as implicit binary trees: a slot's address and capacity follow
//! from its index and the pool size alone, so any interior pointer maps
//! back to its owning record in O(log n) with no per-allocation tables.
//! Each record carries an embedded reference count.
//!
//! # Architecture
//!
//! - **Index math** (`bitops`): `log2`/`lsb`/next-power-of-two primitives
//! - **Allocation record** (`allocation`): header preceding each client
//!   block; refcount-discriminated link field
//! - **Pool** (`pool`): one arena, the fractal index, the per-pool
//!   allocate/recycle/resize/free policy and the free list of holes
//! - **Pool chain** (`chain`): head-first pool lists, grown at the front
//! - **Allocator** (`allocator`): the façade — tactic-driven chain
//!   dispatch, reverse lookup with a hot-pool cache, garbage collection
//! - **Type metadata** (`meta`): the collaborator contract for an
//!   external reflection registry
//! - **Statistics** (`stats`): counters, leak-detecting state snapshots,
//!   integrity audit and pool dumps (`statistics` feature)
//! - **Global adapter** (`global`): `GlobalAlloc` over the singleton
//!   (`global-alloc` feature)
//!
//! # Contract
//!
//! The core is single-threaded: an [`Allocator`] takes `&mut self` and
//! never blocks. [`Allocator::instance`] wraps the process-wide instance
//! in a mutex for embeddings that need serialization at the entry points.
//! Garbage collection is always explicit — pools are released by
//! [`Allocator::collect_garbage`] and nowhere else.
//!
//! Logging goes through the `log` facade; the sink is the embedder's.

#![deny(unsafe_code)]

pub mod allocation;
pub mod allocator;
pub mod bitops;
mod chain;
pub mod config;
pub mod error;
pub mod global;
pub mod meta;
pub mod pool;
pub mod stats;

pub use allocation::Allocation;
pub use allocator::Allocator;
pub use config::{ALIGNMENT, DEFAULT_POOL_SIZE};
pub use error::{IntegrityError, ShutdownError};
#[cfg(feature = "global-alloc")]
pub use global::Fractalloc;
pub use meta::{PoolTactic, TypeMeta};
pub use pool::Pool;
#[cfg(feature = "statistics")]
pub use stats::{PoolReport, State, Statistics};
#[cfg(all(feature = "statistics", feature = "reflection"))]
pub use stats::DefinitionKind;
