//! The allocator façade.
//!
//! One `Allocator` multiplexes pools into chains: an untyped main chain,
//! one chain per `log2(size)` bucket for the `Size` tactic, and one chain
//! per descriptor for the `Type` tactic (headed inside the descriptor
//! itself). All four primitives — allocate, reallocate, deallocate and
//! reverse lookup — route through here.
//!
//! The core is single-threaded by contract: methods take `&mut self` and
//! never block. The process-wide singleton wraps one instance in a
//! `parking_lot::Mutex`, which is exactly the coarse-grained serialization
//! a multi-threaded embedding needs; the pools themselves stay lock-free.

#![allow(unsafe_code)]

use core::ptr::{self, NonNull};
use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::allocation::Allocation;
use crate::bitops::{fast_log2, roof2};
use crate::chain::Chain;
use crate::config::DEFAULT_POOL_SIZE;
use crate::error::ShutdownError;
use crate::meta::{MetaPtr, PoolTactic, TypeMeta};
use crate::pool::Pool;

/// Number of size-bucketed chains: one per possible `log2(type_size)`.
pub(crate) const SIZE_BUCKETS: usize = usize::BITS as usize;

/// Process-wide memory manager: chains of fractal pools plus the
/// bookkeeping to route, look up and reclaim them.
pub struct Allocator {
    /// Untyped default chain.
    pub(crate) main_chain: Chain,
    /// Chains for types routed by `PoolTactic::Size`.
    pub(crate) size_chains: [Chain; SIZE_BUCKETS],
    /// Descriptors that currently own at least one pool. Held by pointer:
    /// identity is the descriptor's address, never its fields.
    pub(crate) type_set: HashSet<MetaPtr>,
    /// Most recent reverse-lookup hit; consulted first on the next one.
    pub(crate) last_found_pool: *mut Pool,
    /// Running counters for audits and leak detection.
    #[cfg(feature = "statistics")]
    pub(crate) stats: crate::stats::Statistics,
}

// SAFETY: the raw pool pointers inside are owned exclusively by this
// allocator; handing an instance to another thread moves that ownership
// wholesale. The singleton serializes all access behind its mutex.
unsafe impl Send for Allocator {}

static INSTANCE: OnceLock<Mutex<Allocator>> = OnceLock::new();

impl Allocator {
    /// An allocator with no pools.
    pub fn new() -> Self {
        Self {
            main_chain: Chain::EMPTY,
            size_chains: [Chain::EMPTY; SIZE_BUCKETS],
            type_set: HashSet::new(),
            last_found_pool: ptr::null_mut(),
            #[cfg(feature = "statistics")]
            stats: crate::stats::Statistics::default(),
        }
    }

    /// The process-wide instance, initialized on first use and never
    /// destroyed. Call [`Allocator::collect_garbage`] at shutdown to
    /// return outstanding pools to the system.
    pub fn instance() -> &'static Mutex<Allocator> {
        INSTANCE.get_or_init(|| Mutex::new(Allocator::new()))
    }

    /// Allocates `bytes` usable bytes, routed by the optional hint.
    ///
    /// Walks the hinted chain head-first; on exhaustion obtains one fresh
    /// pool sized `max(DEFAULT_POOL_SIZE, roof2(header + bytes))`, links it
    /// at the chain head and serves from it. Returns `None` only when the
    /// backend refuses that pool — and then nothing has been linked.
    ///
    /// The returned record starts with one reference; no constructors run
    /// on the client block.
    pub fn allocate(
        &mut self,
        hint: Option<&'static TypeMeta>,
        bytes: usize,
    ) -> Option<NonNull<Allocation>> {
        debug_assert!(bytes != 0, "zero allocation is not allowed");

        let chain = match hint {
            Some(meta) => match meta.tactic {
                PoolTactic::Size => self.size_chains[size_bucket(meta)],
                PoolTactic::Type => Chain::from_head(meta.chain_head()),
                PoolTactic::Main => self.main_chain,
            },
            None => self.main_chain,
        };

        let entry = chain.allocate(bytes);
        if !entry.is_null() {
            log::trace!("new allocation {:p} of {} bytes", entry, bytes);
            #[cfg(feature = "statistics")]
            {
                // SAFETY: the entry was just produced by a live pool.
                self.stats.entries += 1;
                self.stats.bytes_by_frontend += unsafe { (*entry).total_size() };
            }
            return NonNull::new(entry);
        }

        // The chain cannot contain the memory: grow it at the front.
        let pool = self.allocate_pool(hint, Allocation::new_allocation_size(bytes))?;
        // SAFETY: `pool` is live and sized to fit `bytes` by construction.
        let entry = unsafe { (*pool).allocate(bytes) };
        if entry.is_null() {
            // Nothing is linked unless the allocation inside succeeded.
            // SAFETY: the pool is unreachable from any chain.
            unsafe { Pool::release(pool) };
            return None;
        }

        // SAFETY: `pool` is live until linked below.
        log::debug!("new pool {:p} of {} bytes", pool, unsafe {
            (*pool).backend_bytes()
        });
        log::trace!("new allocation {:p} of {} bytes", entry, bytes);

        match hint {
            Some(meta) => match meta.tactic {
                PoolTactic::Size => {
                    self.size_chains[size_bucket(meta)].push_front(pool);
                }
                PoolTactic::Type => {
                    let mut chain = Chain::from_head(meta.chain_head());
                    chain.push_front(pool);
                    meta.set_chain_head(chain.head);
                    self.type_set.insert(MetaPtr(meta));
                }
                PoolTactic::Main => self.main_chain.push_front(pool),
            },
            None => self.main_chain.push_front(pool),
        }

        #[cfg(feature = "statistics")]
        {
            // SAFETY: the pool was linked above and stays live.
            unsafe { self.stats.add_pool(&*pool) };
        }
        NonNull::new(entry)
    }

    /// Resizes a record, preferring in place.
    ///
    /// When the new total would cross the owning pool's threshold, a
    /// record is allocated elsewhere (hinted by the pool's descriptor)
    /// and returned instead; the old record is neither copied from nor
    /// released — that is the caller's move.
    pub fn reallocate(
        &mut self,
        bytes: usize,
        entry: NonNull<Allocation>,
    ) -> Option<NonNull<Allocation>> {
        let record = entry.as_ptr();
        // SAFETY: the caller passes a live record under our jurisdiction.
        unsafe {
            debug_assert!(bytes != 0, "zero reallocation is not allowed");
            debug_assert!((*record).uses() != 0, "reallocating an unused allocation");
            debug_assert!(
                bytes != (*record).allocated_size(),
                "reallocation to the same size"
            );

            #[cfg(feature = "statistics")]
            let old_total = (*record).total_size();

            let pool = (*record).pool();
            if (*pool).reallocate(record, bytes) {
                #[cfg(feature = "statistics")]
                {
                    self.stats.bytes_by_frontend -= old_total;
                    self.stats.bytes_by_frontend += (*record).total_size();
                }
                log::trace!("allocation {:p} resized to {} bytes in place", record, bytes);
                return Some(entry);
            }

            self.allocate((*pool).meta(), bytes)
        }
    }

    /// Releases a record holding exactly one reference.
    ///
    /// Shared holders drop their references on the record itself and only
    /// the last one calls this. No destructors run on the client block.
    pub fn deallocate(&mut self, entry: NonNull<Allocation>) {
        let record = entry.as_ptr();
        // SAFETY: the caller passes a live record under our jurisdiction.
        unsafe {
            debug_assert!(
                (*record).allocated_size() != 0,
                "deallocating an empty allocation"
            );
            debug_assert!(
                (*record).uses() == 1,
                "deallocating an allocation used from multiple places"
            );

            log::trace!(
                "allocation {:p} of {} bytes deallocated",
                record,
                (*record).allocated_size()
            );
            #[cfg(feature = "statistics")]
            {
                self.stats.bytes_by_frontend -= (*record).total_size();
                self.stats.entries -= 1;
            }

            let pool = (*record).pool();
            (*pool).deallocate(record);
        }
    }

    /// Reverse lookup: the live record containing `ptr`, across every
    /// chain.
    ///
    /// The hinted tactic's native chain is searched first; the fall-through
    /// order covers pointers to members of records routed differently. The
    /// most recent hit pool is consulted before anything else.
    pub fn find(
        &mut self,
        hint: Option<&'static TypeMeta>,
        ptr: *const u8,
    ) -> Option<NonNull<Allocation>> {
        debug_assert!(!ptr.is_null(), "null pointer lookup");

        if !self.last_found_pool.is_null() {
            // SAFETY: the cache is cleared before any pool is released.
            if let Some(found) = unsafe { (*self.last_found_pool).find(ptr) } {
                return Some(found);
            }
        }

        match hint {
            Some(meta) if meta.tactic == PoolTactic::Size => {
                let bucket = size_bucket(meta);
                self.find_in(self.size_chains[bucket], ptr)
                    .or_else(|| self.find_in(self.main_chain, ptr))
                    .or_else(|| self.find_in_types(None, ptr))
                    .or_else(|| self.find_in_sizes(Some(bucket), ptr))
            }
            Some(meta) if meta.tactic == PoolTactic::Type => self
                .find_in(Chain::from_head(meta.chain_head()), ptr)
                .or_else(|| self.find_in(self.main_chain, ptr))
                .or_else(|| self.find_in_sizes(None, ptr))
                .or_else(|| self.find_in_types(Some(meta), ptr)),
            _ => self
                .find_in(self.main_chain, ptr)
                .or_else(|| self.find_in_sizes(None, ptr))
                .or_else(|| self.find_in_types(None, ptr)),
        }
    }

    /// Whether `ptr` lies inside any pool's range — ours, even if the
    /// covering slot is currently free. Same routing as [`find`].
    ///
    /// [`find`]: Allocator::find
    pub fn check_authority(&mut self, hint: Option<&'static TypeMeta>, ptr: *const u8) -> bool {
        debug_assert!(!ptr.is_null(), "null pointer provided");

        if !self.last_found_pool.is_null() {
            // SAFETY: the cache is cleared before any pool is released.
            if unsafe { (*self.last_found_pool).find(ptr) }.is_some() {
                return true;
            }
        }

        match hint {
            Some(meta) if meta.tactic == PoolTactic::Size => {
                let bucket = size_bucket(meta);
                self.size_chains[bucket].contains(ptr)
                    || self.main_chain.contains(ptr)
                    || self.types_contain(None, ptr)
                    || self.sizes_contain(Some(bucket), ptr)
            }
            Some(meta) if meta.tactic == PoolTactic::Type => {
                Chain::from_head(meta.chain_head()).contains(ptr)
                    || self.main_chain.contains(ptr)
                    || self.sizes_contain(None, ptr)
                    || self.types_contain(Some(meta), ptr)
            }
            _ => {
                self.main_chain.contains(ptr)
                    || self.sizes_contain(None, ptr)
                    || self.types_contain(None, ptr)
            }
        }
    }

    /// Frees every idle pool and trims the rest. Never automatic: pools
    /// die here and nowhere else. Chains are visited in a fixed order —
    /// main, every size bucket, every typed chain; a typed chain that
    /// empties drops its descriptor from the working set.
    pub fn collect_garbage(&mut self) {
        self.last_found_pool = ptr::null_mut();

        #[cfg(feature = "statistics")]
        let stats = &mut self.stats;
        #[cfg(feature = "statistics")]
        let mut on_release = |pool: *mut Pool| {
            // SAFETY: observed right before release, header still readable.
            unsafe { stats.del_pool(&*pool) };
        };
        #[cfg(not(feature = "statistics"))]
        let mut on_release = |_pool: *mut Pool| {};

        self.main_chain.collect_garbage(&mut on_release);
        for chain in self.size_chains.iter_mut() {
            chain.collect_garbage(&mut on_release);
        }
        self.type_set.retain(|meta| {
            let mut chain = Chain::from_head(meta.0.chain_head());
            chain.collect_garbage(&mut on_release);
            meta.0.set_chain_head(chain.head);
            !chain.is_empty()
        });
    }

    /// Counts pools owned by types from the given library boundary.
    ///
    /// Shared-library unloaders call this after [`collect_garbage`] to
    /// learn whether a module's memory is fully drained.
    ///
    /// [`collect_garbage`]: Allocator::collect_garbage
    #[cfg(feature = "reflection")]
    pub fn check_boundary(&self, boundary: &str) -> usize {
        self.type_set
            .iter()
            .filter(|meta| meta.0.library == boundary)
            .map(|meta| Chain::from_head(meta.0.chain_head()).iter().count())
            .sum()
    }

    /// Explicit teardown for embeddings that require one: collects
    /// garbage, then refuses if any pool still holds live records.
    pub fn shutdown(&mut self) -> Result<(), ShutdownError> {
        self.collect_garbage();

        let pools = self.main_chain.iter().count()
            + self
                .size_chains
                .iter()
                .map(|chain| chain.iter().count())
                .sum::<usize>()
            + self
                .type_set
                .iter()
                .map(|meta| Chain::from_head(meta.0.chain_head()).iter().count())
                .sum::<usize>();
        if pools != 0 {
            return Err(ShutdownError::PoolsInUse { pools });
        }
        Ok(())
    }

    /// Obtains one pool from the backend, sized at least the default and
    /// rounded to a power of two. Not yet linked anywhere.
    fn allocate_pool(
        &mut self,
        meta: Option<&'static TypeMeta>,
        size: usize,
    ) -> Option<*mut Pool> {
        let backend = roof2(size).max(DEFAULT_POOL_SIZE);
        // SAFETY: `backend` is a power of two above the minimum record.
        let pool = unsafe { Pool::emplace(meta, backend) };
        if pool.is_null() {
            log::warn!("backend refused a pool of {backend} bytes");
            return None;
        }
        #[cfg(feature = "statistics")]
        {
            // SAFETY: `pool` was just created and is exclusively ours.
            unsafe { (*pool).step = self.stats.step };
        }
        Some(pool)
    }

    fn find_in(&mut self, chain: Chain, ptr: *const u8) -> Option<NonNull<Allocation>> {
        let (found, pool) = chain.find(ptr)?;
        self.last_found_pool = pool;
        Some(found)
    }

    fn find_in_sizes(&mut self, skip: Option<usize>, ptr: *const u8) -> Option<NonNull<Allocation>> {
        for bucket in 0..SIZE_BUCKETS {
            if Some(bucket) == skip {
                continue;
            }
            let chain = self.size_chains[bucket];
            if let Some(found) = self.find_in(chain, ptr) {
                return Some(found);
            }
        }
        None
    }

    fn find_in_types(
        &mut self,
        skip: Option<&'static TypeMeta>,
        ptr: *const u8,
    ) -> Option<NonNull<Allocation>> {
        let mut hit = None;
        for meta in &self.type_set {
            if skip.is_some_and(|s| ptr::eq(s, meta.0)) {
                continue;
            }
            if let Some(found) = Chain::from_head(meta.0.chain_head()).find(ptr) {
                hit = Some(found);
                break;
            }
        }
        let (found, pool) = hit?;
        self.last_found_pool = pool;
        Some(found)
    }

    fn sizes_contain(&self, skip: Option<usize>, ptr: *const u8) -> bool {
        (0..SIZE_BUCKETS)
            .filter(|bucket| Some(*bucket) != skip)
            .any(|bucket| self.size_chains[bucket].contains(ptr))
    }

    fn types_contain(&self, skip: Option<&'static TypeMeta>, ptr: *const u8) -> bool {
        self.type_set
            .iter()
            .filter(|meta| !skip.is_some_and(|s| ptr::eq(s, meta.0)))
            .any(|meta| Chain::from_head(meta.0.chain_head()).contains(ptr))
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

fn size_bucket(meta: &TypeMeta) -> usize {
    debug_assert!(meta.size != 0, "sized tactic requires a positive size");
    fast_log2(meta.size)
}
