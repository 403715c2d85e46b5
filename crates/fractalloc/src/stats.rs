//! Statistics, state snapshots and the integrity audit.
//!
//! Counters are plain fields updated inline by the allocator — the core is
//! single-threaded by contract, so no atomics are needed. The `State`
//! harness is the leak detector: snapshot the counters, run the workload,
//! snapshot again; any difference that survives garbage collection is a
//! leak, and the dump tells you where it lives.

#![allow(unsafe_code)]
#![cfg(feature = "statistics")]

use serde::Serialize;

use crate::allocator::Allocator;
use crate::chain::Chain;
use crate::error::IntegrityError;
use crate::pool::Pool;

/// A reference count this far above anything sane indicates corruption.
const SUSPICIOUS_REFERENCES: usize = 100_000;

/// Running totals for the whole allocator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    /// Bytes actually reserved from the backend, pool headers included.
    pub bytes_by_backend: usize,
    /// Bytes held by the frontend across all live records.
    pub bytes_by_frontend: usize,
    /// Live records across all pools.
    pub entries: usize,
    /// Pools across all chains.
    pub pools: usize,
    /// Bumped by every `State::assert`; used to date pools in diffs.
    pub step: usize,
    /// Registered type descriptors, reported by the reflection registry.
    #[cfg(feature = "reflection")]
    pub data_definitions: usize,
    /// Registered trait descriptors.
    #[cfg(feature = "reflection")]
    pub trait_definitions: usize,
    /// Registered verb descriptors.
    #[cfg(feature = "reflection")]
    pub verb_definitions: usize,
}

impl Statistics {
    /// Accounts for a pool entering a chain with its first record inside.
    pub(crate) fn add_pool(&mut self, pool: &Pool) {
        self.bytes_by_backend += pool.total_size();
        self.bytes_by_frontend += pool.frontend_bytes();
        self.pools += 1;
        self.entries += 1;
    }

    /// Accounts for an idle pool leaving its chain.
    pub(crate) fn del_pool(&mut self, pool: &Pool) {
        self.bytes_by_backend -= pool.total_size();
        self.pools -= 1;
    }

    /// Reports one more externally registered descriptor.
    #[cfg(feature = "reflection")]
    pub fn note_definition(&mut self, kind: DefinitionKind) {
        match kind {
            DefinitionKind::Data => self.data_definitions += 1,
            DefinitionKind::Trait => self.trait_definitions += 1,
            DefinitionKind::Verb => self.verb_definitions += 1,
        }
    }

    /// Reports one externally dropped descriptor.
    #[cfg(feature = "reflection")]
    pub fn drop_definition(&mut self, kind: DefinitionKind) {
        match kind {
            DefinitionKind::Data => self.data_definitions -= 1,
            DefinitionKind::Trait => self.trait_definitions -= 1,
            DefinitionKind::Verb => self.verb_definitions -= 1,
        }
    }
}

/// Equality is functional: every counter except `step`, which only dates
/// snapshots.
impl PartialEq for Statistics {
    fn eq(&self, other: &Self) -> bool {
        let functional = self.bytes_by_backend == other.bytes_by_backend
            && self.bytes_by_frontend == other.bytes_by_frontend
            && self.entries == other.entries
            && self.pools == other.pools;
        #[cfg(feature = "reflection")]
        let functional = functional
            && self.data_definitions == other.data_definitions
            && self.trait_definitions == other.trait_definitions
            && self.verb_definitions == other.verb_definitions;
        functional
    }
}

impl Eq for Statistics {}

/// Kinds of descriptors an external reflection registry can report.
#[cfg(feature = "reflection")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Data,
    Trait,
    Verb,
}

/// One memory-manager state, held between test sections to detect leaks.
#[derive(Debug, Default)]
pub struct State {
    snapshot: Option<Statistics>,
}

impl State {
    /// Collects garbage, audits integrity, and compares against the
    /// previous snapshot. On any mismatch dumps the pools and the diff and
    /// returns false. Always refreshes the snapshot and bumps the step.
    pub fn assert(&mut self, allocator: &mut Allocator) -> bool {
        allocator.collect_garbage();

        if let Err(error) = allocator.integrity_check() {
            log::error!("memory integrity check failure: {error}");
            return false;
        }

        let mut ok = true;
        if let Some(previous) = &self.snapshot {
            if *previous != allocator.stats {
                allocator.dump_pools();
                allocator.diff(previous);
                log::error!("memory state mismatch");
                ok = false;
            }
        }

        self.snapshot = Some(allocator.stats.clone());
        allocator.stats.step += 1;
        ok
    }
}

/// Serializable summary of one pool, for dumps and external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub backend_bytes: usize,
    pub frontend_bytes: usize,
    pub threshold: usize,
    pub threshold_min: usize,
    pub entries: usize,
    pub valid_entries: usize,
    pub type_name: Option<&'static str>,
}

impl PoolReport {
    fn new(pool: &Pool) -> Self {
        Self {
            backend_bytes: pool.backend_bytes,
            frontend_bytes: pool.frontend_bytes,
            threshold: pool.threshold,
            threshold_min: pool.threshold_min,
            entries: pool.entries,
            valid_entries: pool.valid_entries,
            type_name: pool.meta.map(|m| m.name),
        }
    }
}

impl Allocator {
    /// The running counters.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Full-scan audit: per pool, recount live records and their bytes and
    /// compare against the running `valid_entries`/`frontend_bytes`. The
    /// first divergence is returned; nothing is repaired.
    pub fn integrity_check(&self) -> Result<(), IntegrityError> {
        integrity_check_chain(&self.main_chain)?;
        for chain in &self.size_chains {
            integrity_check_chain(chain)?;
        }
        for meta in &self.type_set {
            integrity_check_chain(&Chain::from_head(meta.0.chain_head()))?;
        }
        Ok(())
    }

    /// Logs every chain, pool by pool, with used/unused slot runs.
    /// The leak hunter's view of the world.
    pub fn dump_pools(&self) {
        log::info!("managed memory pool dump");

        for (id, pool) in self.main_chain.iter().enumerate() {
            // SAFETY: chain members are live pools.
            unsafe { dump_pool("main", id, &*pool) };
        }
        for (bucket, chain) in self.size_chains.iter().enumerate() {
            for (id, pool) in chain.iter().enumerate() {
                // SAFETY: chain members are live pools.
                unsafe { dump_pool(&format!("size {}", 1usize << bucket), id, &*pool) };
            }
        }
        for meta in &self.type_set {
            let chain = Chain::from_head(meta.0.chain_head());
            for (id, pool) in chain.iter().enumerate() {
                // SAFETY: chain members are live pools.
                unsafe { dump_pool(&format!("type `{}`", meta.0.name), id, &*pool) };
            }
        }
    }

    /// Logs the field-by-field difference against an older snapshot,
    /// including every pool created after it was taken.
    pub fn diff(&self, with: &Statistics) {
        log::info!("managed memory diff");
        let stats = &self.stats;

        if stats.bytes_by_backend != with.bytes_by_backend {
            log::info!(
                "backend byte difference: {}",
                stats.bytes_by_backend as isize - with.bytes_by_backend as isize
            );
        }
        if stats.bytes_by_frontend != with.bytes_by_frontend {
            log::info!(
                "frontend byte difference: {}",
                stats.bytes_by_frontend as isize - with.bytes_by_frontend as isize
            );
        }
        if stats.entries != with.entries {
            log::info!(
                "entry difference: {}",
                stats.entries as isize - with.entries as isize
            );
        }

        if stats.pools != with.pools {
            log::info!(
                "pool difference: {}",
                stats.pools as isize - with.pools as isize
            );
            let newer = |pool: *mut Pool| {
                // SAFETY: chain members are live pools.
                unsafe { (*pool).step > with.step }
            };
            for (id, pool) in self.main_chain.iter().enumerate() {
                if newer(pool) {
                    // SAFETY: chain members are live pools.
                    unsafe { dump_pool("main", id, &*pool) };
                }
            }
            for (bucket, chain) in self.size_chains.iter().enumerate() {
                for (id, pool) in chain.iter().enumerate() {
                    if newer(pool) {
                        // SAFETY: chain members are live pools.
                        unsafe { dump_pool(&format!("size {}", 1usize << bucket), id, &*pool) };
                    }
                }
            }
            for meta in &self.type_set {
                let chain = Chain::from_head(meta.0.chain_head());
                for (id, pool) in chain.iter().enumerate() {
                    if newer(pool) {
                        // SAFETY: chain members are live pools.
                        unsafe { dump_pool(&format!("type `{}`", meta.0.name), id, &*pool) };
                    }
                }
            }
        }

        #[cfg(feature = "reflection")]
        {
            if stats.data_definitions != with.data_definitions {
                log::info!(
                    "data definition difference: {}",
                    stats.data_definitions as isize - with.data_definitions as isize
                );
            }
            if stats.trait_definitions != with.trait_definitions {
                log::info!(
                    "trait definition difference: {}",
                    stats.trait_definitions as isize - with.trait_definitions as isize
                );
            }
            if stats.verb_definitions != with.verb_definitions {
                log::info!(
                    "verb definition difference: {}",
                    stats.verb_definitions as isize - with.verb_definitions as isize
                );
            }
        }
    }
}

fn integrity_check_chain(chain: &Chain) -> Result<(), IntegrityError> {
    for pool in chain.iter() {
        // SAFETY: chain members are live pools.
        let pool = unsafe { &*pool };
        if !pool.is_in_use() {
            continue;
        }

        let mut valid_allocations = 0;
        let mut valid_bytes = 0;
        for index in 0..pool.entries {
            let allocation = pool.allocation_from_index(index);
            // SAFETY: indices below `entries` address emplaced records.
            let allocation = unsafe { &*allocation };
            if allocation.uses() != 0 {
                if allocation.uses() > SUSPICIOUS_REFERENCES {
                    log::warn!(
                        "suspicious reference count {} on {:p}",
                        allocation.uses(),
                        allocation
                    );
                }
                valid_allocations += 1;
                valid_bytes += allocation.total_size();
            }
        }

        if valid_allocations != pool.valid_entries {
            let error = IntegrityError::EntryCountMismatch {
                found: valid_allocations,
                registered: pool.valid_entries,
            };
            log::error!("{error}");
            return Err(error);
        }
        if valid_bytes != pool.frontend_bytes {
            let error = IntegrityError::ByteCountMismatch {
                found: valid_bytes,
                registered: pool.frontend_bytes,
            };
            log::error!("{error}");
            return Err(error);
        }
    }
    Ok(())
}

fn dump_pool(chain: &str, id: usize, pool: &Pool) {
    let report = PoolReport::new(pool);
    log::info!(
        "[{chain}] pool #{id} at {:p}: in use/reserved {}/{}, \
         threshold min/current/max {}/{}/{}",
        pool,
        report.frontend_bytes,
        report.backend_bytes,
        report.threshold_min,
        report.threshold,
        report.backend_bytes,
    );
    if let Some(name) = report.type_name {
        log::info!("[{chain}] pool #{id} associated type `{name}`");
    }
    if pool.entries == 0 {
        return;
    }

    // Compress unused slots into runs so big pools stay readable.
    let mut unused_run = 0;
    for index in 0..pool.entries {
        let entry = pool.allocation_from_index(index);
        // SAFETY: indices below `entries` address emplaced records.
        let entry = unsafe { &*entry };
        if entry.uses() == 0 {
            unused_run += 1;
            continue;
        }
        if unused_run > 0 {
            log::info!(
                "[{chain}] pool #{id} slots {}..{}: {unused_run} unused",
                index - unused_run,
                index,
            );
            unused_run = 0;
        }
        log::info!(
            "[{chain}] pool #{id} slot {index}: {:p}, {} bytes, {} references",
            entry,
            entry.allocated_size(),
            entry.uses(),
        );
    }
    if unused_run > 0 {
        log::info!(
            "[{chain}] pool #{id} slots {}..{}: {unused_run} unused",
            pool.entries - unused_run,
            pool.entries,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_track_allocations_and_pools() {
        let mut alloc = Allocator::new();
        assert_eq!(alloc.statistics().pools, 0);

        let entry = alloc.allocate(None, 64).unwrap();
        {
            let stats = alloc.statistics();
            assert_eq!(stats.pools, 1);
            assert_eq!(stats.entries, 1);
            // SAFETY: the record is live.
            assert_eq!(stats.bytes_by_frontend, unsafe {
                entry.as_ref().total_size()
            });
            assert!(stats.bytes_by_backend >= crate::config::DEFAULT_POOL_SIZE);
        }

        alloc.deallocate(entry);
        assert_eq!(alloc.statistics().entries, 0);
        assert_eq!(alloc.statistics().bytes_by_frontend, 0);

        alloc.collect_garbage();
        assert_eq!(alloc.statistics().pools, 0);
        assert_eq!(alloc.statistics().bytes_by_backend, 0);
    }

    #[test]
    fn equality_ignores_the_step() {
        let a = Statistics {
            step: 1,
            ..Statistics::default()
        };
        let b = Statistics {
            step: 7,
            ..Statistics::default()
        };
        assert_eq!(a, b);

        let c = Statistics {
            pools: 1,
            ..Statistics::default()
        };
        assert_ne!(a, c);
    }

    #[test]
    fn integrity_check_passes_on_consistent_state() {
        let mut alloc = Allocator::new();
        let a = alloc.allocate(None, 64).unwrap();
        let b = alloc.allocate(None, 128).unwrap();
        alloc.deallocate(a);

        assert_eq!(alloc.integrity_check(), Ok(()));

        alloc.deallocate(b);
        alloc.collect_garbage();
        assert_eq!(alloc.integrity_check(), Ok(()));
    }

    #[test]
    fn integrity_check_reports_entry_mismatch() {
        let mut alloc = Allocator::new();
        let entry = alloc.allocate(None, 64).unwrap();

        let pool = alloc.main_chain.iter().next().unwrap();
        // SAFETY: corrupting the live pool's counter on purpose.
        unsafe { (*pool).valid_entries = 5 };

        assert_eq!(
            alloc.integrity_check(),
            Err(IntegrityError::EntryCountMismatch {
                found: 1,
                registered: 5
            })
        );

        // SAFETY: restore before the normal teardown path.
        unsafe { (*pool).valid_entries = 1 };
        alloc.deallocate(entry);
        alloc.collect_garbage();
    }

    #[test]
    fn integrity_check_reports_byte_mismatch() {
        let mut alloc = Allocator::new();
        let entry = alloc.allocate(None, 64).unwrap();

        let pool = alloc.main_chain.iter().next().unwrap();
        // SAFETY: corrupting the live pool's counter on purpose.
        let real = unsafe { (*pool).frontend_bytes };
        unsafe { (*pool).frontend_bytes = real + 8 };

        assert_eq!(
            alloc.integrity_check(),
            Err(IntegrityError::ByteCountMismatch {
                found: real,
                registered: real + 8
            })
        );

        // SAFETY: restore before the normal teardown path.
        unsafe { (*pool).frontend_bytes = real };
        alloc.deallocate(entry);
        alloc.collect_garbage();
    }

    #[test]
    fn state_assert_detects_leaks_and_recovers() {
        let mut alloc = Allocator::new();
        let mut state = State::default();

        assert!(state.assert(&mut alloc));
        let step_before = alloc.statistics().step;

        // A surviving allocation is a diff against the clean snapshot.
        let leak = alloc.allocate(None, 64).unwrap();
        assert!(!state.assert(&mut alloc));

        // The snapshot was refreshed to the leaky state, so draining the
        // allocator is one more mismatch before things settle.
        alloc.deallocate(leak);
        assert!(!state.assert(&mut alloc));
        assert!(state.assert(&mut alloc));
        assert!(alloc.statistics().step > step_before);
    }

    #[test]
    fn pool_report_reflects_the_pool() {
        let mut alloc = Allocator::new();
        let entry = alloc.allocate(None, 64).unwrap();

        let pool = alloc.main_chain.iter().next().unwrap();
        // SAFETY: the pool is live.
        let report = PoolReport::new(unsafe { &*pool });
        assert_eq!(report.entries, 1);
        assert_eq!(report.valid_entries, 1);
        assert_eq!(report.backend_bytes, crate::config::DEFAULT_POOL_SIZE);
        assert!(report.type_name.is_none());

        alloc.deallocate(entry);
        alloc.collect_garbage();
    }
}
