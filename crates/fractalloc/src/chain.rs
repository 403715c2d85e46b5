//! Pool chains.
//!
//! A chain is a null-terminated singly-linked list of pools sharing one
//! routing discipline. Allocation walks head to tail and the first pool
//! that serves the request wins; fresh pools are linked at the head on the
//! assumption that the newest pool is the most active one. The same walk
//! shape serves reverse lookup, authority checks and garbage collection,
//! so all three chain kinds (main, size-bucketed, typed) share this module.

#![allow(unsafe_code)]

use core::ptr::{self, NonNull};

use crate::allocation::Allocation;
use crate::pool::Pool;

/// Head of one pool chain.
#[derive(Clone, Copy)]
pub(crate) struct Chain {
    pub(crate) head: *mut Pool,
}

impl Chain {
    pub(crate) const EMPTY: Chain = Chain {
        head: ptr::null_mut(),
    };

    /// Wraps a chain head stored elsewhere (a type descriptor's slot).
    pub(crate) fn from_head(head: *mut Pool) -> Self {
        Chain { head }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Links a pool at the front of the chain.
    pub(crate) fn push_front(&mut self, pool: *mut Pool) {
        // SAFETY: `pool` is a live pool owned by the allocator.
        unsafe { (*pool).next = self.head };
        self.head = pool;
    }

    /// Walks the chain asking each pool to serve `bytes`; first hit wins.
    pub(crate) fn allocate(&self, bytes: usize) -> *mut Allocation {
        let mut pool = self.head;
        while !pool.is_null() {
            // SAFETY: chain members are live pools owned by the allocator.
            unsafe {
                let entry = (*pool).allocate(bytes);
                if !entry.is_null() {
                    return entry;
                }
                pool = (*pool).next;
            }
        }
        ptr::null_mut()
    }

    /// Reverse lookup along the chain. On a hit also returns the pool, so
    /// the caller can refresh its hot-pool cache.
    pub(crate) fn find(&self, ptr: *const u8) -> Option<(NonNull<Allocation>, *mut Pool)> {
        let mut pool = self.head;
        while !pool.is_null() {
            // SAFETY: chain members are live pools owned by the allocator.
            unsafe {
                if let Some(found) = (*pool).find(ptr) {
                    return Some((found, pool));
                }
                pool = (*pool).next;
            }
        }
        None
    }

    /// Whether any pool's range covers `ptr`, used or not.
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let mut pool = self.head;
        while !pool.is_null() {
            // SAFETY: chain members are live pools owned by the allocator.
            unsafe {
                if (*pool).contains(ptr) {
                    return true;
                }
                pool = (*pool).next;
            }
        }
        false
    }

    /// Frees idle pools and trims the rest in place.
    ///
    /// Leading idle pools are released and the head advances; interior idle
    /// pools are unlinked. `on_release` observes every pool about to go,
    /// while its header is still readable.
    pub(crate) fn collect_garbage(&mut self, mut on_release: impl FnMut(*mut Pool)) {
        // SAFETY: chain members are live pools owned by the allocator;
        // released pools are unlinked before `Pool::release` invalidates them.
        unsafe {
            while !self.head.is_null() {
                let pool = self.head;
                if (*pool).is_in_use() {
                    (*pool).trim();
                    break;
                }
                let next = (*pool).next;
                log::debug!(
                    "pool {:p} of {} bytes released",
                    pool,
                    (*pool).backend_bytes()
                );
                on_release(pool);
                Pool::release(pool);
                self.head = next;
            }

            if self.head.is_null() {
                return;
            }

            let mut prev = self.head;
            let mut pool = (*prev).next;
            while !pool.is_null() {
                if (*pool).is_in_use() {
                    (*pool).trim();
                    prev = pool;
                    pool = (*pool).next;
                    continue;
                }
                let next = (*pool).next;
                log::debug!(
                    "pool {:p} of {} bytes released",
                    pool,
                    (*pool).backend_bytes()
                );
                on_release(pool);
                Pool::release(pool);
                (*prev).next = next;
                pool = next;
            }
        }
    }

    /// Releases every pool in the chain, in use or not.
    pub(crate) fn free_all(&mut self, mut on_release: impl FnMut(*mut Pool)) {
        // SAFETY: chain members are live pools owned by the allocator.
        unsafe {
            let mut pool = self.head;
            while !pool.is_null() {
                let next = (*pool).next;
                on_release(pool);
                Pool::release(pool);
                pool = next;
            }
        }
        self.head = ptr::null_mut();
    }

    /// Iterates the chain's pools front to back.
    pub(crate) fn iter(&self) -> ChainIter {
        ChainIter { next: self.head }
    }
}

pub(crate) struct ChainIter {
    next: *mut Pool,
}

impl Iterator for ChainIter {
    type Item = *mut Pool;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        let pool = self.next;
        // SAFETY: chain members are live pools owned by the allocator.
        self.next = unsafe { (*pool).next };
        Some(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_POOL_SIZE;

    fn new_pool() -> *mut Pool {
        // SAFETY: default pool size is a valid power of two.
        let pool = unsafe { Pool::emplace(None, DEFAULT_POOL_SIZE) };
        assert!(!pool.is_null());
        pool
    }

    #[test]
    fn push_front_orders_newest_first() {
        let mut chain = Chain::EMPTY;
        let a = new_pool();
        let b = new_pool();
        chain.push_front(a);
        chain.push_front(b);

        let order: Vec<_> = chain.iter().collect();
        assert_eq!(order, vec![b, a]);

        chain.free_all(|_| {});
        assert!(chain.is_empty());
    }

    #[test]
    fn allocate_walks_head_first() {
        let mut chain = Chain::EMPTY;
        chain.push_front(new_pool());
        chain.push_front(new_pool());

        let entry = chain.allocate(64);
        assert!(!entry.is_null());
        // SAFETY: the entry was just produced by the head pool.
        unsafe {
            assert_eq!((*entry).pool(), chain.head);
        }
        chain.free_all(|_| {});
    }

    #[test]
    fn collect_garbage_frees_idle_and_trims_live() {
        let mut chain = Chain::EMPTY;
        let idle = new_pool();
        let live = new_pool();
        chain.push_front(live);
        chain.push_front(idle); // head: idle, then live

        // SAFETY: `live` is a chain member.
        let entry = unsafe { (*live).allocate(64) };
        assert!(!entry.is_null());

        let mut released = 0;
        chain.collect_garbage(|_| released += 1);

        assert_eq!(released, 1);
        assert_eq!(chain.head, live);
        // SAFETY: `live` survived collection.
        unsafe { assert!((*live).next.is_null()) };

        chain.free_all(|_| {});
    }

    #[test]
    fn find_and_contains_cover_all_members() {
        let mut chain = Chain::EMPTY;
        let far = new_pool();
        let near = new_pool();
        chain.push_front(far);
        chain.push_front(near);

        // SAFETY: `far` is a chain member.
        let entry = unsafe { (*far).allocate(64) };
        // SAFETY: the entry was just allocated in `far`.
        let start = unsafe { (*entry).block_start() };

        let (found, hit_pool) = chain.find(start).expect("entry must be found");
        assert_eq!(found.as_ptr(), entry);
        assert_eq!(hit_pool, far);
        assert!(chain.contains(start));
        assert!(!chain.contains(core::ptr::null()));

        chain.free_all(|_| {});
    }
}
