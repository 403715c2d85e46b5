//! The fractal arena.
//!
//! A pool is one power-of-two region obtained from the system allocator,
//! with the `Pool` header written at the front and the usable range right
//! behind it. The region is treated as an implicit complete binary tree:
//! index 0 is the whole range, indices 1..=2 the halves, 3..=6 the
//! quarters, and so on. A slot's address and capacity are derived from its
//! index and the pool size alone, so any interior pointer maps back to its
//! record in O(log n) with no side tables.
//!
//! Layout of slot addresses: index 0 sits at the arena base; at level `p`
//! (indices `2^p .. 2^(p+1)`) the `j`-th slot sits at `(2j+1) * stride`
//! with `stride = backend / 2^(p+1)`.

#![allow(unsafe_code)]

use core::ptr::{self, NonNull};
use std::alloc::{GlobalAlloc, Layout, System};

use crate::allocation::Allocation;
use crate::bitops::{fast_log2, lsb, roof2};
use crate::config::{align_up, ALIGNMENT};
use crate::meta::TypeMeta;

/// Sentinel for "no slot" results from index validation.
pub(crate) const INVALID_INDEX: usize = usize::MAX;

/// One power-of-two arena and the fractal index over it.
#[repr(C)]
pub struct Pool {
    /// Usable bytes handed out by the backend; a power of two.
    pub(crate) backend_bytes: usize,
    /// Cached `log2(backend_bytes)`.
    pub(crate) backend_log2: usize,
    /// Cached `log2(backend_bytes / 2)`, the root of the level strides.
    pub(crate) backend_lsb: usize,
    /// Sum of `total_size()` over live records; zero means idle.
    pub(crate) frontend_bytes: usize,
    /// High-water slot count: indices `[0, entries)` have been touched.
    pub(crate) entries: usize,
    /// Head of the intrusive free list threading retired records.
    pub(crate) last_freed: *mut Allocation,
    /// Max total size a new record may occupy; halves per tree level.
    pub(crate) threshold: usize,
    /// `threshold` before its last halving.
    pub(crate) threshold_previous: usize,
    /// Smallest record the pool accepts; grows with the largest seen.
    pub(crate) threshold_min: usize,
    /// Start of the usable range.
    pub(crate) memory: *mut u8,
    /// One past the usable range.
    pub(crate) memory_end: *mut u8,
    /// Descriptor the pool was created for; dump/debug only.
    pub(crate) meta: Option<&'static TypeMeta>,
    /// Pointer handed back to the system allocator on release.
    pub(crate) handle: *mut u8,
    /// Next pool in the chain.
    pub(crate) next: *mut Pool,
    /// Count of records with live references.
    #[cfg(feature = "statistics")]
    pub(crate) valid_entries: usize,
    /// Statistics step at the time the pool was created.
    #[cfg(feature = "statistics")]
    pub(crate) step: usize,
}

impl Pool {
    /// Byte size of the pool header, rounded up for alignment.
    pub const fn header_size() -> usize {
        align_up(core::mem::size_of::<Pool>(), ALIGNMENT)
    }

    /// Obtains a fresh arena from the system allocator and constructs the
    /// pool header at its front.
    ///
    /// Returns null when the backend refuses. Goes through [`System`]
    /// directly so the `global-alloc` feature cannot recurse into itself.
    ///
    /// # Safety
    ///
    /// `backend_bytes` must be a power of two able to hold at least one
    /// minimum allocation.
    pub(crate) unsafe fn emplace(meta: Option<&'static TypeMeta>, backend_bytes: usize) -> *mut Pool {
        debug_assert!(backend_bytes.is_power_of_two());
        debug_assert!(backend_bytes >= Allocation::min_allocation());

        let Ok(layout) = Layout::from_size_align(Self::header_size() + backend_bytes, ALIGNMENT)
        else {
            return ptr::null_mut();
        };
        // SAFETY: layout has non-zero size and a power-of-two alignment.
        let base = unsafe { System.alloc(layout) };
        if base.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: `base` spans header + backend bytes and is aligned.
        let memory = unsafe { base.add(Self::header_size()) };
        let memory_end = unsafe { memory.add(backend_bytes) };
        let page = meta.map_or(0, |m| m.allocation_page);
        let pool = base.cast::<Pool>();
        // SAFETY: `base` is aligned to ALIGNMENT and owned by us.
        unsafe {
            pool.write(Pool {
                backend_bytes,
                backend_log2: fast_log2(backend_bytes),
                backend_lsb: lsb(backend_bytes >> 1),
                frontend_bytes: 0,
                entries: 0,
                last_freed: ptr::null_mut(),
                threshold: backend_bytes,
                threshold_previous: backend_bytes,
                threshold_min: roof2(if page != 0 { page } else { Allocation::min_allocation() }),
                memory,
                memory_end,
                meta,
                handle: base,
                next: ptr::null_mut(),
                #[cfg(feature = "statistics")]
                valid_entries: 0,
                #[cfg(feature = "statistics")]
                step: 0,
            });
            (*pool).touch();
        }
        pool
    }

    /// Returns the arena to the system allocator.
    ///
    /// # Safety
    ///
    /// `pool` must come from [`Pool::emplace`] and must not be used again;
    /// every record inside it becomes invalid.
    pub(crate) unsafe fn release(pool: *mut Pool) {
        // SAFETY: the pool header is live until the dealloc below.
        let (handle, backend) = unsafe { ((*pool).handle, (*pool).backend_bytes) };
        let layout = Layout::from_size_align(Self::header_size() + backend, ALIGNMENT)
            .expect("layout was valid at allocation time");
        // SAFETY: `handle` was obtained from `System.alloc` with this layout.
        unsafe { System.dealloc(handle, layout) };
    }

    /// Pre-faults the arena, one write per page. Without this the region
    /// can remain an address-space promise and the first allocations pay
    /// the page-in cost at unpredictable times.
    fn touch(&mut self) {
        let mut it = self.memory;
        while it < self.memory_end {
            // SAFETY: `it` stays inside the freshly allocated, unused arena.
            unsafe { it.write_volatile(0) };
            it = it.wrapping_add(4096);
        }
    }

    /// Usable bytes reserved from the backend.
    pub fn backend_bytes(&self) -> usize {
        self.backend_bytes
    }

    /// Bytes currently held by live records.
    pub fn frontend_bytes(&self) -> usize {
        self.frontend_bytes
    }

    /// Total footprint including the pool header.
    pub fn total_size(&self) -> usize {
        Self::header_size() + self.backend_bytes
    }

    /// Smallest record the pool currently accepts.
    pub fn min_allocation(&self) -> usize {
        self.threshold_min
    }

    /// Slot count if every record were as small as possible.
    pub fn max_entries(&self) -> usize {
        self.backend_bytes / self.threshold_min
    }

    /// High-water count of slots ever touched.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Current maximum size of a new record.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Descriptor the pool was created for, if any.
    pub fn meta(&self) -> Option<&'static TypeMeta> {
        self.meta
    }

    /// Whether at least one record is live.
    pub fn is_in_use(&self) -> bool {
        self.frontend_bytes > 0
    }

    /// Whether a record of `bytes` total footprint fits at the current
    /// level. `bytes` must already include the header and padding.
    pub fn can_contain(&self, bytes: usize) -> bool {
        self.threshold >= self.threshold_min && bytes <= self.threshold
    }

    /// Whether `ptr` lies inside the usable range.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let a = ptr as usize;
        a >= self.memory as usize && a < self.memory_end as usize
    }

    /// Carves or recycles a record of `bytes` usable bytes.
    ///
    /// Returns null when the pool is full at its current level; the caller
    /// moves on along the chain.
    pub(crate) fn allocate(&mut self, bytes: usize) -> *mut Allocation {
        let padded = Allocation::new_allocation_size(bytes);
        if !self.can_contain(padded) {
            return ptr::null_mut();
        }

        let entry;
        if !self.last_freed.is_null() {
            // Recycle the most recently freed slot. Its capacity is at
            // least the current threshold, so the fit check above holds.
            entry = self.last_freed;
            // SAFETY: free-list nodes are retired records inside this pool.
            unsafe {
                self.last_freed = (*entry).next_free();
                Allocation::emplace(
                    entry.cast(),
                    padded - Allocation::header_size(),
                    self as *mut Pool,
                );
            }
        } else {
            // No holes: take the next pristine slot.
            let stride = self.threshold_from_index(self.entries);
            if stride < self.threshold {
                // The carriage crossed into a finer level while the
                // threshold was restored by a trim; re-sync before sizing.
                self.threshold_previous = self.threshold;
                self.threshold = stride;
                if padded > self.threshold {
                    return ptr::null_mut();
                }
            }

            let slot = self.allocation_from_index(self.entries);
            // SAFETY: the slot address is inside the arena and aligned;
            // its level stride covers `padded` bytes.
            unsafe {
                Allocation::emplace(
                    slot.cast(),
                    padded - Allocation::header_size(),
                    self as *mut Pool,
                );
            }
            entry = slot;
            self.entries += 1;

            // Last slot of the level reached: descend one level.
            // SAFETY: slot + threshold never exceeds one past the arena.
            if unsafe { slot.cast::<u8>().add(self.threshold) } >= self.memory_end {
                self.threshold_previous = self.threshold;
                self.threshold >>= 1;
            }
        }

        // A bigger record raises the floor: the pool refuses
        // smaller-than-typical requests from now on.
        if padded > self.threshold_min {
            self.threshold_min = roof2(padded);
        }

        debug_assert!(
            self.frontend_bytes.checked_add(padded).is_some(),
            "frontend byte counter overflow"
        );
        self.frontend_bytes += padded;
        #[cfg(feature = "statistics")]
        {
            self.valid_entries += 1;
        }
        entry
    }

    /// Retires a record. The caller (the allocator façade) has already
    /// verified the release contract (`references == 1`).
    pub(crate) fn deallocate(&mut self, entry: *mut Allocation) {
        // SAFETY: the entry is a live record inside this pool.
        unsafe {
            debug_assert!((*entry).uses() != 0, "removing an invalid entry");
            debug_assert!(self.entries > 0, "bad valid entry count");
            debug_assert!(
                self.frontend_bytes >= (*entry).total_size(),
                "bad frontend allocation size"
            );

            self.frontend_bytes -= (*entry).total_size();

            if self.frontend_bytes == 0 {
                // That was the last live record: reset the whole pool.
                (*entry).retire(ptr::null_mut());
                self.threshold = self.backend_bytes;
                self.threshold_previous = self.backend_bytes;
                self.threshold_min = Allocation::min_allocation();
                self.last_freed = ptr::null_mut();
                self.entries = 0;
                #[cfg(feature = "statistics")]
                {
                    self.valid_entries = 0;
                }
            } else {
                // Push onto the free list; the link field switches from
                // owning-pool to next-free as the references hit zero.
                (*entry).retire(self.last_freed);
                self.last_freed = entry;
                #[cfg(feature = "statistics")]
                {
                    self.valid_entries -= 1;
                }
            }
        }
    }

    /// Resizes a record in place. Never moves data.
    ///
    /// Shrinking always succeeds. Growing succeeds only while the new
    /// total stays within the current threshold; on `false` the caller
    /// allocates elsewhere and the record is untouched.
    pub(crate) fn reallocate(&mut self, entry: *mut Allocation, bytes: usize) -> bool {
        // SAFETY: the entry is a live record inside this pool.
        unsafe {
            debug_assert!(bytes != 0, "invalid reallocation");
            debug_assert!((*entry).uses() != 0, "reallocating an unused entry");
            debug_assert!(self.contains(entry.cast::<u8>()), "entry outside pool");

            let allocated = (*entry).allocated_size();
            if bytes > allocated {
                let addition = bytes - allocated;
                let new_total = (*entry).total_size() + addition;
                if new_total > self.threshold {
                    return false;
                }
                if new_total > self.threshold_min {
                    self.threshold_min = roof2(new_total);
                }
                self.frontend_bytes += addition;
            } else {
                let removal = allocated - bytes;
                debug_assert!(
                    self.frontend_bytes >= removal,
                    "bad frontend allocation size"
                );
                self.frontend_bytes -= removal;
            }
            (*entry).resize(bytes);
        }
        true
    }

    /// Drops trailing unused slots, re-threads the free list over the
    /// remaining holes in ascending order, and raises the threshold back
    /// to the level of the deepest surviving slot.
    pub(crate) fn trim(&mut self) {
        debug_assert!(self.entries > 0, "should have at least one entry");

        let mut last_live = self.entries - 1;
        loop {
            let entry = self.allocation_from_index(last_live);
            // SAFETY: indices below `entries` were all emplaced once.
            if unsafe { (*entry).uses() } != 0 || last_live == 0 {
                break;
            }
            last_live -= 1;
        }
        self.entries = last_live + 1;

        self.last_freed = ptr::null_mut();
        let mut tail: *mut Allocation = ptr::null_mut();
        for index in 0..self.entries {
            let entry = self.allocation_from_index(index);
            // SAFETY: indices below `entries` were all emplaced once.
            unsafe {
                if (*entry).uses() != 0 {
                    continue;
                }
                if tail.is_null() {
                    self.last_freed = entry;
                } else {
                    (*tail).set_next_free(entry);
                }
            }
            tail = entry;
        }
        if !tail.is_null() {
            // SAFETY: `tail` is a retired record re-threaded above.
            unsafe { (*tail).set_next_free(ptr::null_mut()) };
        }

        self.threshold = self.threshold_from_index(self.entries - 1);
        self.threshold_previous = if self.threshold != self.backend_bytes {
            self.threshold << 1
        } else {
            self.threshold
        };
    }

    /// Capacity of the slot at `index`: the whole arena for the root, the
    /// level stride everywhere else.
    pub(crate) fn threshold_from_index(&self, index: usize) -> usize {
        if index == 0 {
            self.backend_bytes
        } else {
            1 << (self.backend_lsb - fast_log2(index))
        }
    }

    /// Address of the slot at `index`, from index arithmetic alone.
    pub(crate) fn allocation_from_index(&self, index: usize) -> *mut Allocation {
        if index == 0 {
            return self.memory.cast();
        }
        let base_power = fast_log2(index);
        let baseless = index - (1 << base_power);
        let level_index = (baseless << 1) + 1;
        let level_size = 1 << (self.backend_lsb - base_power);
        // SAFETY: every slot of every level lies inside the arena.
        unsafe { self.memory.add(level_index * level_size).cast() }
    }

    /// Deepest slot index whose range covers `ptr`, unconstrained by use.
    pub(crate) fn index_from_address(&self, ptr: *const u8) -> usize {
        debug_assert!(self.contains(ptr), "entry outside pool");

        let i = ptr as usize - self.memory as usize;
        // Offsets below the threshold can only belong to the root slot:
        // every existing non-root slot sits at or above the stride of the
        // deepest level, which the threshold tracks.
        if i < self.threshold || self.entries == 0 {
            return 0;
        }

        let lowest = i & i.wrapping_neg();
        let mut index = ((self.backend_bytes + i) / lowest - 1) >> 1;
        while index >= self.entries {
            index = Self::up_index(index);
        }
        index
    }

    /// Climbs from `index` to the slot that actually holds a live record,
    /// or [`INVALID_INDEX`] when the path ends at an unused root.
    pub(crate) fn validate_index(&self, index: usize) -> usize {
        if self.entries == 0 {
            return INVALID_INDEX;
        }

        let mut index = index;
        // SAFETY: every probed index is below `entries`, hence emplaced.
        unsafe {
            while index != 0
                && (index >= self.entries || (*self.allocation_from_index(index)).uses() == 0)
            {
                index = Self::up_index(index);
            }
            if index == 0 && (*self.allocation_from_index(0)).uses() == 0 {
                return INVALID_INDEX;
            }
        }
        index
    }

    /// Parent-level index above `index` in the implicit tree.
    pub(crate) fn up_index(index: usize) -> usize {
        index >> (lsb(index) + 1)
    }

    /// Record whose slot covers `ptr`, or null when every slot on the
    /// climb path is unused. The result is not yet range-checked against
    /// the record's own block.
    pub(crate) fn allocation_from_address(&self, ptr: *const u8) -> *mut Allocation {
        let index = self.validate_index(self.index_from_address(ptr));
        if index == INVALID_INDEX {
            ptr::null_mut()
        } else {
            self.allocation_from_index(index)
        }
    }

    /// Reverse lookup: the live record owning `ptr`, if any.
    ///
    /// A slot can hold a record smaller than the slot's range; a pointer
    /// past the record's block is not ours even though the slot matched.
    pub(crate) fn find(&self, ptr: *const u8) -> Option<NonNull<Allocation>> {
        if !self.contains(ptr) {
            return None;
        }
        let entry = self.allocation_from_address(ptr);
        if entry.is_null() {
            return None;
        }
        // SAFETY: `entry` addresses an emplaced record inside this pool.
        if unsafe { (*entry).contains(ptr) } {
            NonNull::new(entry)
        } else {
            None
        }
    }
}
