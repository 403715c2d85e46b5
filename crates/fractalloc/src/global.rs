//! `GlobalAlloc` adapter.
//!
//! Routes the Rust heap through the process-wide allocator singleton, the
//! equivalent of the original's global `new`/`delete` override. Pool
//! backing memory always goes straight to [`std::alloc::System`], so the
//! adapter never recurses into itself for arenas.
//!
//! Registering this as `#[global_allocator]` makes *every* heap
//! allocation — including the allocator's own bookkeeping containers —
//! pass through the singleton's mutex. That is only safe in embeddings
//! where no allocation happens while the singleton is already locked on
//! the same thread; prefer calling the trait methods through an embedding
//! shim unless the whole process is single-threaded and under your
//! control.

#![cfg(feature = "global-alloc")]
#![allow(unsafe_code)]

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::allocation::Allocation;
use crate::allocator::Allocator;
use crate::config::ALIGNMENT;

/// Zero-sized handle implementing [`GlobalAlloc`] over the singleton.
pub struct Fractalloc;

/// Recovers the record header from a client pointer the adapter returned.
///
/// # Safety
///
/// `ptr` must be a block start previously produced by this adapter and
/// still live.
unsafe fn record_of(ptr: *mut u8) -> ptr::NonNull<Allocation> {
    // SAFETY: the header sits exactly one header size before the block.
    let record = unsafe { ptr.sub(Allocation::header_size()) }.cast::<Allocation>();
    // SAFETY: adapter-produced blocks always have a header.
    unsafe { ptr::NonNull::new_unchecked(record) }
}

// SAFETY: the adapter upholds the `GlobalAlloc` contract: blocks live
// until deallocated, are never aliased between allocations, and layouts
// with alignment beyond the crate-wide ALIGNMENT are refused with null.
unsafe impl GlobalAlloc for Fractalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let bytes = layout.size().max(1);
        match Allocator::instance().lock().allocate(None, bytes) {
            // SAFETY: the record was just allocated and is live.
            Some(entry) => unsafe { entry.as_ref().block_start() },
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` came from `alloc`/`realloc` per the trait contract.
        let entry = unsafe { record_of(ptr) };
        Allocator::instance().lock().deallocate(entry);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT || new_size == 0 {
            return ptr::null_mut();
        }
        // SAFETY: `ptr` came from `alloc`/`realloc` per the trait contract.
        let entry = unsafe { record_of(ptr) };

        let mut allocator = Allocator::instance().lock();
        // SAFETY: the record is live until deallocated below.
        let old_size = unsafe { entry.as_ref().allocated_size() };
        if new_size == old_size {
            return ptr;
        }

        let Some(moved) = allocator.reallocate(new_size, entry) else {
            return ptr::null_mut();
        };
        if moved == entry {
            return ptr;
        }

        // Relocated: the adapter is the one place that copies and frees.
        // SAFETY: both blocks are live and do not overlap (different
        // records); the copy stays within the smaller of the two.
        unsafe {
            let target = moved.as_ref().block_start();
            ptr::copy_nonoverlapping(ptr, target, old_size.min(new_size));
            allocator.deallocate(entry);
            target
        }
    }
}
