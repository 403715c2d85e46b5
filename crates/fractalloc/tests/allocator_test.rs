//! End-to-end allocator scenarios, driven through the public surface only.

use core::ptr::NonNull;

use fractalloc::{
    Allocation, Allocator, PoolTactic, TypeMeta, ALIGNMENT, DEFAULT_POOL_SIZE,
};

fn record_size(bytes: usize) -> usize {
    Allocation::new_allocation_size(bytes)
}

#[test]
fn single_allocation_without_hint() {
    let mut alloc = Allocator::new();
    let entry = alloc.allocate(None, 64).expect("allocation must succeed");

    // SAFETY: the record is live until deallocated below.
    unsafe {
        let record = entry.as_ref();
        assert_eq!(record.uses(), 1);
        assert_eq!(record.allocated_size(), 64);
        assert_eq!(record.block_start() as usize % ALIGNMENT, 0);
        assert_eq!(
            record.block_end() as usize,
            record.block_start() as usize + 64
        );
        for i in 0..64 {
            assert!(record.contains(record.block_start().add(i)));
        }
        assert!(!record.contains(record.block_start().add(64)));
    }

    #[cfg(feature = "statistics")]
    {
        let stats = alloc.statistics();
        assert_eq!(stats.pools, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes_by_frontend, record_size(64));
        assert!(stats.bytes_by_backend > DEFAULT_POOL_SIZE);
    }

    alloc.deallocate(entry);
    alloc.collect_garbage();
    #[cfg(feature = "statistics")]
    assert_eq!(alloc.statistics().pools, 0);
}

#[test]
fn freeing_every_other_record_keeps_the_rest_findable() {
    let mut alloc = Allocator::new();
    let entries: Vec<_> = (0..10)
        .map(|_| alloc.allocate(None, 64).expect("allocation must succeed"))
        .collect();

    for entry in entries.iter().step_by(2) {
        alloc.deallocate(*entry);
    }
    alloc.collect_garbage();

    for (index, entry) in entries.iter().enumerate() {
        // SAFETY: block geometry stays readable on retired records too.
        let start = unsafe { entry.as_ref().block_start() };
        if index % 2 == 0 {
            assert_eq!(alloc.find(None, start), None);
        } else {
            assert_eq!(alloc.find(None, start), Some(*entry));
        }
    }

    #[cfg(feature = "statistics")]
    assert_eq!(alloc.statistics().bytes_by_frontend, 5 * record_size(64));

    for entry in entries.iter().skip(1).step_by(2) {
        alloc.deallocate(*entry);
    }
    alloc.collect_garbage();
}

#[test]
fn sized_hint_finds_interior_pointers() {
    static SIZED: TypeMeta = TypeMeta::new("thing32", "app", 32, 0, PoolTactic::Size);

    let mut alloc = Allocator::new();
    let entry = alloc
        .allocate(Some(&SIZED), 32)
        .expect("allocation must succeed");

    // A pointer into the middle of the block resolves to the record.
    // SAFETY: the record is live.
    let midpoint = unsafe { entry.as_ref().block_start().add(16) };
    assert_eq!(alloc.find(Some(&SIZED), midpoint), Some(entry));
    // So does a hint-free lookup, through the fall-through order.
    assert_eq!(alloc.find(None, midpoint), Some(entry));

    alloc.deallocate(entry);
    alloc.collect_garbage();
}

#[cfg(feature = "reflection")]
#[test]
fn typed_chain_lifecycle_and_boundary() {
    static TYPED: TypeMeta = TypeMeta::new("boundary_thing", "plugin", 40, 0, PoolTactic::Type);

    let mut alloc = Allocator::new();
    let a = alloc.allocate(Some(&TYPED), 40).unwrap();
    let b = alloc.allocate(Some(&TYPED), 40).unwrap();

    alloc.deallocate(a);
    assert_eq!(alloc.check_boundary("plugin"), 1);
    assert_eq!(alloc.check_boundary("elsewhere"), 0);

    alloc.deallocate(b);
    alloc.collect_garbage();
    assert_eq!(alloc.check_boundary("plugin"), 0);
}

#[test]
fn reallocation_across_the_pool_boundary() {
    let mut alloc = Allocator::new();
    let entry = alloc.allocate(None, 1).unwrap();
    let moved = alloc
        .reallocate(DEFAULT_POOL_SIZE, entry)
        .expect("fallback allocation must succeed");

    assert_ne!(moved, entry);
    // SAFETY: the old record was not freed and is still live.
    unsafe {
        assert_eq!(entry.as_ref().uses(), 1);
        assert_eq!(moved.as_ref().allocated_size(), DEFAULT_POOL_SIZE);
    }
    #[cfg(feature = "statistics")]
    assert_eq!(alloc.statistics().pools, 2);

    alloc.deallocate(entry);
    alloc.deallocate(moved);
    alloc.collect_garbage();
}

#[test]
fn shared_records_are_released_at_the_last_reference() {
    let mut alloc = Allocator::new();
    let mut entry = alloc.allocate(None, 512).unwrap();

    // SAFETY: the record is live; this test is its only user.
    unsafe {
        entry.as_mut().keep(5);
        assert_eq!(entry.as_ref().uses(), 6);

        let start = entry.as_ref().block_start();
        assert!(alloc.check_authority(None, start));
        assert_eq!(alloc.find(None, start), Some(entry));

        entry.as_mut().free(5);
        assert_eq!(entry.as_ref().uses(), 1);
    }

    alloc.deallocate(entry);
    // Still under jurisdiction until the pool itself is collected.
    // SAFETY: geometry of a retired record stays readable.
    let start = unsafe { entry.as_ref().block_start() };
    assert!(alloc.check_authority(None, start));
    assert_eq!(alloc.find(None, start), None);

    alloc.collect_garbage();
    assert!(!alloc.check_authority(None, start));
}

#[test]
fn foreign_pointers_are_never_ours() {
    let mut alloc = Allocator::new();
    let entry = alloc.allocate(None, 64).unwrap();

    let local = 42u64;
    let foreign = core::ptr::addr_of!(local).cast::<u8>();
    assert_eq!(alloc.find(None, foreign), None);
    assert!(!alloc.check_authority(None, foreign));

    alloc.deallocate(entry);
    alloc.collect_garbage();
}

#[cfg(feature = "statistics")]
#[test]
fn state_harness_detects_a_leak() {
    use fractalloc::State;

    let mut alloc = Allocator::new();
    let mut state = State::default();
    assert!(state.assert(&mut alloc));

    let leak = alloc.allocate(None, 128).unwrap();
    assert!(!state.assert(&mut alloc), "a live record is a state diff");

    alloc.deallocate(leak);
    // One more pass to settle back onto a clean snapshot.
    state.assert(&mut alloc);
    assert!(state.assert(&mut alloc));
}

/// Deterministic xorshift so the stress run is reproducible.
fn next(rng: &mut u64) -> u64 {
    let mut x = *rng;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *rng = x;
    x
}

#[test]
fn stress_alternating_allocate_and_free() {
    let mut alloc = Allocator::new();
    let mut live: Vec<NonNull<Allocation>> = Vec::new();
    let mut rng = 0x9e37_79b9_7f4a_7c15u64;

    for _ in 0..200_000 {
        let roll = next(&mut rng);
        if !live.is_empty() && (live.len() > 512 || roll % 2 == 0) {
            let victim = live.swap_remove((roll >> 32) as usize % live.len());
            alloc.deallocate(victim);
        } else {
            let bytes = 1 + (roll >> 8) as usize % 1024;
            let entry = alloc.allocate(None, bytes).expect("backend refused");
            // SAFETY: the record was just allocated.
            unsafe {
                assert_eq!(entry.as_ref().uses(), 1);
                // Fill the block to shake out overlapping records.
                core::ptr::write_bytes(entry.as_ref().block_start(), 0x5A, bytes);
            }
            live.push(entry);
        }
    }

    // Every record must still resolve before teardown.
    for entry in &live {
        // SAFETY: all remaining records are live.
        let start = unsafe { entry.as_ref().block_start() };
        assert_eq!(alloc.find(None, start), Some(*entry));
    }

    for entry in live.drain(..) {
        alloc.deallocate(entry);
    }
    alloc.collect_garbage();

    #[cfg(feature = "statistics")]
    {
        assert_eq!(alloc.integrity_check(), Ok(()));
        assert_eq!(alloc.statistics().bytes_by_frontend, 0);
        assert_eq!(alloc.statistics().pools, 0);
        assert_eq!(alloc.statistics().entries, 0);
    }
}
