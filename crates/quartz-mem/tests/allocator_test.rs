//! End-to-end allocator scenarios, run against both backends.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quartz_mem::{
    allocate_bytes_stats, clear_allocate_bytes_stats_test_only, default_instance,
    destroy_test_only, set_default_instance, Allocation, AllocationPool, ContiguousAllocation,
    Failure, MachinePageCount, MallocAllocator, MemoryAllocator, MemoryError, MemoryResult,
    MmapAllocator, MmapAllocatorOptions, ReservationFn, ScopedAllocator, SharedAllocator,
    TrackerConfig, UsageTracker, MAX_MALLOC_BYTES, PAGE_SIZE,
};

const CAPACITY_BYTES: usize = 128 * 1024 * 1024;
const CAPACITY: MachinePageCount = CAPACITY_BYTES / PAGE_SIZE;

struct TestContext {
    name: &'static str,
    mmap: Option<Arc<MmapAllocator>>,
    tracker: Arc<UsageTracker>,
    allocator: SharedAllocator,
}

/// One context per backend: the system-heap backend relies on its tracker
/// for capacity enforcement, the reserved-range backend enforces it twice.
fn contexts() -> Vec<TestContext> {
    let mut out = Vec::new();

    let malloc_backend: SharedAllocator = MallocAllocator::new();
    let tracker = UsageTracker::create(TrackerConfig::new().with_max_total_bytes(CAPACITY_BYTES));
    out.push(TestContext {
        name: "malloc",
        mmap: None,
        tracker: tracker.clone(),
        allocator: ScopedAllocator::new(malloc_backend, tracker),
    });

    let mmap = MmapAllocator::new(MmapAllocatorOptions::new(CAPACITY_BYTES)).unwrap();
    let mmap_backend: SharedAllocator = mmap.clone();
    let tracker = UsageTracker::create(TrackerConfig::new().with_max_total_bytes(CAPACITY_BYTES));
    out.push(TestContext {
        name: "mmap",
        mmap: Some(mmap),
        tracker: tracker.clone(),
        allocator: ScopedAllocator::new(mmap_backend, tracker),
    });

    out
}

fn write_pattern(allocation: &Allocation, seed: usize) {
    for run in allocation.runs() {
        let words = run.num_bytes() / std::mem::size_of::<usize>();
        let ptr = run.data().cast::<usize>();
        for word in 0..words {
            // SAFETY: the run belongs to `allocation`.
            unsafe { ptr.add(word).write(ptr as usize + word + seed) };
        }
    }
}

fn verify_pattern(allocation: &Allocation, seed: usize) {
    for run in allocation.runs() {
        let words = run.num_bytes() / std::mem::size_of::<usize>();
        let ptr = run.data().cast::<usize>();
        for word in 0..words {
            // SAFETY: the run belongs to `allocation`.
            let value = unsafe { ptr.add(word).read() };
            assert_eq!(value, ptr as usize + word + seed, "pattern mismatch");
        }
    }
}

#[test]
fn test_size_class_sweep() {
    for ctx in contexts() {
        let classes: Vec<_> = ctx.allocator.size_classes().to_vec();
        for (class_index, &size) in classes.iter().enumerate() {
            let mut allocations = Vec::new();
            loop {
                let mut allocation = Allocation::new(ctx.allocator.clone());
                match ctx
                    .allocator
                    .allocate_non_contiguous(size, &mut allocation, None, 0)
                {
                    Ok(()) => {
                        assert!(allocation.num_pages() >= size);
                        allocations.push(allocation);
                        assert!(
                            allocations.len() <= CAPACITY / size,
                            "{}: class {size} oversubscribed",
                            ctx.name
                        );
                    }
                    Err(err) => {
                        assert!(err.is_capacity(), "{}: unexpected error {err}", ctx.name);
                        assert!(allocation.is_empty());
                        break;
                    }
                }
            }
            assert_eq!(allocations.len(), CAPACITY / size, "{}", ctx.name);
            assert_eq!(ctx.allocator.num_allocated(), CAPACITY);
            assert!(ctx.allocator.check_consistency());

            allocations.clear();
            assert_eq!(ctx.allocator.num_allocated(), 0);
            assert_eq!(ctx.tracker.current_bytes(), 0);
            if ctx.mmap.is_some() {
                // Freed pages stay committed: the whole capacity remains
                // mapped from here on.
                assert_eq!(ctx.allocator.num_mapped(), CAPACITY);
            }
            assert!(ctx.allocator.check_consistency());

            let stats = ctx.allocator.stats();
            assert!(stats.sizes[class_index].clocks > 0);
            assert!(stats.sizes[class_index].total_bytes >= (CAPACITY * PAGE_SIZE) as u64);
            assert!(stats.sizes[class_index].num_allocations >= (CAPACITY / size) as u64);
        }
    }
}

#[test]
fn test_capacity_boundary() {
    for ctx in contexts() {
        let mut whole = Allocation::new(ctx.allocator.clone());
        ctx.allocator
            .allocate_non_contiguous(CAPACITY, &mut whole, None, 0)
            .unwrap();
        assert_eq!(whole.num_pages(), CAPACITY);
        assert_eq!(ctx.allocator.num_allocated(), CAPACITY);
        drop(whole);
        assert_eq!(ctx.allocator.num_allocated(), 0);

        let mut too_much = Allocation::new(ctx.allocator.clone());
        let err = ctx
            .allocator
            .allocate_non_contiguous(CAPACITY + 1, &mut too_much, None, 0)
            .unwrap_err();
        assert!(err.is_capacity());
        assert!(too_much.is_empty());
        assert_eq!(ctx.allocator.num_allocated(), 0);
        assert_eq!(ctx.tracker.current_bytes(), 0);
        assert!(ctx.allocator.check_consistency());
    }
}

#[test]
fn test_contiguous_collateral_exchange() {
    for ctx in contexts() {
        // Fill half the capacity with small allocations.
        let small_pages = 64;
        let mut smalls = Vec::new();
        for _ in 0..CAPACITY / 2 / small_pages {
            let mut allocation = Allocation::new(ctx.allocator.clone());
            ctx.allocator
                .allocate_non_contiguous(small_pages, &mut allocation, None, 0)
                .unwrap();
            smalls.push(allocation);
        }
        let available = CAPACITY - ctx.allocator.num_allocated();
        assert_eq!(available, CAPACITY / 2);

        let mut large = ContiguousAllocation::empty();
        ctx.allocator
            .allocate_contiguous(available / 2, None, &mut large, None)
            .unwrap();
        assert_eq!(large.num_pages(), available / 2);

        let mut small = Allocation::new(ctx.allocator.clone());
        ctx.allocator
            .allocate_non_contiguous(available / 4, &mut small, None, 0)
            .unwrap();

        // More than the whole capacity: fails, and consumes both the
        // collateral and the previous contents of the target handle.
        let err = ctx
            .allocator
            .allocate_contiguous(available + 1, Some(&mut small), &mut large, None)
            .unwrap_err();
        assert!(err.is_capacity(), "{}: {err}", ctx.name);
        assert_eq!(small.num_pages(), 0);
        assert_eq!(large.num_pages(), 0);
        assert!(ctx.allocator.check_consistency());

        // The freed collateral funds the rest of the capacity.
        ctx.allocator
            .allocate_contiguous(available, None, &mut large, None)
            .unwrap();
        assert_eq!(large.num_pages(), available);
        assert_eq!(ctx.allocator.num_allocated(), CAPACITY);
        if ctx.mmap.is_some() {
            assert_eq!(ctx.allocator.num_mapped(), CAPACITY);
        }
        assert_eq!(ctx.tracker.current_bytes(), CAPACITY * PAGE_SIZE);

        // Exchange the whole of available for half of it.
        ctx.allocator
            .allocate_contiguous(available / 2, None, &mut large, None)
            .unwrap();
        assert_eq!(large.num_pages(), available / 2);
        assert!(ctx.allocator.check_consistency());

        drop(large);
        smalls.clear();
        assert_eq!(ctx.allocator.num_allocated(), 0);
        assert_eq!(ctx.tracker.current_bytes(), 0);
    }
}

#[test]
fn test_min_size_class_overshoot() {
    for ctx in contexts() {
        let largest = ctx.allocator.largest_size_class();
        let mut allocation = Allocation::new(ctx.allocator.clone());
        ctx.allocator
            .allocate_non_contiguous(largest + 1, &mut allocation, None, largest)
            .unwrap();
        assert_eq!(allocation.num_pages(), largest * 2);
        for run in allocation.runs() {
            assert!(run.num_pages() >= largest);
        }
        assert_eq!(
            ctx.tracker.current_bytes(),
            allocation.num_pages() * PAGE_SIZE
        );
        drop(allocation);
        assert_eq!(ctx.tracker.current_bytes(), 0);
    }
}

#[test]
fn test_scoped_usage_tracking() {
    for ctx in contexts() {
        let num_pages = 32;
        {
            let tracker = UsageTracker::create(TrackerConfig::new());
            let scoped: SharedAllocator =
                ScopedAllocator::new(ctx.allocator.clone(), tracker.clone());

            let mut result = Allocation::new(scoped.clone());
            scoped
                .allocate_non_contiguous(num_pages, &mut result, None, 0)
                .unwrap();
            assert!(result.num_pages() >= num_pages);
            assert_eq!(tracker.current_bytes(), result.num_pages() * PAGE_SIZE);
            scoped.free_non_contiguous(&mut result);
            assert_eq!(tracker.current_bytes(), 0);
        }

        let tracker = UsageTracker::create(TrackerConfig::new());
        let scoped: SharedAllocator = ScopedAllocator::new(ctx.allocator.clone(), tracker.clone());
        {
            let mut first = Allocation::new(scoped.clone());
            let mut second = Allocation::new(scoped.clone());
            scoped
                .allocate_non_contiguous(num_pages, &mut first, None, 0)
                .unwrap();
            assert_eq!(tracker.current_bytes(), first.num_pages() * PAGE_SIZE);
            scoped
                .allocate_non_contiguous(num_pages, &mut second, None, 0)
                .unwrap();
            assert_eq!(
                tracker.current_bytes(),
                (first.num_pages() + second.num_pages()) * PAGE_SIZE
            );
        }
        // Handles dropped: everything released.
        assert_eq!(tracker.current_bytes(), 0);
        assert_eq!(ctx.tracker.current_bytes(), 0);
    }
}

#[test]
fn test_no_cross_allocation_aliasing() {
    for ctx in contexts() {
        let sizes = [10, 50, 127, 256, 300, 1, 16, 500];
        let mut allocations = Vec::new();
        for (seed, &size) in sizes.iter().enumerate() {
            let mut allocation = Allocation::new(ctx.allocator.clone());
            ctx.allocator
                .allocate_non_contiguous(size, &mut allocation, None, 0)
                .unwrap();
            write_pattern(&allocation, seed);
            allocations.push(allocation);
        }
        for (seed, allocation) in allocations.iter().enumerate() {
            verify_pattern(allocation, seed);
        }
        allocations.clear();
        assert_eq!(ctx.allocator.num_allocated(), 0);
        assert!(ctx.allocator.check_consistency());
    }
}

#[test]
fn test_allocation_pool_schedule() {
    for ctx in contexts() {
        let largest = ctx.allocator.largest_size_class();
        let mut pool = AllocationPool::new(ctx.allocator.clone());

        pool.allocate_fixed(10).unwrap();
        assert_eq!(pool.num_total_allocations(), 1);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 10);

        // Larger than one largest-class run: dedicated allocation, cursor
        // untouched.
        pool.allocate_fixed(largest * 2 * PAGE_SIZE).unwrap();
        assert_eq!(pool.num_total_allocations(), 2);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 10);

        pool.allocate_fixed(20).unwrap();
        assert_eq!(pool.num_total_allocations(), 2);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 30);

        // Leaving 10 bytes of room in a 128-page run.
        pool.allocate_fixed(128 * PAGE_SIZE - 10).unwrap();
        assert_eq!(pool.num_total_allocations(), 3);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 128 * PAGE_SIZE - 10);

        pool.allocate_fixed(5).unwrap();
        assert_eq!(pool.num_total_allocations(), 3);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 128 * PAGE_SIZE - 5);

        pool.allocate_fixed(100).unwrap();
        assert_eq!(pool.num_total_allocations(), 4);
        assert_eq!(pool.current_run_index(), 0);
        assert_eq!(pool.current_offset(), 100);

        pool.clear();
        assert_eq!(ctx.allocator.num_allocated(), 0);
        assert_eq!(ctx.tracker.current_bytes(), 0);
    }
}

#[test]
fn test_allocate_bytes_mixed_sizes() {
    for ctx in contexts() {
        clear_allocate_bytes_stats_test_only();
        let largest = ctx.allocator.largest_size_class();
        let sizes = [
            MAX_MALLOC_BYTES / 2,
            100_000,
            1_000_000,
            largest * PAGE_SIZE + 100_000,
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let mut slots: Vec<Option<(NonNull<u8>, usize)>> = vec![None; 50];

        for _ in 0..slots.len() * 4 {
            let index = rng.gen_range(0..slots.len());
            let bytes = sizes[rng.gen_range(0..sizes.len())];
            let expected = index as u8;
            if let Some((ptr, old_bytes)) = slots[index].take() {
                // SAFETY: the slot owns this buffer.
                unsafe {
                    let slice = std::slice::from_raw_parts(ptr.as_ptr(), old_bytes);
                    assert!(slice.iter().all(|byte| *byte == expected));
                    ctx.allocator.free_bytes(ptr, old_bytes);
                }
            }
            let ptr = ctx.allocator.allocate_bytes(bytes).unwrap();
            // SAFETY: freshly allocated buffer of `bytes` bytes.
            unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), bytes).fill(expected);
            }
            slots[index] = Some((ptr, bytes));
        }
        assert!(ctx.allocator.check_consistency());

        for slot in &mut slots {
            if let Some((ptr, bytes)) = slot.take() {
                // SAFETY: the slot owns this buffer.
                unsafe { ctx.allocator.free_bytes(ptr, bytes) };
            }
        }
        let stats = allocate_bytes_stats();
        assert_eq!(stats.total_small, 0);
        assert_eq!(stats.total_in_size_classes, 0);
        assert_eq!(stats.total_large, 0);
        assert_eq!(ctx.allocator.num_allocated(), 0);
        assert_eq!(ctx.tracker.current_bytes(), 0);
        assert!(ctx.allocator.check_consistency());
    }
}

#[test]
fn test_injected_failure_rolls_back_scoped_contiguous() {
    for failure in [Failure::Madvise, Failure::Mmap] {
        let mmap = MmapAllocator::new(MmapAllocatorOptions::new(CAPACITY_BYTES)).unwrap();
        let backend: SharedAllocator = mmap.clone();
        let tracker = UsageTracker::create(TrackerConfig::new());
        let scoped: SharedAllocator = ScopedAllocator::new(backend, tracker.clone());

        mmap.inject_failure(failure);
        let mut allocation = ContiguousAllocation::empty();
        let err = scoped
            .allocate_contiguous(8, None, &mut allocation, None)
            .unwrap_err();
        assert!(matches!(err, MemoryError::OsRefused { .. }));
        assert!(allocation.is_empty());
        assert_eq!(tracker.current_bytes(), 0);
        assert!(mmap.check_consistency());

        // The injection is single-shot; the retry succeeds.
        scoped
            .allocate_contiguous(8, None, &mut allocation, None)
            .unwrap();
        assert_eq!(tracker.current_bytes(), 8 * PAGE_SIZE);
        drop(allocation);
        assert_eq!(tracker.current_bytes(), 0);
    }
}

/// Mirrors the collateral-exchange fault scenarios with exact page
/// arithmetic on the raw reserved-range backend.
#[test]
fn test_contiguous_failure_consumes_collateral() {
    let mmap = MmapAllocator::new(MmapAllocatorOptions::new(CAPACITY_BYTES)).unwrap();
    let shared: SharedAllocator = mmap.clone();
    let small_pages = 16;
    let large_pages = CAPACITY / 2;

    let tracked = AtomicI64::new(0);
    let track_cb = |bytes: usize, pre_allocation: bool| -> MemoryResult<()> {
        let delta = bytes as i64;
        tracked.fetch_add(if pre_allocation { delta } else { -delta }, Ordering::SeqCst);
        Ok(())
    };
    let track_ref: &ReservationFn = &track_cb;
    let page = PAGE_SIZE as i64;

    // Map the whole capacity through small runs, then free half: those
    // pages stay committed but idle.
    let mut allocations = Vec::new();
    for _ in 0..CAPACITY / small_pages {
        let mut allocation = Allocation::new(shared.clone());
        mmap.allocate_non_contiguous(small_pages, &mut allocation, None, 0)
            .unwrap();
        allocations.push(allocation);
    }
    allocations.truncate(allocations.len() / 2);
    assert_eq!(mmap.num_mapped(), CAPACITY);
    assert_eq!(mmap.num_allocated(), allocations.len() * small_pages);
    assert!(mmap.check_consistency());

    let mut large = ContiguousAllocation::empty();
    mmap.allocate_contiguous(large_pages / 2, None, &mut large, Some(track_ref))
        .unwrap();
    assert!(mmap.check_consistency());

    // Enough room exists, but advising the idle pages away fails.
    mmap.inject_failure(Failure::Madvise);
    let err = mmap
        .allocate_contiguous(
            large_pages + small_pages,
            Some(allocations.last_mut().unwrap()),
            &mut large,
            Some(track_ref),
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::OsRefused { .. }));
    assert!(mmap.check_consistency());
    // Both the collateral and the previous large mapping are gone; nothing
    // was allocated. Net effect: one small allocation's bytes released.
    assert_eq!(
        mmap.num_allocated(),
        small_pages * (allocations.len() - 1)
    );
    assert_eq!(tracked.load(Ordering::SeqCst), -(small_pages as i64) * page);
    assert!(allocations.pop().unwrap().is_empty());

    tracked.store(0, Ordering::SeqCst);
    mmap.allocate_contiguous(large_pages / 2, None, &mut large, Some(track_ref))
        .unwrap();
    mmap.inject_failure(Failure::Mmap);
    let err = mmap
        .allocate_contiguous(
            large_pages + 2 * small_pages,
            Some(allocations.last_mut().unwrap()),
            &mut large,
            Some(track_ref),
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::OsRefused { .. }));
    assert_eq!(
        mmap.num_allocated(),
        small_pages * (allocations.len() - 1)
    );
    assert_eq!(tracked.load(Ordering::SeqCst), -(small_pages as i64) * page);
    assert!(allocations.pop().unwrap().is_empty());
    assert!(mmap.check_consistency());

    // Without injected faults the same exchange goes through and fills the
    // allocator completely.
    tracked.store(0, Ordering::SeqCst);
    mmap.allocate_contiguous(large_pages / 2, None, &mut large, Some(track_ref))
        .unwrap();
    mmap.allocate_contiguous(
        large_pages + 3 * small_pages,
        Some(allocations.last_mut().unwrap()),
        &mut large,
        Some(track_ref),
    )
    .unwrap();
    allocations.pop();
    assert_eq!(mmap.num_mapped(), CAPACITY);
    assert_eq!(mmap.num_allocated(), CAPACITY);
    // Growth: the large region plus two of the three extra small runs (the
    // third replaced the freed collateral).
    assert_eq!(
        tracked.load(Ordering::SeqCst),
        ((large_pages + 2 * small_pages) * PAGE_SIZE) as i64
    );
    assert!(mmap.check_consistency());
}

/// Advising away happens in whole-run units, so the mapped count can
/// over-release by less than one run per contiguous allocation.
#[test]
fn test_external_advise_arithmetic() {
    let mmap = MmapAllocator::new(MmapAllocatorOptions::new(CAPACITY_BYTES)).unwrap();
    let shared: SharedAllocator = mmap.clone();
    let small_pages = 16;
    let large_pages = 32 * small_pages + 1;
    let num_allocs = CAPACITY / small_pages;

    let mut allocations = Vec::new();
    for _ in 0..num_allocs {
        let mut allocation = Allocation::new(shared.clone());
        mmap.allocate_non_contiguous(small_pages, &mut allocation, None, 0)
            .unwrap();
        allocations.push(allocation);
    }
    allocations.truncate(num_allocs / 2);
    assert!(mmap.check_consistency());
    assert_eq!(mmap.num_mapped(), num_allocs * small_pages);
    assert_eq!(mmap.num_allocated(), num_allocs / 2 * small_pages);

    let mut large = vec![ContiguousAllocation::empty(), ContiguousAllocation::empty()];
    mmap.allocate_contiguous(large_pages, None, &mut large[0], None)
        .unwrap();
    // One small run was advised away but not fully used, because the large
    // size is not a multiple of the small run size.
    assert_eq!(
        mmap.num_mapped(),
        num_allocs * small_pages - small_pages + 1
    );
    assert_eq!(
        mmap.num_allocated(),
        num_allocs / 2 * small_pages + large_pages
    );

    mmap.allocate_contiguous(large_pages, None, &mut large[1], None)
        .unwrap();
    large.clear();
    assert_eq!(mmap.num_allocated(), allocations.len() * small_pages);
    assert_eq!(
        mmap.num_mapped(),
        small_pages * num_allocs
            - 2 * large_pages
            - (small_pages - 2 * (large_pages % small_pages))
    );
    assert!(mmap.check_consistency());
}

#[test]
fn test_concurrent_allocate_free() {
    for ctx in contexts() {
        let num_threads = 8;
        let mut handles = Vec::new();
        for thread_index in 0..num_threads {
            let allocator = ctx.allocator.clone();
            handles.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(thread_index as u64);
                let mut held: Vec<Allocation> = Vec::new();
                for _ in 0..200 {
                    let size = rng.gen_range(1..=200);
                    let mut allocation = Allocation::new(allocator.clone());
                    match allocator.allocate_non_contiguous(size, &mut allocation, None, 0) {
                        Ok(()) => {
                            write_pattern(&allocation, thread_index);
                            held.push(allocation);
                        }
                        Err(err) => {
                            assert!(err.is_capacity());
                            // Free some held allocations to make space.
                            let keep = held.len() / 2;
                            for mut gone in held.drain(keep..) {
                                verify_pattern(&gone, thread_index);
                                gone.clear();
                            }
                        }
                    }
                }
                for allocation in &held {
                    verify_pattern(allocation, thread_index);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ctx.allocator.num_allocated(), 0);
        assert_eq!(ctx.tracker.current_bytes(), 0);
        assert!(ctx.allocator.check_consistency());
    }
}

#[test]
fn test_default_instance_install_and_teardown() {
    destroy_test_only();
    let fallback = default_instance();
    assert_eq!(fallback.num_mapped(), 0);

    let mmap = MmapAllocator::new(MmapAllocatorOptions::new(CAPACITY_BYTES)).unwrap();
    let installed: SharedAllocator = mmap.clone();
    set_default_instance(Some(installed.clone()));
    let current = default_instance();
    assert!(Arc::ptr_eq(&current, &installed));

    let mut allocation = Allocation::new(current.clone());
    current
        .allocate_non_contiguous(4, &mut allocation, None, 0)
        .unwrap();
    assert_eq!(current.num_allocated(), 4);
    drop(allocation);

    destroy_test_only();
    let fresh = default_instance();
    assert!(!Arc::ptr_eq(&fresh, &installed));
    destroy_test_only();
}
