//! System-heap allocator backend.
//!
//! Size-class runs are page-aligned allocations from the system heap. The
//! backend has no capacity of its own; quota enforcement comes from the
//! usage trackers of scoped children. `num_mapped` is not meaningful here
//! and reports zero.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::constants::{PAGE_SIZE, SIZE_CLASSES};
use crate::error::{MemoryError, MemoryResult};
use crate::page::{MachinePageCount, PageRun};
use crate::stats::{AllocatorStats, ClassStatsSet};
use crate::test_value;

use super::{allocation_size, MemoryAllocator, ReservationFn};

/// Allocator backend over the system heap.
pub struct MallocAllocator {
    self_ref: Weak<MallocAllocator>,
    size_classes: Vec<MachinePageCount>,
    num_allocated: AtomicUsize,
    stats: ClassStatsSet,
}

impl MallocAllocator {
    /// Test-value hook name fired at the start of every non-contiguous
    /// allocation; setting the flag simulates a refusal.
    pub const ALLOCATE_TEST_VALUE: &'static str =
        "quartz_mem::allocator::MallocAllocator::allocate_non_contiguous";

    /// Creates a system-heap backend with the standard size classes.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            size_classes: SIZE_CLASSES.to_vec(),
            num_allocated: AtomicUsize::new(0),
            stats: ClassStatsSet::new(&SIZE_CLASSES),
        })
    }

    fn shared(&self) -> Arc<dyn MemoryAllocator> {
        self.self_ref.upgrade().expect("allocator is still alive")
    }

    fn run_layout(num_pages: MachinePageCount) -> Layout {
        Layout::from_size_align(num_pages * PAGE_SIZE, PAGE_SIZE)
            .expect("size-class run layout is valid")
    }

    /// Frees the runs of a partially built allocation without touching the
    /// allocated-page counter.
    fn discard_runs(runs: &[PageRun]) {
        for run in runs {
            // SAFETY: each run was allocated with run_layout(num_pages).
            unsafe { alloc::dealloc(run.data(), Self::run_layout(run.num_pages())) };
        }
    }
}

impl std::fmt::Debug for MallocAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MallocAllocator")
            .field("num_allocated", &self.num_allocated())
            .finish()
    }
}

impl MemoryAllocator for MallocAllocator {
    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: Option<&ReservationFn<'_>>,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<()> {
        let freed = self.free_non_contiguous(out);
        if freed > 0 {
            if let Some(reservation) = reservation {
                let _ = reservation(freed * PAGE_SIZE, false);
            }
        }

        let mix = allocation_size(&self.size_classes, num_pages, min_size_class)?;

        let mut refuse = false;
        test_value::adjust(Self::ALLOCATE_TEST_VALUE, &mut refuse);
        if refuse {
            return Err(MemoryError::CapacityExhausted { pages: num_pages });
        }

        if let Some(reservation) = reservation {
            reservation(mix.total_pages * PAGE_SIZE, true)?;
        }

        let start = Instant::now();
        let mut runs: Vec<PageRun> = Vec::new();
        for (class_index, run_count) in &mix.units {
            let unit = self.size_classes[*class_index];
            let layout = Self::run_layout(unit);
            for _ in 0..*run_count {
                // SAFETY: layout has non-zero size.
                let ptr = unsafe { alloc::alloc(layout) };
                match NonNull::new(ptr) {
                    Some(data) => runs.push(PageRun::new(data, unit)),
                    None => {
                        Self::discard_runs(&runs);
                        if let Some(reservation) = reservation {
                            let _ = reservation(mix.total_pages * PAGE_SIZE, false);
                        }
                        return Err(MemoryError::CapacityExhausted { pages: num_pages });
                    }
                }
            }
            self.stats.record(
                *class_index,
                (run_count * unit * PAGE_SIZE) as u64,
                start.elapsed().as_nanos() as u64,
            );
        }

        self.num_allocated.fetch_add(mix.total_pages, Ordering::Relaxed);
        for run in runs {
            out.append_run(run);
        }
        Ok(())
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> MachinePageCount {
        let runs = allocation.take_runs();
        let mut freed = 0;
        for run in &runs {
            freed += run.num_pages();
        }
        Self::discard_runs(&runs);
        self.num_allocated.fetch_sub(freed, Ordering::Relaxed);
        freed
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        out: &mut ContiguousAllocation,
        reservation: Option<&ReservationFn<'_>>,
    ) -> MemoryResult<()> {
        let mut collateral_pages = 0;
        if let Some(collateral) = collateral {
            collateral_pages += self.free_non_contiguous(collateral);
        }
        let prior_pages = out.num_pages();
        if prior_pages > 0 {
            self.free_contiguous(out);
            collateral_pages += prior_pages;
        }
        if collateral_pages > 0 {
            if let Some(reservation) = reservation {
                let _ = reservation(collateral_pages * PAGE_SIZE, false);
            }
        }

        if num_pages == 0 {
            return Err(MemoryError::invalid("cannot allocate zero pages"));
        }
        if let Some(reservation) = reservation {
            reservation(num_pages * PAGE_SIZE, true)?;
        }

        let layout = Self::run_layout(num_pages);
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(data) => {
                self.num_allocated.fetch_add(num_pages, Ordering::Relaxed);
                out.reset(Some(self.shared()), data, num_pages * PAGE_SIZE);
                Ok(())
            }
            None => {
                if let Some(reservation) = reservation {
                    let _ = reservation(num_pages * PAGE_SIZE, false);
                }
                Err(MemoryError::CapacityExhausted { pages: num_pages })
            }
        }
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        if let Some((data, size)) = allocation.release() {
            let num_pages = size / PAGE_SIZE;
            // SAFETY: the mapping was allocated with run_layout(num_pages).
            unsafe { alloc::dealloc(data.as_ptr(), Self::run_layout(num_pages)) };
            self.num_allocated.fetch_sub(num_pages, Ordering::Relaxed);
        }
    }

    fn size_classes(&self) -> &[MachinePageCount] {
        &self.size_classes
    }

    fn num_allocated(&self) -> MachinePageCount {
        self.num_allocated.load(Ordering::Relaxed)
    }

    fn num_mapped(&self) -> MachinePageCount {
        0
    }

    fn check_consistency(&self) -> bool {
        true
    }

    fn stats(&self) -> AllocatorStats {
        self.stats.snapshot()
    }
}
