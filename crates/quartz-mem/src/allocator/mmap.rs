//! Reserved-range allocator backend.
//!
//! Reserves one large virtual range per size class up front
//! (`MAP_NORESERVE`, so only touched pages consume physical memory) and
//! tracks every run of each class as free-unmapped, free-mapped, or
//! allocated. "Mapped" means backed by committed memory; freeing marks runs
//! free-mapped without returning their backing, so re-allocation is cheap.
//!
//! Contiguous allocations come from fresh anonymous mappings. When the
//! committed-page budget would exceed the configured capacity, idle
//! free-mapped runs are advised away (`MADV_DONTNEED`) in whole-run units
//! to fund the new mapping.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, warn};

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::constants::{PAGE_SIZE, SIZE_CLASSES};
use crate::error::{MemoryError, MemoryResult};
use crate::page::{MachinePageCount, PageRun};
use crate::stats::{AllocatorStats, ClassStatsSet};
use crate::test_value;

use super::{allocation_size, MemoryAllocator, ReservationFn};

/// Injectable failure modes for the reserved-range backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// No injected failure.
    None,
    /// Fail the next advise-away site.
    Madvise,
    /// Fail the next mapping site.
    Mmap,
}

/// Configuration for [`MmapAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct MmapAllocatorOptions {
    /// Total capacity in bytes; rounded down to whole pages.
    pub capacity: usize,
}

impl MmapAllocatorOptions {
    /// Creates options with the given capacity in bytes.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for MmapAllocatorOptions {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_MMAP_CAPACITY)
    }
}

#[inline]
fn bit(words: &[u64], index: usize) -> bool {
    words[index / 64] & (1u64 << (index % 64)) != 0
}

#[inline]
fn set_bit(words: &mut [u64], index: usize) {
    words[index / 64] |= 1u64 << (index % 64);
}

#[inline]
fn clear_bit(words: &mut [u64], index: usize) {
    words[index / 64] &= !(1u64 << (index % 64));
}

/// Per-run bookkeeping of one size class, guarded by the class lock.
struct ClassState {
    allocated: Vec<u64>,
    mapped: Vec<u64>,
    num_allocated_runs: usize,
    num_mapped_runs: usize,
}

/// Runs handed out by one [`SizeClass::acquire`] call.
struct Acquisition {
    runs: Vec<usize>,
    unmapped: Vec<usize>,
}

/// One size class: a reserved region divided into equal runs.
struct SizeClass {
    unit: MachinePageCount,
    capacity_runs: usize,
    region: NonNull<u8>,
    region_bytes: usize,
    state: Mutex<ClassState>,
}

// SAFETY: the region pointer is only dereferenced through runs whose
// ownership is tracked under the class lock.
unsafe impl Send for SizeClass {}
unsafe impl Sync for SizeClass {}

impl SizeClass {
    fn new(unit: MachinePageCount, capacity_pages: MachinePageCount) -> MemoryResult<Self> {
        let capacity_runs = capacity_pages / unit;
        let region_bytes = capacity_runs * unit * PAGE_SIZE;
        // SAFETY: anonymous reservation with no file descriptor.
        let region = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                region_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            return Err(MemoryError::os("mmap"));
        }
        let words = capacity_runs.div_ceil(64);
        Ok(Self {
            unit,
            capacity_runs,
            region: NonNull::new(region.cast::<u8>()).expect("mmap returned non-null"),
            region_bytes,
            state: Mutex::new(ClassState {
                allocated: vec![0; words],
                mapped: vec![0; words],
                num_allocated_runs: 0,
                num_mapped_runs: 0,
            }),
        })
    }

    fn run_address(&self, run_index: usize) -> NonNull<u8> {
        debug_assert!(run_index < self.capacity_runs);
        // SAFETY: run_index is within the reserved region.
        unsafe { NonNull::new_unchecked(self.region.as_ptr().add(run_index * self.unit * PAGE_SIZE)) }
    }

    fn contains(&self, ptr: *mut u8) -> bool {
        let base = self.region.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.region_bytes
    }

    /// Masks off bit positions past `capacity_runs` in the given word.
    fn valid_mask(&self, word_index: usize) -> u64 {
        let remainder = self.capacity_runs - word_index * 64;
        if remainder >= 64 {
            u64::MAX
        } else {
            (1u64 << remainder) - 1
        }
    }

    /// Marks `run_count` free runs allocated, preferring runs that are
    /// already backed. Mapped bits are not changed; the caller commits the
    /// returned unmapped runs once the mapped budget is assured.
    fn acquire(&self, run_count: usize) -> Option<Acquisition> {
        let mut state = self.state.lock();
        if self.capacity_runs - state.num_allocated_runs < run_count {
            return None;
        }
        let mut runs = Vec::with_capacity(run_count);
        let mut unmapped = Vec::new();
        for want_mapped in [true, false] {
            let words = state.allocated.len();
            for word_index in 0..words {
                if runs.len() == run_count {
                    break;
                }
                let free = !state.allocated[word_index] & self.valid_mask(word_index);
                let mut candidates = if want_mapped {
                    free & state.mapped[word_index]
                } else {
                    free & !state.mapped[word_index]
                };
                while candidates != 0 && runs.len() < run_count {
                    let offset = candidates.trailing_zeros() as usize;
                    candidates &= candidates - 1;
                    let run_index = word_index * 64 + offset;
                    set_bit(&mut state.allocated, run_index);
                    if !want_mapped {
                        unmapped.push(run_index);
                    }
                    runs.push(run_index);
                }
            }
            if runs.len() == run_count {
                break;
            }
        }
        debug_assert_eq!(runs.len(), run_count);
        state.num_allocated_runs += run_count;
        Some(Acquisition { runs, unmapped })
    }

    /// Marks previously unmapped runs as backed.
    fn commit_mapped(&self, unmapped: &[usize]) {
        let mut state = self.state.lock();
        for run_index in unmapped {
            debug_assert!(!bit(&state.mapped, *run_index));
            set_bit(&mut state.mapped, *run_index);
        }
        state.num_mapped_runs += unmapped.len();
    }

    /// Returns acquired runs to the free pool. Rollback path: mapped bits
    /// stay untouched.
    fn release_acquisition(&self, acquisition: &Acquisition) {
        let mut state = self.state.lock();
        for run_index in &acquisition.runs {
            clear_bit(&mut state.allocated, *run_index);
        }
        state.num_allocated_runs -= acquisition.runs.len();
    }

    /// Frees one run handed out by this class. The backing stays committed.
    fn free_run(&self, run: &PageRun) -> MachinePageCount {
        debug_assert_eq!(run.num_pages() % self.unit, 0);
        let offset = run.data() as usize - self.region.as_ptr() as usize;
        debug_assert_eq!(offset % (self.unit * PAGE_SIZE), 0);
        let first = offset / (self.unit * PAGE_SIZE);
        let count = run.num_pages() / self.unit;
        let mut state = self.state.lock();
        for run_index in first..first + count {
            debug_assert!(bit(&state.allocated, run_index), "double free of a run");
            clear_bit(&mut state.allocated, run_index);
        }
        state.num_allocated_runs -= count;
        run.num_pages()
    }

    fn lock_state(&self) -> MutexGuard<'_, ClassState> {
        self.state.lock()
    }
}

impl Drop for SizeClass {
    fn drop(&mut self) {
        // SAFETY: the region was mapped with region_bytes in new().
        let rc = unsafe { libc::munmap(self.region.as_ptr().cast(), self.region_bytes) };
        if rc != 0 {
            warn!(unit = self.unit, "failed to unmap size-class region");
        }
    }
}

/// Allocator backend over a fixed reserved virtual range.
pub struct MmapAllocator {
    self_ref: Weak<MmapAllocator>,
    capacity: MachinePageCount,
    size_classes: Vec<MachinePageCount>,
    classes: Vec<SizeClass>,
    num_allocated: AtomicUsize,
    num_mapped_class: AtomicUsize,
    num_external_mapped: AtomicUsize,
    injected_failure: Mutex<Failure>,
    stats: ClassStatsSet,
}

impl MmapAllocator {
    /// Test-value hook name fired at the start of every non-contiguous
    /// allocation; setting the flag simulates a refusal.
    pub const ALLOCATE_TEST_VALUE: &'static str =
        "quartz_mem::allocator::MmapAllocator::allocate_non_contiguous";

    /// Creates a backend reserving `options.capacity` bytes.
    ///
    /// Fails with [`MemoryError::InvalidArgument`] when the capacity does
    /// not hold even one largest-class run, or with
    /// [`MemoryError::OsRefused`] when the reservation itself fails.
    pub fn new(options: MmapAllocatorOptions) -> MemoryResult<Arc<Self>> {
        let capacity = options.capacity / PAGE_SIZE;
        let largest = SIZE_CLASSES[SIZE_CLASSES.len() - 1];
        if capacity < largest {
            return Err(MemoryError::invalid(format!(
                "capacity of {capacity} pages cannot hold a {largest}-page run"
            )));
        }
        let mut classes = Vec::with_capacity(SIZE_CLASSES.len());
        for unit in SIZE_CLASSES {
            classes.push(SizeClass::new(unit, capacity)?);
        }
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            capacity,
            size_classes: SIZE_CLASSES.to_vec(),
            classes,
            num_allocated: AtomicUsize::new(0),
            num_mapped_class: AtomicUsize::new(0),
            num_external_mapped: AtomicUsize::new(0),
            injected_failure: Mutex::new(Failure::None),
            stats: ClassStatsSet::new(&SIZE_CLASSES),
        }))
    }

    /// Returns the capacity in pages.
    #[must_use]
    pub fn capacity(&self) -> MachinePageCount {
        self.capacity
    }

    /// Arms a single-shot failure at the next matching syscall site.
    pub fn inject_failure(&self, failure: Failure) {
        *self.injected_failure.lock() = failure;
    }

    fn shared(&self) -> Arc<dyn MemoryAllocator> {
        self.self_ref.upgrade().expect("allocator is still alive")
    }

    fn take_injected(&self, which: Failure) -> bool {
        let mut injected = self.injected_failure.lock();
        if *injected == which {
            *injected = Failure::None;
            return true;
        }
        false
    }

    /// Reserves `num_pages` against the allocated-page budget.
    fn reserve_allocated(&self, num_pages: MachinePageCount) -> bool {
        let mut current = self.num_allocated.load(Ordering::Relaxed);
        loop {
            if current + num_pages > self.capacity {
                return false;
            }
            match self.num_allocated.compare_exchange_weak(
                current,
                current + num_pages,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Releases the physical backing of one run range.
    fn madvise_away(&self, ptr: *mut u8, bytes: usize) -> MemoryResult<()> {
        // SAFETY: the range lies inside a region this allocator reserved.
        let rc = unsafe { libc::madvise(ptr.cast(), bytes, libc::MADV_DONTNEED) };
        if rc != 0 {
            warn!(bytes, "madvise(MADV_DONTNEED) failed");
            return Err(MemoryError::os("madvise"));
        }
        Ok(())
    }

    /// Advises away free-mapped runs of `class` until `target` pages have
    /// been released or the class runs out. Returns the pages actually
    /// advised, plus the error that stopped the walk, if any.
    fn advise_away_from_class(
        &self,
        class: &SizeClass,
        target: MachinePageCount,
    ) -> (MachinePageCount, Option<MemoryError>) {
        let mut state = class.lock_state();
        let mut advised = 0;
        let words = state.mapped.len();
        for word_index in 0..words {
            let mut candidates =
                state.mapped[word_index] & !state.allocated[word_index] & class.valid_mask(word_index);
            while candidates != 0 && advised < target {
                let offset = candidates.trailing_zeros() as usize;
                candidates &= candidates - 1;
                let run_index = word_index * 64 + offset;
                if let Err(err) = self.madvise_away(
                    class.run_address(run_index).as_ptr(),
                    class.unit * PAGE_SIZE,
                ) {
                    return (advised, Some(err));
                }
                clear_bit(&mut state.mapped, run_index);
                state.num_mapped_runs -= 1;
                advised += class.unit;
            }
            if advised >= target {
                break;
            }
        }
        (advised, None)
    }

    /// Makes room in the committed-page budget for `new_pages` more pages,
    /// advising away idle runs when needed.
    fn ensure_mapped_budget(&self, new_pages: MachinePageCount) -> MemoryResult<()> {
        if self.take_injected(Failure::Madvise) {
            return Err(MemoryError::injected("madvise"));
        }
        let mapped =
            self.num_mapped_class.load(Ordering::Relaxed) + self.num_external_mapped.load(Ordering::Relaxed);
        if mapped + new_pages <= self.capacity {
            return Ok(());
        }
        let mut target = mapped + new_pages - self.capacity;
        for class in self.classes.iter().rev() {
            let (advised, err) = self.advise_away_from_class(class, target);
            self.num_mapped_class.fetch_sub(advised, Ordering::Relaxed);
            target = target.saturating_sub(advised);
            if let Some(err) = err {
                return Err(err);
            }
            if target == 0 {
                break;
            }
        }
        if target > 0 {
            return Err(MemoryError::CapacityExhausted { pages: new_pages });
        }
        Ok(())
    }

    /// Maps a fresh anonymous region of `num_pages` pages.
    fn mmap_pages(&self, num_pages: MachinePageCount) -> MemoryResult<NonNull<u8>> {
        if self.take_injected(Failure::Mmap) {
            return Err(MemoryError::injected("mmap"));
        }
        // SAFETY: anonymous mapping with no file descriptor.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                num_pages * PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            warn!(num_pages, "mmap for contiguous allocation failed");
            return Err(MemoryError::os("mmap"));
        }
        Ok(NonNull::new(ptr.cast::<u8>()).expect("mmap returned non-null"))
    }
}

impl std::fmt::Debug for MmapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapAllocator")
            .field("capacity", &self.capacity)
            .field("num_allocated", &self.num_allocated())
            .field("num_mapped", &self.num_mapped())
            .finish()
    }
}

impl MemoryAllocator for MmapAllocator {
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

        if !self.reserve_allocated(mix.total_pages) {
            return Err(MemoryError::CapacityExhausted { pages: num_pages });
        }
        if let Some(reservation) = reservation {
            if let Err(err) = reservation(mix.total_pages * PAGE_SIZE, true) {
                self.num_allocated.fetch_sub(mix.total_pages, Ordering::Relaxed);
                return Err(err);
            }
        }

        let rollback = |acquired: &[(usize, Acquisition)]| {
            for (class_index, acquisition) in acquired {
                self.classes[*class_index].release_acquisition(acquisition);
            }
            self.num_allocated.fetch_sub(mix.total_pages, Ordering::Relaxed);
            if let Some(reservation) = reservation {
                let _ = reservation(mix.total_pages * PAGE_SIZE, false);
            }
        };

        let start = Instant::now();
        let mut acquired: Vec<(usize, Acquisition)> = Vec::with_capacity(mix.units.len());
        let mut unmapped_pages = 0;
        for (class_index, run_count) in &mix.units {
            let class = &self.classes[*class_index];
            match class.acquire(*run_count) {
                Some(acquisition) => {
                    unmapped_pages += acquisition.unmapped.len() * class.unit;
                    acquired.push((*class_index, acquisition));
                }
                None => {
                    rollback(&acquired);
                    return Err(MemoryError::CapacityExhausted { pages: num_pages });
                }
            }
        }

        if unmapped_pages > 0 {
            if let Err(err) = self.ensure_mapped_budget(unmapped_pages) {
                rollback(&acquired);
                return Err(err);
            }
            for (class_index, acquisition) in &acquired {
                self.classes[*class_index].commit_mapped(&acquisition.unmapped);
            }
            self.num_mapped_class.fetch_add(unmapped_pages, Ordering::Relaxed);
        }

        for (class_index, acquisition) in &acquired {
            let class = &self.classes[*class_index];
            for run_index in &acquisition.runs {
                out.append(class.run_address(*run_index), class.unit);
            }
            self.stats.record(
                *class_index,
                (acquisition.runs.len() * class.unit * PAGE_SIZE) as u64,
                start.elapsed().as_nanos() as u64,
            );
        }
        Ok(())
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> MachinePageCount {
        let runs = allocation.take_runs();
        let mut freed = 0;
        for run in &runs {
            match self.classes.iter().find(|class| class.contains(run.data())) {
                Some(class) => freed += class.free_run(run),
                None => error!("freed run does not belong to any size-class region"),
            }
        }
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
        if num_pages > self.capacity {
            return Err(MemoryError::ExceedsCapacity {
                pages: num_pages,
                capacity: self.capacity,
            });
        }
        if !self.reserve_allocated(num_pages) {
            return Err(MemoryError::CapacityExhausted { pages: num_pages });
        }
        if let Some(reservation) = reservation {
            if let Err(err) = reservation(num_pages * PAGE_SIZE, true) {
                self.num_allocated.fetch_sub(num_pages, Ordering::Relaxed);
                return Err(err);
            }
        }

        let rollback = || {
            self.num_allocated.fetch_sub(num_pages, Ordering::Relaxed);
            if let Some(reservation) = reservation {
                let _ = reservation(num_pages * PAGE_SIZE, false);
            }
        };

        if let Err(err) = self.ensure_mapped_budget(num_pages) {
            rollback();
            return Err(err);
        }
        match self.mmap_pages(num_pages) {
            Ok(data) => {
                self.num_external_mapped.fetch_add(num_pages, Ordering::Relaxed);
                out.reset(Some(self.shared()), data, num_pages * PAGE_SIZE);
                Ok(())
            }
            Err(err) => {
                rollback();
                Err(err)
            }
        }
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        if let Some((data, size)) = allocation.release() {
            // SAFETY: the mapping was created by mmap_pages with this size.
            let rc = unsafe { libc::munmap(data.as_ptr().cast(), size) };
            if rc != 0 {
                warn!(size, "munmap of contiguous allocation failed");
            }
            let num_pages = size / PAGE_SIZE;
            self.num_external_mapped.fetch_sub(num_pages, Ordering::Relaxed);
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
        self.num_mapped_class.load(Ordering::Relaxed)
            + self.num_external_mapped.load(Ordering::Relaxed)
    }

    fn check_consistency(&self) -> bool {
        // Take every class lock first so the audit is a strict snapshot.
        let guards: Vec<MutexGuard<'_, ClassState>> =
            self.classes.iter().map(SizeClass::lock_state).collect();

        let mut ok = true;
        let mut allocated_pages = 0;
        let mut mapped_pages = 0;
        for (class, state) in self.classes.iter().zip(&guards) {
            let mut allocated_runs = 0;
            let mut mapped_runs = 0;
            for word_index in 0..state.allocated.len() {
                let mask = class.valid_mask(word_index);
                let allocated_word = state.allocated[word_index] & mask;
                let mapped_word = state.mapped[word_index] & mask;
                allocated_runs += allocated_word.count_ones() as usize;
                mapped_runs += mapped_word.count_ones() as usize;
                // Every allocated run is backed.
                ok &= (allocated_word & !mapped_word) == 0;
            }
            ok &= allocated_runs == state.num_allocated_runs;
            ok &= mapped_runs == state.num_mapped_runs;
            allocated_pages += allocated_runs * class.unit;
            mapped_pages += mapped_runs * class.unit;
        }

        ok &= allocated_pages + self.num_external_mapped.load(Ordering::Relaxed)
            == self.num_allocated.load(Ordering::Relaxed);
        ok &= mapped_pages == self.num_mapped_class.load(Ordering::Relaxed);
        if !ok {
            error!("reserved-range allocator bookkeeping is inconsistent");
        }
        ok
    }

    fn stats(&self) -> AllocatorStats {
        self.stats.snapshot()
    }
}
