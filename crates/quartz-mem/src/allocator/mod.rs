//! Page-granular memory allocation.
//!
//! The [`MemoryAllocator`] trait is the single operation set both backends
//! implement:
//!
//! - [`MallocAllocator`]: size-class runs carved from the system heap.
//! - [`MmapAllocator`]: a fixed reserved virtual range that tracks which
//!   pages are committed and can advise idle pages back to the OS.
//!
//! A process installs one backend as the default instance; query operators
//! obtain [`ScopedAllocator`] children that share the backend but account
//! through their own [`UsageTracker`](crate::UsageTracker).

mod malloc;
mod mmap;
mod size_class;

pub use malloc::MallocAllocator;
pub use mmap::{Failure, MmapAllocator, MmapAllocatorOptions};

pub(crate) use size_class::{allocation_size, class_for_pages};

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::constants::{MALLOC_ALIGNMENT, MAX_MALLOC_BYTES, PAGE_SIZE};
use crate::error::{MemoryError, MemoryResult};
use crate::page::{pages_for_bytes, MachinePageCount};
use crate::stats::{self, AllocatorStats, ByteBucket};
use crate::tracker::UsageTracker;

/// Reservation callback invoked by the backends around page acquisition.
///
/// Called as `(bytes, true)` immediately before the backend acquires pages
/// and as `(bytes, false)` when bytes are released: freed collateral, or
/// the rollback of a failed acquisition. Returning an error from the
/// pre-allocation call aborts the allocation.
pub type ReservationFn<'a> = dyn Fn(usize, bool) -> MemoryResult<()> + Send + Sync + 'a;

/// A shared handle to any allocator backend or scoped child.
pub type SharedAllocator = Arc<dyn MemoryAllocator>;

/// The allocator operation set.
///
/// Callers never branch on the backend except for backend-specific
/// assertions (`num_mapped` semantics, fault injection).
pub trait MemoryAllocator: Send + Sync + fmt::Debug {
    /// Allocates at least `num_pages` pages as size-class runs into `out`.
    ///
    /// Any previous contents of `out` are freed first. Every returned run
    /// is at least `min_size_class` pages (`0` leaves the class choice
    /// unconstrained). On failure `out` is left empty and all side effects
    /// are rolled back.
    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: Option<&ReservationFn<'_>>,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<()>;

    /// Returns the pages of `allocation` to the free pool.
    ///
    /// Idempotent on empty handles. Returns the number of pages freed.
    fn free_non_contiguous(&self, allocation: &mut Allocation) -> MachinePageCount;

    /// Allocates `num_pages` contiguous pages into `out`.
    ///
    /// `collateral` and any previous contents of `out` are consumed
    /// unconditionally: their pages fund the request, and on failure they
    /// are still gone. The handle is written only on success.
    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        out: &mut ContiguousAllocation,
        reservation: Option<&ReservationFn<'_>>,
    ) -> MemoryResult<()>;

    /// Releases a contiguous allocation. No-op on empty handles.
    fn free_contiguous(&self, allocation: &mut ContiguousAllocation);

    /// Returns the ascending size-class list, in pages.
    fn size_classes(&self) -> &[MachinePageCount];

    /// Returns the total pages currently allocated.
    fn num_allocated(&self) -> MachinePageCount;

    /// Returns the pages currently backed by committed memory.
    ///
    /// Only meaningful for backends that manage commitment; the system-heap
    /// backend reports zero.
    fn num_mapped(&self) -> MachinePageCount;

    /// Verifies internal bookkeeping against the authoritative per-page
    /// state. Returns true when consistent.
    fn check_consistency(&self) -> bool;

    /// Returns a snapshot of the per-size-class counters.
    fn stats(&self) -> AllocatorStats;

    /// Returns the largest size class, in pages.
    fn largest_size_class(&self) -> MachinePageCount {
        *self
            .size_classes()
            .last()
            .expect("allocator has at least one size class")
    }

    /// Allocates `bytes` bytes, routing by size.
    ///
    /// Requests at or below [`MAX_MALLOC_BYTES`] go to the system heap;
    /// requests up to one largest-class run come from a single size-class
    /// run; anything larger becomes a contiguous allocation. Totals per
    /// bucket are kept in [`allocate_bytes_stats`](crate::allocate_bytes_stats).
    fn allocate_bytes(&self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(MemoryError::invalid("cannot allocate zero bytes"));
        }
        if bytes <= MAX_MALLOC_BYTES {
            let layout = Layout::from_size_align(bytes, MALLOC_ALIGNMENT)
                .map_err(|_| MemoryError::invalid("byte count overflows allocation layout"))?;
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc::alloc(layout) };
            let ptr = NonNull::new(ptr).ok_or(MemoryError::CapacityExhausted {
                pages: pages_for_bytes(bytes),
            })?;
            stats::record_allocate_bytes(ByteBucket::Small, bytes);
            return Ok(ptr);
        }

        let num_pages = pages_for_bytes(bytes);
        if let Some(class) = class_for_pages(self.size_classes(), num_pages) {
            let mut allocation = Allocation::empty();
            self.allocate_non_contiguous(class, &mut allocation, None, class)?;
            debug_assert_eq!(allocation.num_runs(), 1);
            let run = allocation.run_at(0);
            // The pages stay live in the backend; the handle forgets them so
            // they are not freed when it drops.
            allocation.take_runs();
            stats::record_allocate_bytes(ByteBucket::InSizeClasses, run.num_bytes());
            return Ok(NonNull::new(run.data()).expect("allocated run is non-null"));
        }

        let mut allocation = ContiguousAllocation::empty();
        self.allocate_contiguous(num_pages, None, &mut allocation, None)?;
        let size = allocation.size();
        let (data, _) = allocation
            .release()
            .expect("successful contiguous allocation is non-empty");
        stats::record_allocate_bytes(ByteBucket::Large, size);
        Ok(data)
    }

    /// Frees `bytes` bytes previously returned by
    /// [`allocate_bytes`](Self::allocate_bytes).
    ///
    /// # Safety
    ///
    /// `ptr` must come from a call to `allocate_bytes(bytes)` on this
    /// allocator and must not be used afterwards.
    unsafe fn free_bytes(&self, ptr: NonNull<u8>, bytes: usize) {
        if bytes <= MAX_MALLOC_BYTES {
            let layout = Layout::from_size_align(bytes, MALLOC_ALIGNMENT)
                .expect("layout validated at allocation time");
            // SAFETY: per contract, ptr was allocated with this layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            stats::record_free_bytes(ByteBucket::Small, bytes);
            return;
        }

        let num_pages = pages_for_bytes(bytes);
        if let Some(class) = class_for_pages(self.size_classes(), num_pages) {
            let mut allocation = Allocation::empty();
            allocation.append(ptr, class);
            self.free_non_contiguous(&mut allocation);
            stats::record_free_bytes(ByteBucket::InSizeClasses, class * PAGE_SIZE);
            return;
        }

        let mut allocation = ContiguousAllocation::empty();
        allocation.reset(None, ptr, num_pages * PAGE_SIZE);
        self.free_contiguous(&mut allocation);
        stats::record_free_bytes(ByteBucket::Large, num_pages * PAGE_SIZE);
    }
}

// =============================================================================
// Default instance
// =============================================================================

static DEFAULT_INSTANCE: RwLock<Option<SharedAllocator>> = RwLock::new(None);

/// Installs `instance` as the process-wide default allocator.
///
/// Passing `None` uninstalls the current default; the next
/// [`default_instance`] call lazily creates a [`MallocAllocator`].
pub fn set_default_instance(instance: Option<SharedAllocator>) {
    *DEFAULT_INSTANCE.write() = instance;
}

/// Returns the process-wide default allocator, installing a
/// [`MallocAllocator`] if none has been set.
#[must_use]
pub fn default_instance() -> SharedAllocator {
    if let Some(instance) = DEFAULT_INSTANCE.read().as_ref() {
        return Arc::clone(instance);
    }
    let mut guard = DEFAULT_INSTANCE.write();
    if guard.is_none() {
        *guard = Some(MallocAllocator::new());
    }
    Arc::clone(guard.as_ref().expect("default instance installed above"))
}

/// Drops the process-wide default allocator. Test hook.
pub fn destroy_test_only() {
    *DEFAULT_INSTANCE.write() = None;
}

// =============================================================================
// Scoped allocator
// =============================================================================

/// A child allocator bound to a usage tracker.
///
/// Shares its parent's backend; every page acquired or released through it
/// is mirrored into the tracker, with the reservation made before backend
/// work and rolled back when the backend fails.
#[derive(Debug)]
pub struct ScopedAllocator {
    self_ref: Weak<ScopedAllocator>,
    parent: SharedAllocator,
    tracker: Arc<UsageTracker>,
}

impl ScopedAllocator {
    /// Creates a child of `parent` accounting through `tracker`.
    #[must_use]
    pub fn new(parent: SharedAllocator, tracker: Arc<UsageTracker>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            parent,
            tracker,
        })
    }

    /// Returns the tracker this child accounts through.
    #[must_use]
    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    fn shared(&self) -> SharedAllocator {
        self.self_ref
            .upgrade()
            .expect("scoped allocator is still alive")
    }

    /// Chains the tracker and an optional caller callback into one
    /// reservation callback for the backend.
    fn reservation_chain<'a>(
        &'a self,
        user: Option<&'a ReservationFn<'a>>,
    ) -> impl Fn(usize, bool) -> MemoryResult<()> + Send + Sync + 'a {
        move |bytes, pre_allocation| {
            if pre_allocation {
                self.tracker.reserve(bytes)?;
            } else {
                self.tracker.release(bytes);
            }
            if let Some(user) = user {
                if let Err(err) = user(bytes, pre_allocation) {
                    if pre_allocation {
                        self.tracker.release(bytes);
                    }
                    return Err(err);
                }
            }
            Ok(())
        }
    }
}

impl MemoryAllocator for ScopedAllocator {
    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: Option<&ReservationFn<'_>>,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<()> {
        let chain = self.reservation_chain(reservation);
        let chain_ref = &chain;
        self.parent
            .allocate_non_contiguous(num_pages, out, Some(chain_ref), min_size_class)
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> MachinePageCount {
        let freed = self.parent.free_non_contiguous(allocation);
        self.tracker.release(freed * PAGE_SIZE);
        freed
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        collateral: Option<&mut Allocation>,
        out: &mut ContiguousAllocation,
        reservation: Option<&ReservationFn<'_>>,
    ) -> MemoryResult<()> {
        let chain = self.reservation_chain(reservation);
        let chain_ref = &chain;
        self.parent
            .allocate_contiguous(num_pages, collateral, out, Some(chain_ref))?;
        out.set_owner(self.shared());
        Ok(())
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) {
        let pages = allocation.num_pages();
        self.parent.free_contiguous(allocation);
        self.tracker.release(pages * PAGE_SIZE);
    }

    fn size_classes(&self) -> &[MachinePageCount] {
        self.parent.size_classes()
    }

    fn num_allocated(&self) -> MachinePageCount {
        self.parent.num_allocated()
    }

    fn num_mapped(&self) -> MachinePageCount {
        self.parent.num_mapped()
    }

    fn check_consistency(&self) -> bool {
        self.parent.check_consistency()
    }

    fn stats(&self) -> AllocatorStats {
        self.parent.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerConfig;

    #[test]
    fn test_scoped_tracks_non_contiguous() {
        let backend: SharedAllocator = MallocAllocator::new();
        let tracker = UsageTracker::create(TrackerConfig::new());
        let scoped: SharedAllocator = ScopedAllocator::new(backend, tracker.clone());

        let mut allocation = Allocation::new(scoped.clone());
        scoped
            .allocate_non_contiguous(32, &mut allocation, None, 0)
            .unwrap();
        assert!(allocation.num_pages() >= 32);
        assert_eq!(
            tracker.current_bytes(),
            allocation.num_pages() * PAGE_SIZE
        );
        drop(allocation);
        assert_eq!(tracker.current_bytes(), 0);
        assert_eq!(scoped.num_allocated(), 0);
    }

    #[test]
    fn test_scoped_limit_fails_allocation() {
        let backend: SharedAllocator = MallocAllocator::new();
        let tracker =
            UsageTracker::create(TrackerConfig::new().with_max_total_bytes(16 * PAGE_SIZE));
        let scoped: SharedAllocator = ScopedAllocator::new(backend, tracker.clone());

        let mut allocation = Allocation::new(scoped.clone());
        let err = scoped
            .allocate_non_contiguous(32, &mut allocation, None, 0)
            .unwrap_err();
        assert!(err.is_capacity());
        assert!(allocation.is_empty());
        assert_eq!(tracker.current_bytes(), 0);
    }

    #[test]
    fn test_default_instance_round_trip() {
        destroy_test_only();
        let instance = default_instance();
        assert_eq!(instance.num_mapped(), 0);
        let again = default_instance();
        assert!(Arc::ptr_eq(&instance, &again));
        destroy_test_only();
    }
}
