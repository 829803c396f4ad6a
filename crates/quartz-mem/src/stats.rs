//! Allocation statistics.
//!
//! Two families of counters:
//!
//! - Per-size-class counters kept by each backend and snapshotted through
//!   [`MemoryAllocator::stats`](crate::MemoryAllocator::stats).
//! - Process-wide byte-size API bucket totals, mirroring the routing of
//!   [`allocate_bytes`](crate::MemoryAllocator::allocate_bytes).
//!
//! Readers observe lock-free atomic snapshots; exact cross-counter
//! consistency is only guaranteed by `check_consistency`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::page::MachinePageCount;

/// Counters for one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeClassStats {
    /// The class size in pages.
    pub size: MachinePageCount,
    /// Total bytes ever handed out from this class.
    pub total_bytes: u64,
    /// Number of allocation calls that drew from this class.
    pub num_allocations: u64,
    /// Nanoseconds spent in allocation calls that drew from this class.
    pub clocks: u64,
}

/// A snapshot of all per-class counters, indexed like
/// [`size_classes`](crate::MemoryAllocator::size_classes).
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// One entry per size class, ascending.
    pub sizes: Vec<SizeClassStats>,
}

/// Atomic per-class counter set shared by the allocator backends.
#[derive(Debug)]
pub(crate) struct ClassStatsSet {
    sizes: Vec<MachinePageCount>,
    slots: Vec<ClassStatsSlot>,
}

#[derive(Debug, Default)]
struct ClassStatsSlot {
    total_bytes: AtomicU64,
    num_allocations: AtomicU64,
    clocks: AtomicU64,
}

impl ClassStatsSet {
    pub(crate) fn new(size_classes: &[MachinePageCount]) -> Self {
        Self {
            sizes: size_classes.to_vec(),
            slots: size_classes.iter().map(|_| ClassStatsSlot::default()).collect(),
        }
    }

    pub(crate) fn record(&self, class_index: usize, bytes: u64, nanos: u64) {
        let slot = &self.slots[class_index];
        slot.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        slot.num_allocations.fetch_add(1, Ordering::Relaxed);
        slot.clocks.fetch_add(nanos.max(1), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            sizes: self
                .sizes
                .iter()
                .zip(&self.slots)
                .map(|(size, slot)| SizeClassStats {
                    size: *size,
                    total_bytes: slot.total_bytes.load(Ordering::Relaxed),
                    num_allocations: slot.num_allocations.load(Ordering::Relaxed),
                    clocks: slot.clocks.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

/// Outstanding byte totals per byte-size API bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocateBytesStats {
    /// Bytes currently served by the system heap.
    pub total_small: u64,
    /// Bytes currently served from size-class runs.
    pub total_in_size_classes: u64,
    /// Bytes currently served by contiguous allocations.
    pub total_large: u64,
}

static TOTAL_SMALL: AtomicU64 = AtomicU64::new(0);
static TOTAL_IN_SIZE_CLASSES: AtomicU64 = AtomicU64::new(0);
static TOTAL_LARGE: AtomicU64 = AtomicU64::new(0);

/// Routing bucket of a byte-size API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteBucket {
    Small,
    InSizeClasses,
    Large,
}

impl ByteBucket {
    fn counter(self) -> &'static AtomicU64 {
        match self {
            Self::Small => &TOTAL_SMALL,
            Self::InSizeClasses => &TOTAL_IN_SIZE_CLASSES,
            Self::Large => &TOTAL_LARGE,
        }
    }
}

pub(crate) fn record_allocate_bytes(bucket: ByteBucket, bytes: usize) {
    bucket.counter().fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(crate) fn record_free_bytes(bucket: ByteBucket, bytes: usize) {
    bucket.counter().fetch_sub(bytes as u64, Ordering::Relaxed);
}

/// Returns the process-wide byte-size API totals.
#[must_use]
pub fn allocate_bytes_stats() -> AllocateBytesStats {
    AllocateBytesStats {
        total_small: TOTAL_SMALL.load(Ordering::Relaxed),
        total_in_size_classes: TOTAL_IN_SIZE_CLASSES.load(Ordering::Relaxed),
        total_large: TOTAL_LARGE.load(Ordering::Relaxed),
    }
}

/// Resets the process-wide byte-size API totals. Test hook.
pub fn clear_allocate_bytes_stats_test_only() {
    TOTAL_SMALL.store(0, Ordering::Relaxed);
    TOTAL_IN_SIZE_CLASSES.store(0, Ordering::Relaxed);
    TOTAL_LARGE.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_stats_record_and_snapshot() {
        let set = ClassStatsSet::new(&[1, 2, 4]);
        set.record(1, 8192, 250);
        set.record(1, 8192, 250);
        let stats = set.snapshot();
        assert_eq!(stats.sizes.len(), 3);
        assert_eq!(stats.sizes[1].size, 2);
        assert_eq!(stats.sizes[1].total_bytes, 16384);
        assert_eq!(stats.sizes[1].num_allocations, 2);
        assert!(stats.sizes[1].clocks >= 500);
        assert_eq!(stats.sizes[0], SizeClassStats { size: 1, ..SizeClassStats::default() });
    }
}
