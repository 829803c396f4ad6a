//! # quartz-mem
//!
//! Page-granular memory allocation for the QuartzDB query engine.
//!
//! A fixed, process-wide reservation of virtual memory is multiplexed among
//! concurrent query operators. Two allocation shapes are served:
//!
//! - **Non-contiguous**: an [`Allocation`] composed of power-of-two-sized
//!   runs drawn from size classes.
//! - **Contiguous**: a [`ContiguousAllocation`] of arbitrary page count
//!   obtained from the OS virtual-memory facilities, optionally funded by
//!   surrendering existing allocations as collateral.
//!
//! Operators obtain a [`ScopedAllocator`] bound to a hierarchical
//! [`UsageTracker`]; every request reserves bytes in the tracker before
//! backend work and rolls the reservation back when the backend fails.
//! An [`AllocationPool`] offers bump allocation on top of the page
//! allocator, and [`MmapArena`] provides an independent free-list arena
//! over its own reserved range.
//!
//! ## Example
//!
//! ```
//! use quartz_mem::{
//!     Allocation, MallocAllocator, MemoryAllocator, ScopedAllocator, SharedAllocator,
//!     TrackerConfig, UsageTracker, PAGE_SIZE,
//! };
//!
//! let backend: SharedAllocator = MallocAllocator::new();
//! let tracker = UsageTracker::create(TrackerConfig::new().with_max_total_bytes(64 << 20));
//! let allocator: SharedAllocator = ScopedAllocator::new(backend, tracker.clone());
//!
//! let mut allocation = Allocation::new(allocator.clone());
//! allocator.allocate_non_contiguous(20, &mut allocation, None, 0).unwrap();
//! assert!(allocation.num_pages() >= 20);
//! assert_eq!(tracker.current_bytes(), allocation.num_pages() * PAGE_SIZE);
//!
//! drop(allocation);
//! assert_eq!(tracker.current_bytes(), 0);
//! assert_eq!(allocator.num_allocated(), 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod allocation;
pub mod allocator;
pub mod arena;
pub mod constants;
pub mod error;
pub mod page;
pub mod pool;
pub mod stats;
pub mod test_value;
pub mod tracker;

pub use allocation::{Allocation, ContiguousAllocation};
pub use allocator::{
    default_instance, destroy_test_only, set_default_instance, Failure, MallocAllocator,
    MemoryAllocator, MmapAllocator, MmapAllocatorOptions, ReservationFn, ScopedAllocator,
    SharedAllocator,
};
pub use arena::{ManagedArenas, MmapArena};
pub use constants::{MAX_MALLOC_BYTES, MAX_SIZE_CLASS, PAGE_SIZE, SIZE_CLASSES};
pub use error::{MemoryError, MemoryResult};
pub use page::{pages_for_bytes, MachinePageCount, PageRun};
pub use pool::AllocationPool;
pub use stats::{
    allocate_bytes_stats, clear_allocate_bytes_stats_test_only, AllocateBytesStats,
    AllocatorStats, SizeClassStats,
};
pub use tracker::{TrackerConfig, UsageTracker};
