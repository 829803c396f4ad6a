//! System-wide constants for the QuartzDB memory subsystem.
//!
//! This module defines the page geometry, size-class ladder, and routing
//! thresholds used across the allocator.

use crate::page::MachinePageCount;

// =============================================================================
// Page Geometry
// =============================================================================

/// Machine page size in bytes (4 KB).
///
/// All allocator bookkeeping is expressed in multiples of this value. It
/// matches the x86-64 and aarch64 base page size.
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// Size Classes
// =============================================================================

/// Size classes available for non-contiguous allocation, in pages.
///
/// Ascending powers of two. Requests are decomposed greedily into runs of
/// these sizes; requests larger than the largest class are served as
/// multiple runs or as a contiguous allocation.
pub const SIZE_CLASSES: [MachinePageCount; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

/// Largest size class, in pages.
pub const MAX_SIZE_CLASS: MachinePageCount = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

// =============================================================================
// Byte-Size API
// =============================================================================

/// Requests at or below this many bytes bypass the page allocator and go to
/// the system heap.
pub const MAX_MALLOC_BYTES: usize = 3072;

/// Alignment for system-heap allocations made by the byte-size API.
pub const MALLOC_ALIGNMENT: usize = 16;

// =============================================================================
// Defaults
// =============================================================================

/// Default capacity for the reserved-range backend (256 MB).
pub const DEFAULT_MMAP_CAPACITY: usize = 256 * 1024 * 1024;

/// Default capacity for a standalone virtual-address arena (32 MB).
pub const DEFAULT_ARENA_CAPACITY: usize = 32 * 1024 * 1024;

/// Minimum granularity of arena allocations, in bytes.
pub const ARENA_MIN_GRAIN: usize = 64;
