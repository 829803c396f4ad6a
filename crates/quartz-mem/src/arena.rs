//! Standalone virtual-address arenas.
//!
//! An [`MmapArena`] is a free-list allocator over a single reserved mmap
//! region, independent of the page allocator. It serves object lifetimes
//! that do not fit page-granular accounting.
//!
//! The free list is indexed twice: by address for coalescing on free, and
//! by size for best-fit selection. [`ManagedArenas`] owns a collection of
//! arenas and spawns a new one when fragmentation leaves no interval large
//! enough for a request.
//!
//! Arenas are not internally synchronized; callers serialize access.

use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

use tracing::debug;

use crate::constants::ARENA_MIN_GRAIN;
use crate::error::{MemoryError, MemoryResult};

fn round_to_grain(bytes: usize) -> usize {
    bytes.max(ARENA_MIN_GRAIN).div_ceil(ARENA_MIN_GRAIN) * ARENA_MIN_GRAIN
}

/// A free-list allocator over one reserved virtual range.
pub struct MmapArena {
    region: NonNull<u8>,
    capacity: usize,
    free_by_addr: BTreeMap<usize, usize>,
    free_by_size: BTreeMap<usize, BTreeSet<usize>>,
    allocated_bytes: usize,
}

// SAFETY: the arena exclusively owns its reserved range; synchronization is
// the caller's responsibility, as with any &mut-based API.
unsafe impl Send for MmapArena {}

impl MmapArena {
    /// Reserves a `capacity`-byte arena.
    pub fn new(capacity: usize) -> MemoryResult<Self> {
        if capacity == 0 || capacity % ARENA_MIN_GRAIN != 0 {
            return Err(MemoryError::invalid(
                "arena capacity must be a positive multiple of the grain size",
            ));
        }
        // SAFETY: anonymous reservation with no file descriptor.
        let region = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            return Err(MemoryError::os("mmap"));
        }
        let mut arena = Self {
            region: NonNull::new(region.cast::<u8>()).expect("mmap returned non-null"),
            capacity,
            free_by_addr: BTreeMap::new(),
            free_by_size: BTreeMap::new(),
            allocated_bytes: 0,
        };
        arena.insert_free(0, capacity);
        Ok(arena)
    }

    /// Returns the base address of the reserved range.
    #[must_use]
    pub fn address(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    /// Returns the arena capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the bytes currently allocated.
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Returns true when nothing is allocated.
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.allocated_bytes == 0
    }

    /// Allocates `bytes` bytes, best-fit.
    ///
    /// Returns `None` when no free interval is large enough, which can
    /// happen from fragmentation even while total free space would suffice.
    pub fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let bytes = round_to_grain(bytes);
        let (&size, offsets) = self.free_by_size.range(bytes..).next()?;
        let offset = *offsets.first().expect("size index entries are non-empty");
        self.remove_free(offset, size);
        if size > bytes {
            self.insert_free(offset + bytes, size - bytes);
        }
        self.allocated_bytes += bytes;
        // SAFETY: the interval lies inside the reserved region.
        Some(unsafe { NonNull::new_unchecked(self.region.as_ptr().add(offset)) })
    }

    /// Returns `bytes` bytes at `ptr` to the free list, coalescing with
    /// adjacent free intervals.
    ///
    /// # Panics
    ///
    /// Panics if the interval does not lie inside this arena.
    pub fn free(&mut self, ptr: *mut u8, bytes: usize) {
        let bytes = round_to_grain(bytes);
        let base = self.region.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr + bytes <= base + self.capacity,
            "freed interval is outside the arena"
        );
        let mut offset = addr - base;
        let mut size = bytes;

        if let Some((&prev_offset, &prev_size)) = self.free_by_addr.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.remove_free(prev_offset, prev_size);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free_by_addr.get(&(offset + size)) {
            self.remove_free(offset + size, next_size);
            size += next_size;
        }
        self.insert_free(offset, size);
        self.allocated_bytes -= bytes;
    }

    /// Verifies that the two free-list indexes agree and that free and
    /// allocated bytes exactly cover the range.
    #[must_use]
    pub fn check_consistency(&self) -> bool {
        let mut free_bytes = 0;
        let mut previous_end = None;
        for (&offset, &size) in &self.free_by_addr {
            if size == 0 || offset + size > self.capacity {
                return false;
            }
            // Adjacent intervals would have been coalesced.
            if let Some(previous_end) = previous_end {
                if offset <= previous_end {
                    return false;
                }
            }
            previous_end = Some(offset + size);
            let indexed = self
                .free_by_size
                .get(&size)
                .is_some_and(|offsets| offsets.contains(&offset));
            if !indexed {
                return false;
            }
            free_bytes += size;
        }
        let size_index_entries: usize = self.free_by_size.values().map(BTreeSet::len).sum();
        if size_index_entries != self.free_by_addr.len() {
            return false;
        }
        free_bytes + self.allocated_bytes == self.capacity
    }

    fn insert_free(&mut self, offset: usize, size: usize) {
        self.free_by_addr.insert(offset, size);
        self.free_by_size.entry(size).or_default().insert(offset);
    }

    fn remove_free(&mut self, offset: usize, size: usize) {
        self.free_by_addr.remove(&offset);
        let offsets = self
            .free_by_size
            .get_mut(&size)
            .expect("free interval is size-indexed");
        offsets.remove(&offset);
        if offsets.is_empty() {
            self.free_by_size.remove(&size);
        }
    }
}

impl Drop for MmapArena {
    fn drop(&mut self) {
        // SAFETY: the region was mapped with capacity bytes in new().
        unsafe { libc::munmap(self.region.as_ptr().cast(), self.capacity) };
    }
}

impl std::fmt::Debug for MmapArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapArena")
            .field("capacity", &self.capacity)
            .field("allocated_bytes", &self.allocated_bytes)
            .field("free_intervals", &self.free_by_addr.len())
            .finish()
    }
}

/// An ordered collection of arenas that grows under fragmentation.
pub struct ManagedArenas {
    arena_capacity: usize,
    arenas: BTreeMap<usize, MmapArena>,
    current: usize,
}

impl ManagedArenas {
    /// Creates a collection with one arena of `arena_capacity` bytes.
    pub fn new(arena_capacity: usize) -> MemoryResult<Self> {
        let arena = MmapArena::new(arena_capacity)?;
        let base = arena.address() as usize;
        let mut arenas = BTreeMap::new();
        arenas.insert(base, arena);
        Ok(Self {
            arena_capacity,
            arenas,
            current: base,
        })
    }

    /// Allocates `bytes` bytes from the first arena that can serve them,
    /// appending a new arena when none can.
    pub fn allocate(&mut self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        for (&base, arena) in &mut self.arenas {
            if let Some(data) = arena.allocate(bytes) {
                self.current = base;
                return Ok(data);
            }
        }

        let capacity = self.arena_capacity.max(round_to_grain(bytes));
        debug!(capacity, "growing managed arenas");
        let mut arena = MmapArena::new(capacity)?;
        let data = arena
            .allocate(bytes)
            .expect("fresh arena serves the request");
        let base = arena.address() as usize;
        self.arenas.insert(base, arena);
        self.current = base;
        Ok(data)
    }

    /// Returns `bytes` bytes at `ptr` to the arena containing it. An arena
    /// that becomes completely free is unmapped, unless it served the most
    /// recent allocation.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not belong to any arena in the collection.
    pub fn free(&mut self, ptr: *mut u8, bytes: usize) {
        let addr = ptr as usize;
        let (&base, arena) = self
            .arenas
            .range_mut(..=addr)
            .next_back()
            .expect("freed pointer belongs to an arena");
        arena.free(ptr, bytes);
        let unused = arena.is_unused();
        if unused && base != self.current && self.arenas.len() > 1 {
            self.arenas.remove(&base);
        }
    }

    /// Returns the number of arenas currently owned.
    #[must_use]
    pub fn num_arenas(&self) -> usize {
        self.arenas.len()
    }

    /// Verifies every arena's free-list consistency.
    #[must_use]
    pub fn check_consistency(&self) -> bool {
        self.arenas.values().all(MmapArena::check_consistency)
    }
}

impl std::fmt::Debug for ManagedArenas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedArenas")
            .field("num_arenas", &self.num_arenas())
            .field("arena_capacity", &self.arena_capacity)
            .finish()
    }
}
