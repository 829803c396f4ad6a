//! Bump allocation over the page allocator.
//!
//! An [`AllocationPool`] owns a growing list of page allocations and hands
//! out byte ranges from the newest one by advancing a cursor. Memory is
//! returned all at once with [`clear`](AllocationPool::clear).
//!
//! New allocations follow a doubling schedule: one page first, then twice
//! the previous size up to the largest size class, then one largest-class
//! chunk per further allocation. A request larger than one largest-class
//! run gets a dedicated contiguous allocation that never becomes the bump
//! target.

use std::ptr::NonNull;

use crate::allocation::{Allocation, ContiguousAllocation};
use crate::allocator::SharedAllocator;
use crate::constants::PAGE_SIZE;
use crate::error::{MemoryError, MemoryResult};
use crate::page::{pages_for_bytes, MachinePageCount};

/// A bump allocator layered on a page allocator.
///
/// Not thread-safe; use one pool per worker.
pub struct AllocationPool {
    allocator: SharedAllocator,
    allocations: Vec<Allocation>,
    large_allocations: Vec<ContiguousAllocation>,
    current_run: usize,
    current_offset: usize,
    next_alloc_pages: MachinePageCount,
}

impl AllocationPool {
    /// Creates an empty pool drawing from `allocator`.
    #[must_use]
    pub fn new(allocator: SharedAllocator) -> Self {
        Self {
            allocator,
            allocations: Vec::new(),
            large_allocations: Vec::new(),
            current_run: 0,
            current_offset: 0,
            next_alloc_pages: 1,
        }
    }

    /// Allocates `bytes` bytes from the current position.
    pub fn allocate_fixed(&mut self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(MemoryError::invalid("cannot allocate zero bytes"));
        }
        let largest = self.allocator.largest_size_class();
        if bytes > largest * PAGE_SIZE {
            return self.allocate_dedicated(bytes);
        }

        if let Some(data) = self.fit_in_current(bytes) {
            return Ok(data);
        }
        self.new_run(bytes)?;
        Ok(self
            .fit_in_current(bytes)
            .expect("fresh run holds the request"))
    }

    /// Returns every allocation to the page allocator and resets the
    /// cursor and growth schedule.
    pub fn clear(&mut self) {
        self.allocations.clear();
        self.large_allocations.clear();
        self.current_run = 0;
        self.current_offset = 0;
        self.next_alloc_pages = 1;
    }

    /// Returns the number of allocations made so far, dedicated ones
    /// included.
    #[must_use]
    pub fn num_total_allocations(&self) -> usize {
        self.allocations.len() + self.large_allocations.len()
    }

    /// Returns the run index the cursor points into.
    #[must_use]
    pub fn current_run_index(&self) -> usize {
        self.current_run
    }

    /// Returns the byte offset of the cursor within its run.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.current_offset
    }

    /// Hands out `bytes` from the cursor position if the current run (or a
    /// later run of the same allocation) has room.
    fn fit_in_current(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let allocation = self.allocations.last()?;
        loop {
            let run = allocation.run_at(self.current_run);
            if self.current_offset + bytes <= run.num_bytes() {
                // SAFETY: the offset stays inside the run.
                let data = unsafe { run.data().add(self.current_offset) };
                self.current_offset += bytes;
                return Some(NonNull::new(data).expect("run data is non-null"));
            }
            if self.current_run + 1 >= allocation.num_runs() {
                return None;
            }
            self.current_run += 1;
            self.current_offset = 0;
        }
    }

    /// Starts a new allocation sized by the growth schedule, large enough
    /// that its first run holds `bytes`.
    fn new_run(&mut self, bytes: usize) -> MemoryResult<()> {
        let needed = pages_for_bytes(bytes);
        let min_class = crate::allocator::class_for_pages(self.allocator.size_classes(), needed)
            .expect("request fits the largest size class");
        let num_pages = self.next_alloc_pages.max(min_class);

        let mut allocation = Allocation::new(self.allocator.clone());
        self.allocator
            .allocate_non_contiguous(num_pages, &mut allocation, None, min_class)?;
        self.next_alloc_pages = (num_pages * 2).min(self.allocator.largest_size_class());
        self.allocations.push(allocation);
        self.current_run = 0;
        self.current_offset = 0;
        Ok(())
    }

    /// Serves an oversized request with its own contiguous allocation.
    fn allocate_dedicated(&mut self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        let mut allocation = ContiguousAllocation::empty();
        self.allocator
            .allocate_contiguous(pages_for_bytes(bytes), None, &mut allocation, None)?;
        let data = NonNull::new(allocation.data()).expect("contiguous data is non-null");
        self.large_allocations.push(allocation);
        Ok(data)
    }
}

impl std::fmt::Debug for AllocationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationPool")
            .field("num_total_allocations", &self.num_total_allocations())
            .field("current_run", &self.current_run)
            .field("current_offset", &self.current_offset)
            .finish()
    }
}
