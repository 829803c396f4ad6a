//! Allocation handles: owned page runs returned by the allocator.
//!
//! Two handle shapes exist:
//!
//! - [`Allocation`]: an ordered list of page runs drawn from size classes.
//!   Runs may land at unrelated addresses; only their total page count is
//!   guaranteed.
//! - [`ContiguousAllocation`]: a single run of arbitrary length obtained
//!   directly from the OS virtual-memory facilities.
//!
//! Both handles exclusively own their pages. Dropping a non-empty handle
//! returns the pages to the owning allocator; moving one out with `take`
//! leaves the source empty.

use std::fmt;
use std::mem;
use std::ptr::NonNull;

use crate::allocator::SharedAllocator;
use crate::constants::PAGE_SIZE;
use crate::page::{MachinePageCount, PageRun};

/// A non-contiguous allocation: an ordered sequence of page runs.
///
/// Created empty, populated by one successful
/// [`allocate_non_contiguous`](crate::MemoryAllocator::allocate_non_contiguous)
/// call, and freed exactly once (explicitly via [`clear`](Self::clear) or on
/// drop). A handle created without an owner never frees pages itself; it is
/// a plain run list.
pub struct Allocation {
    owner: Option<SharedAllocator>,
    runs: Vec<PageRun>,
    num_pages: MachinePageCount,
}

impl Allocation {
    /// Creates an empty allocation owned by `allocator`.
    ///
    /// Pages placed into this handle are returned to `allocator` when the
    /// handle is cleared or dropped.
    #[must_use]
    pub fn new(allocator: SharedAllocator) -> Self {
        Self {
            owner: Some(allocator),
            runs: Vec::new(),
            num_pages: 0,
        }
    }

    /// Creates an empty allocation with no owning allocator.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            owner: None,
            runs: Vec::new(),
            num_pages: 0,
        }
    }

    /// Returns the number of runs.
    #[inline]
    #[must_use]
    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    /// Returns the total number of pages across all runs.
    #[inline]
    #[must_use]
    pub fn num_pages(&self) -> MachinePageCount {
        self.num_pages
    }

    /// Returns true if the allocation holds no pages.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Returns the run at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[inline]
    #[must_use]
    pub fn run_at(&self, index: usize) -> PageRun {
        self.runs[index]
    }

    /// Returns an iterator over the runs.
    pub fn runs(&self) -> impl Iterator<Item = PageRun> + '_ {
        self.runs.iter().copied()
    }

    /// Appends a run of `num_pages` pages starting at `data`.
    ///
    /// # Panics
    ///
    /// Panics if `num_pages` is zero.
    pub fn append(&mut self, data: NonNull<u8>, num_pages: MachinePageCount) {
        self.append_run(PageRun::new(data, num_pages));
    }

    pub(crate) fn append_run(&mut self, run: PageRun) {
        self.num_pages += run.num_pages();
        self.runs.push(run);
    }

    /// Locates the run containing byte `offset` into the allocation.
    ///
    /// Returns `(run_index, offset_within_run)`, or `None` when `offset`
    /// lies past the end. The run list is bounded by the number of size
    /// classes, so a linear walk suffices.
    #[must_use]
    pub fn find_run(&self, offset: usize) -> Option<(usize, usize)> {
        let mut skipped = 0;
        for (index, run) in self.runs.iter().enumerate() {
            if offset < skipped + run.num_bytes() {
                return Some((index, offset - skipped));
            }
            skipped += run.num_bytes();
        }
        None
    }

    /// Moves the contents out, leaving this handle empty.
    ///
    /// The returned allocation keeps the same owner, so it still frees its
    /// pages on drop.
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            owner: self.owner.clone(),
            runs: mem::take(&mut self.runs),
            num_pages: mem::replace(&mut self.num_pages, 0),
        }
    }

    /// Releases the held pages.
    ///
    /// A no-op when empty. With an owning allocator the pages go back to its
    /// free pool; without one only the run list is dropped.
    pub fn clear(&mut self) {
        if self.runs.is_empty() {
            return;
        }
        if let Some(owner) = self.owner.clone() {
            owner.free_non_contiguous(self);
        } else {
            self.runs.clear();
            self.num_pages = 0;
        }
    }

    /// Detaches and returns the run list, leaving the handle empty without
    /// releasing any pages.
    pub(crate) fn take_runs(&mut self) -> Vec<PageRun> {
        self.num_pages = 0;
        mem::take(&mut self.runs)
    }
}

impl Default for Allocation {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("num_runs", &self.num_runs())
            .field("num_pages", &self.num_pages)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

/// A contiguous allocation: one run plus its byte size.
///
/// Default-constructed empty; an allocator installs itself as the owner when
/// it populates the handle, so the mapping is released back to it on drop.
#[derive(Default)]
pub struct ContiguousAllocation {
    owner: Option<SharedAllocator>,
    data: Option<NonNull<u8>>,
    size: usize,
}

// SAFETY: the handle exclusively owns the mapped range.
unsafe impl Send for ContiguousAllocation {}
unsafe impl Sync for ContiguousAllocation {}

impl ContiguousAllocation {
    /// Creates an empty handle.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the base address, or null when empty.
    #[inline]
    #[must_use]
    pub fn data(&self) -> *mut u8 {
        self.data.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Returns the size in bytes (always a multiple of the page size).
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of pages held.
    #[inline]
    #[must_use]
    pub fn num_pages(&self) -> MachinePageCount {
        self.size / PAGE_SIZE
    }

    /// Returns true if the handle holds no mapping.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    /// Moves the contents out, leaving this handle empty.
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            owner: self.owner.take(),
            data: self.data.take(),
            size: mem::replace(&mut self.size, 0),
        }
    }

    /// Releases the mapping back to the owning allocator. No-op when empty.
    pub fn clear(&mut self) {
        if self.data.is_none() {
            self.size = 0;
            return;
        }
        if let Some(owner) = self.owner.clone() {
            owner.free_contiguous(self);
        } else {
            self.data = None;
            self.size = 0;
        }
    }

    /// Installs a freshly allocated mapping into the handle.
    pub(crate) fn reset(&mut self, owner: Option<SharedAllocator>, data: NonNull<u8>, size: usize) {
        debug_assert!(self.data.is_none(), "handle must be empty before reset");
        self.owner = owner;
        self.data = Some(data);
        self.size = size;
    }

    /// Replaces the owning allocator.
    pub(crate) fn set_owner(&mut self, owner: SharedAllocator) {
        self.owner = Some(owner);
    }

    /// Detaches the mapping, leaving the handle empty without unmapping.
    pub(crate) fn release(&mut self) -> Option<(NonNull<u8>, usize)> {
        self.owner = None;
        let size = mem::replace(&mut self.size, 0);
        self.data.take().map(|data| (data, size))
    }
}

impl Drop for ContiguousAllocation {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for ContiguousAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContiguousAllocation")
            .field("size", &self.size)
            .field("num_pages", &self.num_pages())
            .field("owned", &self.owner.is_some())
            .finish()
    }
}
