//! Page primitives: page counts and runs of contiguous pages.

use std::fmt;
use std::ptr::NonNull;

use crate::constants::PAGE_SIZE;

/// A count of machine pages.
pub type MachinePageCount = usize;

/// Returns the number of pages needed to hold `bytes`, rounding up.
#[inline]
#[must_use]
pub const fn pages_for_bytes(bytes: usize) -> MachinePageCount {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// A contiguous range of pages belonging to an allocation.
///
/// The holder of the enclosing [`Allocation`](crate::Allocation) has
/// exclusive access to the full `num_pages * PAGE_SIZE` bytes starting at
/// `data`.
#[derive(Clone, Copy)]
pub struct PageRun {
    data: NonNull<u8>,
    num_pages: MachinePageCount,
}

// SAFETY: a PageRun is a plain (pointer, length) pair; access rights travel
// with the owning allocation handle.
unsafe impl Send for PageRun {}
unsafe impl Sync for PageRun {}

impl PageRun {
    /// Creates a run covering `num_pages` pages starting at `data`.
    ///
    /// # Panics
    ///
    /// Panics if `num_pages` is zero.
    #[must_use]
    pub fn new(data: NonNull<u8>, num_pages: MachinePageCount) -> Self {
        assert!(num_pages > 0, "a page run cannot be empty");
        Self { data, num_pages }
    }

    /// Returns the base address of the run.
    #[inline]
    #[must_use]
    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Returns the number of pages in the run.
    #[inline]
    #[must_use]
    pub const fn num_pages(&self) -> MachinePageCount {
        self.num_pages
    }

    /// Returns the size of the run in bytes.
    #[inline]
    #[must_use]
    pub const fn num_bytes(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }
}

impl fmt::Debug for PageRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRun")
            .field("data", &self.data)
            .field("num_pages", &self.num_pages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for_bytes() {
        assert_eq!(pages_for_bytes(0), 0);
        assert_eq!(pages_for_bytes(1), 1);
        assert_eq!(pages_for_bytes(PAGE_SIZE), 1);
        assert_eq!(pages_for_bytes(PAGE_SIZE + 1), 2);
        assert_eq!(pages_for_bytes(10 * PAGE_SIZE), 10);
    }

    #[test]
    fn test_page_run_accessors() {
        let mut buffer = vec![0u8; 3 * PAGE_SIZE];
        let ptr = NonNull::new(buffer.as_mut_ptr()).unwrap();
        let run = PageRun::new(ptr, 3);
        assert_eq!(run.data(), buffer.as_mut_ptr());
        assert_eq!(run.num_pages(), 3);
        assert_eq!(run.num_bytes(), 3 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "cannot be empty")]
    fn test_page_run_rejects_zero_pages() {
        let run = PageRun::new(NonNull::dangling(), 0);
        let _ = run.num_pages();
    }
}
