//! Hierarchical memory usage tracking.
//!
//! A [`UsageTracker`] accounts bytes for one scope (an operator, a query, a
//! whole process). Trackers form a tree: every byte reserved in a child is
//! also reserved in its ancestors, so a parent's current usage is the sum
//! of its children's at every steady point.
//!
//! Reservation is two-phase: [`reserve`](UsageTracker::reserve) runs before
//! backend work and fails without side effects when a maximum would be
//! exceeded; a failed backend call rolls the reservation back with an equal
//! [`release`](UsageTracker::release). Counters are atomic, so no lock is
//! held across the tree.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{MemoryError, MemoryResult};

/// Configuration for a usage tracker.
///
/// # Example
///
/// ```
/// use quartz_mem::{TrackerConfig, UsageTracker};
///
/// let tracker = UsageTracker::create(TrackerConfig::new().with_max_total_bytes(1 << 20));
/// assert!(tracker.reserve(4096).is_ok());
/// assert_eq!(tracker.current_bytes(), 4096);
/// tracker.release(4096);
/// assert_eq!(tracker.current_bytes(), 0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerConfig {
    /// Maximum bytes this tracker may hold; unbounded when `None`.
    pub max_total_bytes: Option<usize>,
}

impl TrackerConfig {
    /// Creates an unbounded configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_total_bytes: None,
        }
    }

    /// Sets the maximum total bytes.
    #[must_use]
    pub const fn with_max_total_bytes(mut self, max_total_bytes: usize) -> Self {
        self.max_total_bytes = Some(max_total_bytes);
        self
    }
}

/// A node in the usage-tracking tree.
#[derive(Debug)]
pub struct UsageTracker {
    parent: Option<Arc<UsageTracker>>,
    current_bytes: AtomicI64,
    peak_bytes: AtomicI64,
    max_total_bytes: i64,
}

impl UsageTracker {
    /// Creates a root tracker.
    #[must_use]
    pub fn create(config: TrackerConfig) -> Arc<Self> {
        Arc::new(Self::with_parent(None, config))
    }

    /// Creates a child tracker whose usage also counts against `self`.
    #[must_use]
    pub fn add_child(self: &Arc<Self>, config: TrackerConfig) -> Arc<Self> {
        Arc::new(Self::with_parent(Some(Arc::clone(self)), config))
    }

    fn with_parent(parent: Option<Arc<UsageTracker>>, config: TrackerConfig) -> Self {
        let max_total_bytes = config
            .max_total_bytes
            .map_or(i64::MAX, |max| i64::try_from(max).unwrap_or(i64::MAX));
        Self {
            parent,
            current_bytes: AtomicI64::new(0),
            peak_bytes: AtomicI64::new(0),
            max_total_bytes,
        }
    }

    /// Reserves `bytes` in this tracker and all its ancestors.
    ///
    /// Fails with [`MemoryError::UsageLimitExceeded`] when any tracker on
    /// the path would exceed its maximum; in that case no counter is left
    /// modified.
    pub fn reserve(&self, bytes: usize) -> MemoryResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let delta = bytes as i64;
        let new = self.current_bytes.fetch_add(delta, Ordering::AcqRel) + delta;
        if new > self.max_total_bytes {
            self.current_bytes.fetch_sub(delta, Ordering::AcqRel);
            return Err(MemoryError::UsageLimitExceeded {
                requested: bytes,
                limit: self.max_total_bytes as usize,
            });
        }
        self.peak_bytes.fetch_max(new, Ordering::AcqRel);
        if let Some(parent) = &self.parent {
            if let Err(err) = parent.reserve(bytes) {
                self.current_bytes.fetch_sub(delta, Ordering::AcqRel);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Releases `bytes` from this tracker and all its ancestors.
    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let prev = self.current_bytes.fetch_sub(bytes as i64, Ordering::AcqRel);
        debug_assert!(prev >= bytes as i64, "release exceeds reserved bytes");
        if let Some(parent) = &self.parent {
            parent.release(bytes);
        }
    }

    /// Returns the bytes currently reserved.
    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.current_bytes.load(Ordering::Acquire).max(0) as usize
    }

    /// Returns the high-water mark of reserved bytes.
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire).max(0) as usize
    }

    /// Returns the configured maximum, or `None` when unbounded.
    #[must_use]
    pub fn max_total_bytes(&self) -> Option<usize> {
        if self.max_total_bytes == i64::MAX {
            None
        } else {
            Some(self.max_total_bytes as usize)
        }
    }
}
