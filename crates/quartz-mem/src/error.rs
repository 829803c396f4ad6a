//! Memory subsystem errors.

use std::io;

use thiserror::Error;

use crate::page::MachinePageCount;

/// Result type for memory subsystem operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors that can occur during allocation operations.
///
/// Every failure path leaves the allocator fully rolled back: partial
/// acquisitions are returned, usage-tracker reservations are released, and
/// the caller's handle is empty. Collateral surrendered to a contiguous
/// allocation is consumed even when the call fails.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum MemoryError {
    /// The backend has no pages left to satisfy the request.
    #[error("cannot supply {pages} pages, allocator capacity exhausted")]
    CapacityExhausted { pages: MachinePageCount },

    /// A usage tracker's configured maximum would be exceeded.
    #[error("usage limit exceeded: {requested} requested bytes over limit of {limit} bytes")]
    UsageLimitExceeded { requested: usize, limit: usize },

    /// The operating system refused a virtual-memory request.
    #[error("{op} failed: {source}")]
    OsRefused {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A contiguous request was larger than the allocator's whole reserved
    /// capacity. This indicates a caller bug rather than transient pressure.
    #[error("request for {pages} pages exceeds reserved capacity of {capacity} pages")]
    ExceedsCapacity {
        pages: MachinePageCount,
        capacity: MachinePageCount,
    },

    /// A malformed request, e.g. zero pages or a byte count that overflows.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl MemoryError {
    /// Creates an `OsRefused` error from the calling thread's last OS error.
    pub fn os(op: &'static str) -> Self {
        Self::OsRefused {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Creates an `OsRefused` error for an injected test fault.
    pub(crate) fn injected(op: &'static str) -> Self {
        Self::OsRefused {
            op,
            source: io::Error::other("injected failure"),
        }
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the failure reflects memory pressure that may clear
    /// up once other allocations are freed.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::CapacityExhausted { .. } | Self::UsageLimitExceeded { .. }
        )
    }
}
