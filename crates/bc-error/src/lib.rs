#![forbid(unsafe_code)]
//! Error types for the block cache.
//!
//! # Error Taxonomy
//!
//! | Class | Variant | Raised by |
//! |-------|---------|-----------|
//! | Caller error | `OutOfRange`, `SizeMismatch` | device range/size checks |
//! | Configuration | `InvalidConfig` | cache / device construction |
//! | Backing store failure | `Device` | a `read_block`/`write_block` that could not complete |
//!
//! Capacity exhaustion is not an error: eviction always finds a victim.
//! Waiting on the access gate is a scheduling delay, never a failure.
//!
//! ## Backing store failure policy
//!
//! - A failed writeback during eviction aborts the request. The victim keeps
//!   its previous block, data and dirty flag.
//! - A failed fetch during a read miss leaves the slot invalid; no partially
//!   read data is ever installed.
//! - The cache never retries. Errors reach the caller of `read`/`write`.

use thiserror::Error;

/// Unified error type for block cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Block number beyond the end of the backing store.
    #[error("block out of range: block={block} block_count={block_count}")]
    OutOfRange { block: u64, block_count: u64 },

    /// A buffer was not exactly one block long. Partial-block access is not
    /// supported.
    #[error("block size mismatch: got={actual} expected={expected}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Rejected configuration (zero capacity, zero block size, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backing store failed to read or write a block.
    #[error("backing store failure at block {block}: {detail}")]
    Device { block: u64, detail: String },
}

impl CacheError {
    /// Whether this error came from the backing store rather than from the
    /// caller's request.
    #[must_use]
    pub fn is_device_failure(&self) -> bool {
        match self {
            Self::Device { .. } => true,
            Self::OutOfRange { .. } | Self::SizeMismatch { .. } | Self::InvalidConfig(_) => false,
        }
    }

    /// Block number involved in the failure, when known.
    #[must_use]
    pub fn block(&self) -> Option<u64> {
        match self {
            Self::OutOfRange { block, .. } | Self::Device { block, .. } => Some(*block),
            Self::SizeMismatch { .. } | Self::InvalidConfig(_) => None,
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
