#![forbid(unsafe_code)]
//! Identifiers shared by every block cache crate.
//!
//! Block numbers, slot indices and block sizes are distinct newtypes so that a
//! slot index can never be passed where a block number is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Cache capacity used by the reference workload.
pub const DEFAULT_CAPACITY: usize = 10;

/// Number of logical blocks on the reference backing store.
pub const DEFAULT_BLOCK_COUNT: u64 = 100;

/// Block size of the reference workload: one 32-bit integer per block.
pub const DEFAULT_BLOCK_SIZE: u32 = 4;

/// Largest block size accepted by [`BlockSize::new`].
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

/// Logical block number on the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a cache slot, `0..capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub usize);

impl SlotIndex {
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Validated block size in bytes (1..=64 KiB).
///
/// Unlike filesystem block sizes this is not required to be a power of two:
/// the reference workload stores a single `i32` per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ValueError> {
        if value == 0 || value > MAX_BLOCK_SIZE {
            return Err(ValueError::InvalidField {
                field: "block_size",
                reason: "must be in 1..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn bytes(self) -> usize {
        // MAX_BLOCK_SIZE fits every supported target's usize.
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Encode `value` little-endian into a block-sized buffer.
///
/// Shorter blocks keep the low-order bytes; longer blocks are zero padded.
#[must_use]
pub fn encode_block_value(value: u64, block_size: BlockSize) -> Vec<u8> {
    let mut out = vec![0_u8; block_size.bytes()];
    for (dst, src) in out.iter_mut().zip(value.to_le_bytes()) {
        *dst = src;
    }
    out
}

/// Decode the little-endian value stored by [`encode_block_value`].
#[must_use]
pub fn decode_block_value(bytes: &[u8]) -> u64 {
    let mut raw = [0_u8; 8];
    for (dst, src) in raw.iter_mut().zip(bytes) {
        *dst = *src;
    }
    u64::from_le_bytes(raw)
}
