#![forbid(unsafe_code)]
//! Block I/O layer underneath the cache.
//!
//! Provides the `BlockDevice` trait, an in-memory backing store whose blocks
//! can be accessed in parallel, and a [`LatencyDevice`] wrapper that makes
//! every read and write take a bounded, pseudo-random amount of time so that
//! concurrent requests complete out of order.

mod latency;

pub use latency::{DiskStats, LatencyConfig, LatencyDevice};

use bc_error::{CacheError, Result};
use bc_types::{BlockNumber, BlockSize, encode_block_value};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Owned block buffer.
///
/// Invariant: length == block size of the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Block-addressed I/O interface.
///
/// Implementations must tolerate concurrent calls for different blocks.
/// Callers are responsible for not racing on the same block.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size.
    fn block_size(&self) -> BlockSize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}

/// Reject block numbers past the end of a device.
pub fn ensure_in_range(block: BlockNumber, block_count: u64) -> Result<()> {
    if block.0 >= block_count {
        return Err(CacheError::OutOfRange {
            block: block.0,
            block_count,
        });
    }
    Ok(())
}

/// Reject buffers that are not exactly one block long.
pub fn ensure_block_len(len: usize, block_size: BlockSize) -> Result<()> {
    let expected = block_size.bytes();
    if len != expected {
        return Err(CacheError::SizeMismatch {
            expected,
            actual: len,
        });
    }
    Ok(())
}

/// In-memory backing store: a fixed array of blocks.
///
/// Each block sits behind its own lock, so requests for different blocks
/// never serialize on the store itself.
#[derive(Debug)]
pub struct MemoryBlockDevice {
    blocks: Vec<Mutex<Vec<u8>>>,
    block_size: BlockSize,
}

impl MemoryBlockDevice {
    /// Zero-filled store of `block_count` blocks.
    pub fn new(block_count: u64, block_size: BlockSize) -> Result<Self> {
        Self::with_contents(block_count, block_size, |_| vec![0_u8; block_size.bytes()])
    }

    /// Store where block `i` initially holds `i` encoded little-endian,
    /// which makes every block's identity visible in its contents.
    pub fn seeded(block_count: u64, block_size: BlockSize) -> Result<Self> {
        Self::with_contents(block_count, block_size, |block| {
            encode_block_value(block, block_size)
        })
    }

    fn with_contents(
        block_count: u64,
        block_size: BlockSize,
        mut fill: impl FnMut(u64) -> Vec<u8>,
    ) -> Result<Self> {
        if block_count == 0 {
            return Err(CacheError::InvalidConfig(
                "block_count must be > 0".to_owned(),
            ));
        }
        let len = usize::try_from(block_count).map_err(|_| {
            CacheError::InvalidConfig(format!("block_count={block_count} does not fit usize"))
        })?;
        let blocks = (0..block_count).map(|block| Mutex::new(fill(block))).collect();
        debug!(
            target: "bc::block",
            event = "memory_device_created",
            block_count,
            block_size = block_size.get(),
            bytes = len.saturating_mul(block_size.bytes())
        );
        Ok(Self { blocks, block_size })
    }

    /// Current contents of `block`, bypassing any wrapper.
    pub fn snapshot(&self, block: BlockNumber) -> Result<Vec<u8>> {
        Ok(self.slot(block)?.lock().clone())
    }

    fn slot(&self, block: BlockNumber) -> Result<&Mutex<Vec<u8>>> {
        ensure_in_range(block, self.block_count())?;
        usize::try_from(block.0)
            .ok()
            .and_then(|index| self.blocks.get(index))
            .ok_or(CacheError::OutOfRange {
                block: block.0,
                block_count: self.block_count(),
            })
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let bytes = self.slot(block)?.lock().clone();
        Ok(BlockBuf::new(bytes))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        ensure_block_len(data.len(), self.block_size)?;
        let mut guard = self.slot(block)?.lock();
        guard.copy_from_slice(data);
        drop(guard);
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        u64::try_from(self.blocks.len()).unwrap_or(u64::MAX)
    }
}
