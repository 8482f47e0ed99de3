//! Simulated disk latency.
//!
//! [`LatencyDevice`] forwards every request to an inner [`BlockDevice`] and
//! then sleeps for a pseudo-random duration in `[0, max_latency)`. Two requests
//! issued back to back can therefore complete in either order, which is what
//! exercises the cache's locking.
//!
//! The jitter sequence comes from a seeded xorshift generator advanced with a
//! single atomic update, so the device stays lock-free and a given seed always
//! yields the same sequence of delays (though not the same assignment of
//! delays to threads).

use crate::{BlockBuf, BlockDevice};
use bc_error::Result;
use bc_types::{BlockNumber, BlockSize};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Latency envelope of a simulated disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyConfig {
    /// Upper bound (exclusive) of the per-request delay. Zero disables sleeping.
    pub max_latency: Duration,
    /// Seed for the jitter sequence.
    pub seed: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_micros(100),
            seed: 0x00B1_0C4C_AC4E_5EED,
        }
    }
}

/// Request counters for a [`LatencyDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStats {
    /// Completed block reads.
    pub reads: u64,
    /// Completed block writes.
    pub writes: u64,
    /// Total time spent sleeping, in microseconds.
    pub simulated_latency_us: u64,
}

/// Block device wrapper that adds bounded, variable latency to every request.
#[derive(Debug)]
pub struct LatencyDevice<D: BlockDevice> {
    inner: D,
    max_latency_ns: u64,
    rng_state: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    slept_ns: AtomicU64,
}

impl<D: BlockDevice> LatencyDevice<D> {
    #[must_use]
    pub fn new(inner: D, config: LatencyConfig) -> Self {
        let max_latency_ns = u64::try_from(config.max_latency.as_nanos()).unwrap_or(u64::MAX);
        Self {
            inner,
            max_latency_ns,
            // xorshift has an all-zero fixed point.
            rng_state: AtomicU64::new((config.seed ^ 0x9E37_79B9_7F4A_7C15) | 1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            slept_ns: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> DiskStats {
        DiskStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            simulated_latency_us: self.slept_ns.load(Ordering::Relaxed) / 1_000,
        }
    }

    /// Next delay in `[0, max_latency)`.
    fn next_delay(&self) -> Duration {
        if self.max_latency_ns == 0 {
            return Duration::ZERO;
        }
        let previous = self
            .rng_state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| Some(xorshift(x)))
            .unwrap_or_else(|current| current);
        let sample = xorshift(previous).wrapping_mul(0x2545_F491_4F6C_DD1D);
        Duration::from_nanos(sample % self.max_latency_ns)
    }

    fn simulate(&self, op: &'static str, block: BlockNumber) {
        let delay = self.next_delay();
        trace!(
            target: "bc::block",
            event = "disk_latency",
            op,
            block = block.0,
            delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX)
        );
        if !delay.is_zero() {
            std::thread::sleep(delay);
            self.slept_ns.fetch_add(
                u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
        }
    }
}

#[inline]
fn xorshift(mut x: u64) -> u64 {
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x
}

impl<D: BlockDevice> BlockDevice for LatencyDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let buf = self.inner.read_block(block)?;
        self.simulate("read", block);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.inner.write_block(block, data)?;
        self.simulate("write", block);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}
