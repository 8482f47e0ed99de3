#![forbid(unsafe_code)]
//! Fixed-capacity write-back block cache for multithreaded callers.
//!
//! Every [`BlockCache::read`] and [`BlockCache::write`] runs in two steps:
//!
//! 1. Inside the concurrent phase of an [`AccessGate`], locate or claim a
//!    slot and do the slot's I/O under that slot's own lock. Unrelated blocks
//!    proceed in parallel; a miss may write back a dirty victim and fetch the
//!    requested block.
//! 2. After leaving the concurrent phase, enter the exclusive phase and move
//!    the slot to the most recently used end of the [`RecencyTracker`].
//!
//! The recency order is only mutated in the exclusive phase, so the victim
//! peek done during step 1 never sees a half-updated order.
//!
//! # Victim selection
//!
//! Misses pick their victim inside a short install section guarded by the
//! reservation table. A chosen slot stays reserved until its recency update
//! commits, and later misses in the same phase skip reserved slots. When every
//! slot is reserved the least recently used one is reused anyway. Lookups
//! re-check the slot's block after locking it, so a reused slot is never
//! mistaken for the block it used to hold.
//!
//! # Lock order
//!
//! gate phase, then reservation table, then slot lock. The reservation table
//! is never locked while a slot lock is held.

mod gate;
mod recency;
mod slots;

pub use gate::{AccessGate, ConcurrentPass, ExclusivePass, GateStats, Phase};
pub use recency::RecencyTracker;
pub use slots::{SlotGuard, SlotSnapshot, SlotStatus, SlotTable};

use bc_block::{BlockBuf, BlockDevice, ensure_block_len, ensure_in_range};
use bc_error::{CacheError, Result};
use bc_types::{BlockNumber, BlockSize, DEFAULT_CAPACITY, SlotIndex};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Cache construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of slots. Must be at least 1.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.capacity)
            .ok_or_else(|| CacheError::InvalidConfig("cache capacity must be > 0".to_owned()))
    }
}

/// Lifetime counters of a [`BlockCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Misses that displaced a resident block.
    pub evictions: u64,
    /// Dirty victims written back to the backing store.
    pub writebacks: u64,
    /// Lookups whose slot changed hands between the scan and the lock.
    pub stale_lookups: u64,
    pub gate: GateStats,
}

impl CacheMetrics {
    /// Fraction of lookups served from the cache, `0.0` when idle.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    stale_lookups: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-flight miss count for one slot. Released on drop.
#[derive(Debug)]
struct Reservation<'a> {
    table: &'a Mutex<Vec<u32>>,
    slot: SlotIndex,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.table.lock().get_mut(self.slot.get()) {
            *count = count.saturating_sub(1);
        }
    }
}

/// A slot claimed for an incoming block. Field order makes the slot lock
/// drop before the reservation.
#[derive(Debug)]
struct Claim<'a> {
    guard: SlotGuard<'a>,
    reservation: Reservation<'a>,
}

impl<'a> Claim<'a> {
    /// Unlock the slot, keeping it reserved until the recency update.
    fn unlock(self) -> (SlotIndex, Reservation<'a>) {
        let Claim { guard, reservation } = self;
        let slot = guard.index();
        drop(guard);
        (slot, reservation)
    }
}

#[derive(Debug)]
enum Lookup<'a> {
    Hit(SlotGuard<'a>),
    Miss(Claim<'a>),
}

/// Write-back LRU cache of whole blocks in front of a [`BlockDevice`].
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    device: D,
    block_size: BlockSize,
    slots: SlotTable,
    gate: AccessGate<RecencyTracker>,
    /// Install lock and per-slot count of misses that chose the slot but have
    /// not committed their recency update yet.
    reservations: Mutex<Vec<u32>>,
    counters: Counters,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(device: D, config: CacheConfig) -> Result<Self> {
        let capacity = config.validate()?;
        let block_size = device.block_size();
        info!(
            target: "bc::cache",
            event = "cache_init",
            capacity = capacity.get(),
            block_size = block_size.get(),
            block_count = device.block_count()
        );
        Ok(Self {
            device,
            block_size,
            slots: SlotTable::new(capacity, block_size),
            gate: AccessGate::new(RecencyTracker::new(capacity)),
            reservations: Mutex::new(vec![0; capacity.get()]),
            counters: Counters::default(),
        })
    }

    /// Read a block, loading it from the backing store on a miss.
    pub fn read(&self, block: BlockNumber) -> Result<BlockBuf> {
        ensure_in_range(block, self.device.block_count())?;
        let pass = self.gate.enter_concurrent();
        let (slot, bytes, reservation) = match self.lookup(&pass, block)? {
            Lookup::Hit(guard) => {
                Counters::bump(&self.counters.hits);
                trace!(
                    target: "bc::cache",
                    event = "read_hit",
                    block = block.0,
                    slot = guard.index().get()
                );
                (guard.index(), guard.copy_out(), None)
            }
            Lookup::Miss(mut claim) => {
                let fetched = self
                    .device
                    .read_block(block)
                    .and_then(|buf| claim.guard.fill(buf.as_slice()));
                if let Err(err) = fetched {
                    claim.guard.invalidate();
                    warn!(
                        target: "bc::cache",
                        event = "fetch_failed",
                        block = block.0,
                        slot = claim.guard.index().get(),
                        error = %err
                    );
                    return Err(err);
                }
                let bytes = claim.guard.copy_out();
                let (slot, reservation) = claim.unlock();
                (slot, bytes, Some(reservation))
            }
        };
        drop(pass);
        self.commit_use(slot, reservation);
        Ok(BlockBuf::new(bytes))
    }

    /// Overwrite a whole block in the cache. The backing store is updated
    /// when the block is evicted.
    pub fn write(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        ensure_in_range(block, self.device.block_count())?;
        ensure_block_len(data.len(), self.block_size)?;
        let pass = self.gate.enter_concurrent();
        let (slot, reservation) = match self.lookup(&pass, block)? {
            Lookup::Hit(mut guard) => {
                Counters::bump(&self.counters.hits);
                guard.fill(data)?;
                guard.mark_dirty();
                trace!(
                    target: "bc::cache",
                    event = "write_hit",
                    block = block.0,
                    slot = guard.index().get()
                );
                (guard.index(), None)
            }
            Lookup::Miss(mut claim) => {
                if let Err(err) = claim.guard.fill(data) {
                    claim.guard.invalidate();
                    return Err(err);
                }
                claim.guard.mark_dirty();
                let (slot, reservation) = claim.unlock();
                (slot, Some(reservation))
            }
        };
        drop(pass);
        self.commit_use(slot, reservation);
        Ok(())
    }

    /// Find the slot for `block`, claiming and preparing a victim on a miss.
    ///
    /// A returned miss has the slot assigned to `block` with any dirty
    /// previous contents already written back; its data still has to be
    /// filled by the caller.
    fn lookup<'a>(
        &'a self,
        pass: &ConcurrentPass<'_, RecencyTracker>,
        block: BlockNumber,
    ) -> Result<Lookup<'a>> {
        loop {
            if let Some(index) = self.slots.find(block) {
                let guard = self.slots.lock(index);
                if guard.block() == Some(block) {
                    return Ok(Lookup::Hit(guard));
                }
                drop(guard);
                Counters::bump(&self.counters.stale_lookups);
                trace!(
                    target: "bc::cache",
                    event = "stale_lookup",
                    block = block.0,
                    slot = index.get()
                );
                continue;
            }

            let mut reserved = self.reservations.lock();
            // Another miss may have claimed a slot for `block` since the scan.
            if self.slots.find(block).is_some() {
                continue;
            }
            let victim = pass
                .read()
                .victim_where(|slot| reserved.get(slot.get()).is_some_and(|&n| n == 0));
            if let Some(count) = reserved.get_mut(victim.get()) {
                *count += 1;
            }
            let reservation = Reservation {
                table: &self.reservations,
                slot: victim,
            };
            let mut guard = self.slots.lock(victim);
            let previous = guard.block();
            let writeback = previous.filter(|_| guard.is_dirty());
            if let Some(old) = writeback {
                guard.begin_eviction(old);
            }
            guard.publish(Some(block));
            drop(reserved);
            Counters::bump(&self.counters.misses);

            if let Some(old) = writeback {
                if let Err(err) = self.device.write_block(old, guard.data()) {
                    guard.publish(previous);
                    guard.end_eviction();
                    warn!(
                        target: "bc::cache",
                        event = "writeback_failed",
                        block = old.0,
                        incoming = block.0,
                        slot = victim.get(),
                        error = %err
                    );
                    drop(guard);
                    drop(reservation);
                    return Err(err);
                }
                guard.end_eviction();
                Counters::bump(&self.counters.writebacks);
            }
            if let Some(old) = previous {
                Counters::bump(&self.counters.evictions);
                debug!(
                    target: "bc::cache",
                    event = "evict",
                    block = old.0,
                    incoming = block.0,
                    slot = victim.get(),
                    written_back = writeback.is_some()
                );
            } else {
                debug!(target: "bc::cache", event = "miss", block = block.0, slot = victim.get());
            }
            guard.install(block);
            return Ok(Lookup::Miss(Claim { guard, reservation }));
        }
    }

    /// Record the access in the recency order. The reservation, if any, is
    /// released inside the exclusive phase.
    fn commit_use(&self, slot: SlotIndex, reservation: Option<Reservation<'_>>) {
        let mut pass = self.gate.enter_exclusive();
        pass.write().mark_used(slot);
        drop(reservation);
        drop(pass);
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn gate_phase(&self) -> Phase {
        self.gate.phase()
    }

    /// Slots from least to most recently used.
    #[must_use]
    pub fn recency_order(&self) -> Vec<SlotIndex> {
        self.gate.enter_concurrent().read().order().to_vec()
    }

    /// Whether the recency order is a permutation of every slot.
    #[must_use]
    pub fn recency_is_permutation(&self) -> bool {
        self.gate.enter_concurrent().read().is_permutation()
    }

    #[must_use]
    pub fn resident_blocks(&self) -> Vec<BlockNumber> {
        self.slots.resident_blocks()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.slots.dirty_count()
    }

    #[must_use]
    pub fn slots_snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots.snapshot()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let c = &self.counters;
        CacheMetrics {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            writebacks: c.writebacks.load(Ordering::Relaxed),
            stale_lookups: c.stale_lookups.load(Ordering::Relaxed),
            gate: self.gate.stats(),
        }
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.read(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.write(block, data)
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.device.block_count()
    }
}
