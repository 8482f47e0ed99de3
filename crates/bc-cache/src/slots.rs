//! Fixed table of cache slots, each behind its own lock.
//!
//! Besides the locked state, every slot publishes two atomic tags so that
//! [`SlotTable::find`] can scan without taking any lock:
//!
//! - `tag`: the block the slot answers for. It switches to the incoming block
//!   as soon as a miss claims the slot, before that block is loaded.
//! - `evicting`: the dirty block being written back while the slot is
//!   reassigned. Lookups for it land on this slot and wait on its lock
//!   instead of fetching a stale copy from the backing store.
//!
//! A tag is only a hint. Callers must re-check [`SlotGuard::block`] after
//! locking.

use bc_error::{CacheError, Result};
use bc_types::{BlockNumber, BlockSize, SlotIndex};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

const NO_BLOCK: u64 = u64::MAX;

fn tag_of(block: Option<BlockNumber>) -> u64 {
    block.map_or(NO_BLOCK, |b| b.0)
}

/// Lifecycle state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Never populated, or emptied by a failed fetch.
    Invalid,
    /// Matches the backing store.
    Clean,
    /// Modified since it was loaded or last written back.
    Dirty,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub index: SlotIndex,
    pub block: Option<BlockNumber>,
    pub status: SlotStatus,
}

#[derive(Debug)]
struct SlotState {
    block: Option<BlockNumber>,
    dirty: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct CacheSlot {
    tag: AtomicU64,
    evicting: AtomicU64,
    state: Mutex<SlotState>,
}

impl CacheSlot {
    fn new(block_size: BlockSize) -> Self {
        Self {
            tag: AtomicU64::new(NO_BLOCK),
            evicting: AtomicU64::new(NO_BLOCK),
            state: Mutex::new(SlotState {
                block: None,
                dirty: false,
                data: vec![0_u8; block_size.bytes()],
            }),
        }
    }

    fn answers_for(&self, block: u64) -> bool {
        self.tag.load(Ordering::Acquire) == block || self.evicting.load(Ordering::Acquire) == block
    }
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<CacheSlot>,
}

impl SlotTable {
    #[must_use]
    pub fn new(capacity: NonZeroUsize, block_size: BlockSize) -> Self {
        Self {
            slots: (0..capacity.get())
                .map(|_| CacheSlot::new(block_size))
                .collect(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot currently answering for `block`, if any. Lock-free.
    #[must_use]
    pub fn find(&self, block: BlockNumber) -> Option<SlotIndex> {
        if block.0 == NO_BLOCK {
            return None;
        }
        self.slots
            .iter()
            .position(|slot| slot.answers_for(block.0))
            .map(SlotIndex)
    }

    /// Lock one slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`capacity`](Self::capacity).
    pub fn lock(&self, index: SlotIndex) -> SlotGuard<'_> {
        let slot = &self.slots[index.get()];
        SlotGuard {
            index,
            slot,
            state: slot.state.lock(),
        }
    }

    /// Lock every slot in turn and record its state.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        (0..self.slots.len())
            .map(|i| {
                let guard = self.lock(SlotIndex(i));
                SlotSnapshot {
                    index: guard.index(),
                    block: guard.block(),
                    status: guard.status(),
                }
            })
            .collect()
    }

    /// Blocks held by valid slots, in slot order.
    #[must_use]
    pub fn resident_blocks(&self) -> Vec<BlockNumber> {
        self.snapshot()
            .into_iter()
            .filter_map(|snap| snap.block)
            .collect()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|snap| snap.status == SlotStatus::Dirty)
            .count()
    }
}

/// Exclusive access to one slot's block number, dirty flag and data.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    index: SlotIndex,
    slot: &'a CacheSlot,
    state: MutexGuard<'a, SlotState>,
}

impl SlotGuard<'_> {
    #[must_use]
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        self.state.block
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    #[must_use]
    pub fn status(&self) -> SlotStatus {
        match (self.state.block, self.state.dirty) {
            (None, _) => SlotStatus::Invalid,
            (Some(_), false) => SlotStatus::Clean,
            (Some(_), true) => SlotStatus::Dirty,
        }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.state.data
    }

    #[must_use]
    pub fn copy_out(&self) -> Vec<u8> {
        self.state.data.clone()
    }

    /// Advertise which block lookups should wait on this slot for.
    pub fn publish(&self, block: Option<BlockNumber>) {
        self.slot.tag.store(tag_of(block), Ordering::Release);
    }

    /// Keep lookups for `old` pointed at this slot while it is written back.
    pub fn begin_eviction(&self, old: BlockNumber) {
        self.slot.evicting.store(old.0, Ordering::Release);
    }

    pub fn end_eviction(&self) {
        self.slot.evicting.store(NO_BLOCK, Ordering::Release);
    }

    /// Assign the slot to `block`. The slot is clean until written.
    pub fn install(&mut self, block: BlockNumber) {
        self.state.block = Some(block);
        self.state.dirty = false;
        self.publish(Some(block));
    }

    /// Replace the slot's data with exactly one block of bytes.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        let expected = self.state.data.len();
        if bytes.len() != expected {
            return Err(CacheError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        self.state.data.copy_from_slice(bytes);
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.state.dirty = true;
    }

    /// Return the slot to `Invalid`, discarding its data.
    pub fn invalidate(&mut self) {
        self.state.block = None;
        self.state.dirty = false;
        self.state.data.fill(0);
        self.publish(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> SlotTable {
        SlotTable::new(
            NonZeroUsize::new(capacity).expect("non-zero"),
            BlockSize::new(4).expect("bs"),
        )
    }

    #[test]
    fn new_slots_are_invalid() {
        let t = table(3);
        assert_eq!(t.capacity(), 3);
        assert!(t.resident_blocks().is_empty());
        for snap in t.snapshot() {
            assert_eq!(snap.status, SlotStatus::Invalid);
            assert_eq!(snap.block, None);
        }
        assert_eq!(t.find(BlockNumber(0)), None);
        assert_eq!(t.find(BlockNumber(u64::MAX)), None);
    }

    #[test]
    fn install_publishes_block() {
        let t = table(4);
        {
            let mut guard = t.lock(SlotIndex(2));
            guard.install(BlockNumber(42));
            guard.fill(&[1, 2, 3, 4]).expect("fill");
        }
        assert_eq!(t.find(BlockNumber(42)), Some(SlotIndex(2)));
        let guard = t.lock(SlotIndex(2));
        assert_eq!(guard.block(), Some(BlockNumber(42)));
        assert_eq!(guard.status(), SlotStatus::Clean);
        assert_eq!(guard.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn reinstall_clears_dirty_flag() {
        let t = table(1);
        let mut guard = t.lock(SlotIndex(0));
        guard.install(BlockNumber(5));
        guard.mark_dirty();
        assert_eq!(guard.status(), SlotStatus::Dirty);
        guard.install(BlockNumber(6));
        assert_eq!(guard.status(), SlotStatus::Clean);
        guard.mark_dirty();
        drop(guard);
        assert_eq!(t.dirty_count(), 1);
    }

    #[test]
    fn published_tag_leads_installed_block() {
        let t = table(2);
        let mut guard = t.lock(SlotIndex(1));
        guard.install(BlockNumber(3));
        guard.publish(Some(BlockNumber(9)));
        // Lookups already route to the slot, but the contents are still block 3.
        assert_eq!(t.find(BlockNumber(9)), Some(SlotIndex(1)));
        assert_eq!(t.find(BlockNumber(3)), None);
        assert_eq!(guard.block(), Some(BlockNumber(3)));
        guard.install(BlockNumber(9));
        assert_eq!(guard.block(), Some(BlockNumber(9)));
    }

    #[test]
    fn evicting_block_stays_findable() {
        let t = table(2);
        let guard = t.lock(SlotIndex(0));
        guard.publish(Some(BlockNumber(8)));
        guard.begin_eviction(BlockNumber(7));
        assert_eq!(t.find(BlockNumber(7)), Some(SlotIndex(0)));
        assert_eq!(t.find(BlockNumber(8)), Some(SlotIndex(0)));
        guard.end_eviction();
        assert_eq!(t.find(BlockNumber(7)), None);
    }

    #[test]
    fn invalidate_clears_everything() {
        let t = table(1);
        let mut guard = t.lock(SlotIndex(0));
        guard.install(BlockNumber(1));
        guard.fill(&[9; 4]).expect("fill");
        guard.mark_dirty();
        guard.invalidate();
        assert_eq!(guard.status(), SlotStatus::Invalid);
        assert_eq!(guard.data(), &[0; 4]);
        drop(guard);
        assert_eq!(t.find(BlockNumber(1)), None);
        assert!(t.resident_blocks().is_empty());
    }

    #[test]
    fn fill_rejects_wrong_length() {
        let t = table(1);
        let mut guard = t.lock(SlotIndex(0));
        assert!(guard.fill(&[1, 2, 3]).is_err());
        assert_eq!(guard.data(), &[0; 4]);
    }

    #[test]
    fn slot_locks_are_independent() {
        let t = table(2);
        let a = t.lock(SlotIndex(0));
        let b = t.lock(SlotIndex(1));
        assert_eq!(a.index(), SlotIndex(0));
        assert_eq!(b.index(), SlotIndex(1));
    }
}
