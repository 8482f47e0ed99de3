//! Least-to-most-recently-used ordering over slot indices.

use bc_types::SlotIndex;
use std::num::NonZeroUsize;

/// Recency order of every cache slot.
///
/// `order[0]` is the least recently used slot (the next victim) and the last
/// element is the most recently used. The order is always a permutation of
/// `0..capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecencyTracker {
    order: Vec<SlotIndex>,
}

impl RecencyTracker {
    /// Tracker over `capacity` slots, initially ordered by index.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            order: (0..capacity.get()).map(SlotIndex).collect(),
        }
    }

    /// Least recently used slot.
    #[must_use]
    pub fn victim(&self) -> SlotIndex {
        // Non-empty by construction.
        self.order.first().copied().unwrap_or(SlotIndex(0))
    }

    /// Least recently used slot accepted by `eligible`, or [`victim`](Self::victim)
    /// when no slot is.
    #[must_use]
    pub fn victim_where(&self, mut eligible: impl FnMut(SlotIndex) -> bool) -> SlotIndex {
        self.order
            .iter()
            .copied()
            .find(|&slot| eligible(slot))
            .unwrap_or_else(|| self.victim())
    }

    /// Move `slot` to the most recently used position.
    ///
    /// Unknown indices are ignored so the order stays a permutation.
    pub fn mark_used(&mut self, slot: SlotIndex) {
        let Some(pos) = self.order.iter().position(|&s| s == slot) else {
            return;
        };
        if pos + 1 == self.order.len() {
            return;
        }
        let moved = self.order.remove(pos);
        self.order.push(moved);
    }

    /// Order from least to most recently used.
    #[must_use]
    pub fn order(&self) -> &[SlotIndex] {
        &self.order
    }

    /// Whether the order holds every index in `0..capacity` exactly once.
    #[must_use]
    pub fn is_permutation(&self) -> bool {
        let mut seen = vec![false; self.order.len()];
        for slot in &self.order {
            match seen.get_mut(slot.get()) {
                Some(flag) if !*flag => *flag = true,
                _ => return false,
            }
        }
        true
    }
}
