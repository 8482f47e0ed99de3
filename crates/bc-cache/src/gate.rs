//! Two-phase access gate.
//!
//! The gate alternates between a *concurrent* phase, in which any number of
//! threads may hold a [`ConcurrentPass`] and read the protected value, and an
//! *exclusive* phase, in which exactly one thread holds an [`ExclusivePass`]
//! and may mutate it. The two phases never overlap.
//!
//! ```text
//!            enter_concurrent (no exclusive pending)
//!   ┌──────────────────────────────────────┐
//!   ▼                                      │
//! Concurrent(n) ── leave_concurrent ──► Concurrent(n-1)
//!   │
//!   │ n == 0 && exclusive requested
//!   ▼
//! Exclusive ── leave_exclusive ──► Concurrent(0)
//! ```
//!
//! # Fairness
//!
//! Exclusive requests win. As soon as one thread waits in
//! [`AccessGate::enter_exclusive`], new concurrent entries block until every
//! pending exclusive request has been served. Occupants already inside the
//! concurrent phase are never interrupted, so the wait for zero occupancy is
//! bounded by the longest in-flight concurrent section. Exclusive sections are
//! short and the number of pending exclusive requests is bounded by the number
//! of threads, so concurrent entrants cannot starve either.
//!
//! # Reentrancy
//!
//! The gate is not reentrant. A thread holding a pass must drop it before
//! entering again; holding a concurrent pass while waiting for another one
//! deadlocks as soon as an exclusive request is pending.

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Current phase of an [`AccessGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `n` threads are inside the concurrent phase.
    Concurrent(usize),
    /// One thread holds exclusive ownership.
    Exclusive,
}

/// Lifetime counters of an [`AccessGate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    /// Concurrent passes granted.
    pub concurrent_entries: u64,
    /// Exclusive passes granted.
    pub exclusive_entries: u64,
    /// Concurrent entries that had to block first.
    pub concurrent_waits: u64,
    /// Exclusive entries that had to block first.
    pub exclusive_waits: u64,
}

#[derive(Debug)]
struct GateState {
    phase: Phase,
    exclusive_pending: usize,
    concurrent_blocked: usize,
    stats: GateStats,
}

/// Occupancy before admitting one more concurrent entrant, or `None` while
/// the gate is exclusive or an exclusive request is pending.
fn admitted_occupancy(state: &GateState) -> Option<usize> {
    match state.phase {
        Phase::Concurrent(n) if state.exclusive_pending == 0 => Some(n),
        Phase::Concurrent(_) | Phase::Exclusive => None,
    }
}

/// Reader/exclusive phase barrier guarding a value of type `T`.
///
/// The value sits behind an `RwLock` only so that safe code can hand out
/// `&T` and `&mut T`. That lock is never contended: readers only exist while
/// concurrent passes are held, and a writer only exists while the single
/// exclusive pass is held.
#[derive(Debug)]
pub struct AccessGate<T> {
    state: Mutex<GateState>,
    /// Signalled when concurrent entries are admitted again.
    admit: Condvar,
    /// Signalled when the gate becomes available to an exclusive request.
    drained: Condvar,
    value: RwLock<T>,
}

impl<T> AccessGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(GateState {
                phase: Phase::Concurrent(0),
                exclusive_pending: 0,
                concurrent_blocked: 0,
                stats: GateStats::default(),
            }),
            admit: Condvar::new(),
            drained: Condvar::new(),
            value: RwLock::new(value),
        }
    }

    /// Join the concurrent phase, blocking while the gate is exclusive or an
    /// exclusive request is pending.
    pub fn enter_concurrent(&self) -> ConcurrentPass<'_, T> {
        let mut state = self.state.lock();
        let mut waited = false;
        let occupancy = loop {
            if let Some(n) = admitted_occupancy(&state) {
                break n;
            }
            if !waited {
                waited = true;
                state.concurrent_blocked += 1;
            }
            self.admit.wait(&mut state);
        };
        state.phase = Phase::Concurrent(occupancy + 1);
        state.stats.concurrent_entries += 1;
        if waited {
            state.concurrent_blocked -= 1;
            state.stats.concurrent_waits += 1;
        }
        trace!(
            target: "bc::gate",
            event = "enter_concurrent",
            occupants = occupancy + 1,
            waited
        );
        drop(state);
        ConcurrentPass { gate: self }
    }

    /// Take exclusive ownership, blocking until no thread is inside the
    /// concurrent phase and no other thread holds exclusive ownership.
    pub fn enter_exclusive(&self) -> ExclusivePass<'_, T> {
        let mut state = self.state.lock();
        state.exclusive_pending += 1;
        let mut waited = false;
        while state.phase != Phase::Concurrent(0) {
            waited = true;
            self.drained.wait(&mut state);
        }
        state.exclusive_pending -= 1;
        state.phase = Phase::Exclusive;
        state.stats.exclusive_entries += 1;
        if waited {
            state.stats.exclusive_waits += 1;
        }
        trace!(
            target: "bc::gate",
            event = "enter_exclusive",
            pending = state.exclusive_pending,
            waited
        );
        drop(state);
        ExclusivePass { gate: self }
    }

    fn leave_concurrent(&self) {
        let mut state = self.state.lock();
        let Phase::Concurrent(n) = state.phase else {
            debug_assert!(false, "concurrent pass released during exclusive phase");
            return;
        };
        let remaining = n.saturating_sub(1);
        state.phase = Phase::Concurrent(remaining);
        trace!(target: "bc::gate", event = "leave_concurrent", remaining);
        if remaining == 0 && state.exclusive_pending > 0 {
            self.drained.notify_one();
        }
    }

    fn leave_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.phase, Phase::Exclusive);
        state.phase = Phase::Concurrent(0);
        trace!(
            target: "bc::gate",
            event = "leave_exclusive",
            pending = state.exclusive_pending
        );
        if state.exclusive_pending > 0 {
            self.drained.notify_one();
        } else {
            self.admit.notify_all();
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Threads currently inside the concurrent phase.
    #[must_use]
    pub fn occupants(&self) -> usize {
        match self.phase() {
            Phase::Concurrent(n) => n,
            Phase::Exclusive => 0,
        }
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.phase() == Phase::Exclusive
    }

    /// Threads currently blocked in [`enter_exclusive`](Self::enter_exclusive).
    #[must_use]
    pub fn exclusive_pending(&self) -> usize {
        self.state.lock().exclusive_pending
    }

    /// Threads currently blocked in [`enter_concurrent`](Self::enter_concurrent).
    #[must_use]
    pub fn concurrent_blocked(&self) -> usize {
        self.state.lock().concurrent_blocked
    }

    #[must_use]
    pub fn stats(&self) -> GateStats {
        self.state.lock().stats
    }
}

/// Membership in the concurrent phase. Leaving happens on drop.
#[derive(Debug)]
#[must_use = "dropping the pass leaves the concurrent phase immediately"]
pub struct ConcurrentPass<'a, T> {
    gate: &'a AccessGate<T>,
}

impl<T> ConcurrentPass<'_, T> {
    /// Shared view of the protected value. Stable for the life of the pass.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.gate.value.read()
    }
}

impl<T> Drop for ConcurrentPass<'_, T> {
    fn drop(&mut self) {
        self.gate.leave_concurrent();
    }
}

/// Exclusive ownership of the gate. Released on drop, including unwinding.
#[derive(Debug)]
#[must_use = "dropping the pass leaves the exclusive phase immediately"]
pub struct ExclusivePass<'a, T> {
    gate: &'a AccessGate<T>,
}

impl<T> ExclusivePass<'_, T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.gate.value.read()
    }

    /// Mutable view of the protected value.
    pub fn write(&mut self) -> RwLockWriteGuard<'_, T> {
        self.gate.value.write()
    }
}

impl<T> Drop for ExclusivePass<'_, T> {
    fn drop(&mut self) {
        self.gate.leave_exclusive();
    }
}
