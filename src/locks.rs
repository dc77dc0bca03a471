//! Per-slot-offset mutual exclusion.
//!
//! Foreground operations lock every candidate slot of a key for their whole
//! duration; the cleaner locks contiguous slot ranges. Both go through
//! [`LockManager::lock_all`], which acquires in ascending offset order —
//! the only ordering under which the two cannot deadlock.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

struct LockState {
    locked: HashSet<u64>,
    shutdown: bool,
}

pub(crate) struct LockManager {
    state: Mutex<LockState>,
    available: Condvar,
}

impl LockManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState {
                locked: HashSet::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Block until the slot is exclusively held. Returns `false` if the
    /// store shut down while waiting.
    pub(crate) fn lock_slot(&self, offset: u64) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return false;
            }
            if state.locked.insert(offset) {
                return true;
            }
            self.available.wait(&mut state);
        }
    }

    pub(crate) fn unlock_slot(&self, offset: u64) {
        let mut state = self.state.lock();
        let was_locked = state.locked.remove(&offset);
        debug_assert!(was_locked, "unlock of offset {offset} not held");
        self.available.notify_all();
    }

    /// Lock a set of offsets in ascending order, releasing everything and
    /// returning `None` if shutdown begins mid-acquisition. Duplicates are
    /// collapsed.
    pub(crate) fn lock_all(
        self: &Arc<Self>,
        offsets: impl IntoIterator<Item = u64>,
    ) -> Option<SlotGuard> {
        let wanted: BTreeSet<u64> = offsets.into_iter().collect();
        let mut held = Vec::with_capacity(wanted.len());
        for &offset in &wanted {
            if !self.lock_slot(offset) {
                for &locked in &held {
                    self.unlock_slot(locked);
                }
                return None;
            }
            held.push(offset);
        }
        Some(SlotGuard {
            manager: Arc::clone(self),
            offsets: held,
        })
    }

    /// Unblock all pending and future lockers with failure.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.available.notify_all();
    }
}

/// Holds a set of slot locks; released on drop.
pub(crate) struct SlotGuard {
    manager: Arc<LockManager>,
    offsets: Vec<u64>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        for &offset in &self.offsets {
            self.manager.unlock_slot(offset);
        }
    }
}

// One store per process may run heavy batch maintenance at a time. Never
// held across anything but the cleaner's own sweep.
static MAINTENANCE_LATCH: Mutex<()> = Mutex::new(());

/// Try to take the process-wide maintenance latch. Never blocks; contention
/// means another store instance is sweeping, so skip this cycle.
pub(crate) fn try_maintenance_latch() -> Option<MutexGuard<'static, ()>> {
    MAINTENANCE_LATCH.try_lock()
}
