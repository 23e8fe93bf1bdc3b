use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts the leases executing on this worker.
///
/// The counter stays within `[0, max_concurrent]` under any interleaving of
/// increments and decrements: an increment at the limit and a decrement at
/// zero are refused rather than wrapping.
///
/// Once draining, the tracker still counts in-flight leases but advertises no
/// free slots, so the control plane stops placing work here.
#[derive(Debug)]
pub struct NodeCapacityTracker {
    active: AtomicUsize,
    max_concurrent: usize,
    draining: AtomicBool,
    slot_freed: Notify,
}

impl NodeCapacityTracker {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max_concurrent,
            draining: AtomicBool::new(false),
            slot_freed: Notify::new(),
        }
    }

    /// Stop advertising capacity. Returns true on the first call.
    pub fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Free slots as reported to the control plane: zero while draining.
    pub fn advertised_slots(&self) -> usize {
        if self.is_draining() {
            0
        } else {
            self.get_available_slots()
        }
    }

    /// Returns false when every slot is already taken.
    pub fn increment_active_leases(&self) -> bool {
        let max = self.max_concurrent;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Returns false when there was nothing to release.
    pub fn decrement_active_leases(&self) -> bool {
        let released = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.slot_freed.notify_waiters();
        }
        released
    }

    pub fn get_active_leases(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn get_available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.get_active_leases())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wait until at least one slot is free.
    pub async fn wait_for_slot(&self) {
        loop {
            let freed = self.slot_freed.notified();
            if self.get_available_slots() > 0 {
                return;
            }
            freed.await;
        }
    }
}
