//! Per-CPU one-shot software timers
//!
//! Each CPU owns a [`TimerWheel`]: a deadline-ordered set of one-shot
//! timers driven by the platform timer interrupt. All operations run with
//! the owning CPU's timer lock held; callbacks execute in interrupt context
//! and must not block or call back into the scheduler — they report via
//! their return value whether the interrupt-return path should reschedule.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::BTreeMap;

use crate::error::SchedError;

/// Monotonically increasing counter for assigning unique timer ids.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

impl TimerId {
    fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Timer expiry callback.
///
/// Plain function pointer so entries need no allocation; runs in interrupt
/// context and returns whether a reschedule is required.
pub type TimerCallback = fn(TimerId) -> bool;

/// Deadline-ordered one-shot timers for a single CPU.
pub struct TimerWheel {
    /// Pending timers keyed by (absolute deadline in µs, id) so equal
    /// deadlines stay ordered and unique.
    pending: BTreeMap<(u64, u64), TimerCallback>,
}

impl TimerWheel {
    /// Create an empty wheel.
    pub const fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    /// Arm a one-shot timer `relative_us` microseconds from `now`.
    pub fn set(&mut self, now: u64, relative_us: u64, callback: TimerCallback) -> TimerId {
        let id = TimerId::next();
        self.pending.insert((now + relative_us, id.0), callback);
        id
    }

    /// Cancel a pending timer.
    pub fn cancel(&mut self, id: TimerId) -> Result<(), SchedError> {
        let key = self
            .pending
            .keys()
            .find(|&&(_, raw)| raw == id.0)
            .copied()
            .ok_or(SchedError::TimerNotFound)?;
        self.pending.remove(&key);
        Ok(())
    }

    /// Expire every timer whose deadline is at or before `now`, invoking
    /// callbacks in deadline order. Returns whether any callback requested
    /// a reschedule. Each timer fires exactly once.
    pub fn expire(&mut self, now: u64) -> bool {
        let mut preempt = false;
        while let Some((&(deadline, raw), _)) = self.pending.iter().next() {
            if deadline > now {
                break;
            }
            let callback = self
                .pending
                .remove(&(deadline, raw))
                .expect("timer vanished under its lock");
            if callback(TimerId(raw)) {
                preempt = true;
            }
        }
        preempt
    }

    /// Number of timers waiting to fire.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deadline of the next timer to fire, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.keys().next().map(|&(deadline, _)| deadline)
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
