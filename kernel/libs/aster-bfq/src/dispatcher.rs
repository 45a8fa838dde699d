// SPDX-License-Identifier: MPL-2.0

//! Dispatcher & idling-timer bookkeeping (§4.4, §5).
//!
//! A single per-device idling timer exists at any time; arming, canceling
//! and firing it are modeled here as plain state transitions, leaving the
//! actual timer/callback mechanism (a kernel `hrtimer` in the real driver)
//! to the external glue. `hrtimer_try_to_cancel` semantics are required of
//! that glue: cancellation must be best-effort without waiting for a
//! concurrently firing callback, so [`IdleTimer::fire`] re-checks identity
//! before expiring anything (§5 "Suspension points").

use crate::{id::QueueId, time::Nanos};

/// The device's single idling timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdleTimer {
    armed_for: Option<QueueId>,
    deadline_ns: Nanos,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed_for.is_some()
    }

    pub fn armed_for(&self) -> Option<QueueId> {
        self.armed_for
    }

    pub fn arm(&mut self, queue: QueueId, now: Nanos, slice_idle_ns: u64) {
        self.armed_for = Some(queue);
        self.deadline_ns = now.saturating_add(slice_idle_ns);
    }

    /// Best-effort cancel: clears the armed state regardless of whether a
    /// callback is concurrently firing. The external glue's
    /// `hrtimer_try_to_cancel` equivalent must not block on that callback;
    /// [`Self::fire`] is the structural guard against the resulting race.
    pub fn cancel(&mut self) {
        self.armed_for = None;
    }

    /// Called when the timer callback actually runs. Returns `Some(queue)`
    /// only if the timer is still armed for that queue and has reached its
    /// deadline by `now` — i.e. the fire did not lose a race against a
    /// cancellation or rearm that happened first.
    pub fn fire(&mut self, now: Nanos) -> Option<QueueId> {
        let queue = self.armed_for?;
        if now < self.deadline_ns {
            return None;
        }
        self.armed_for = None;
        Some(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::QueueId;

    #[test]
    fn fire_before_deadline_does_nothing() {
        let mut t = IdleTimer::new();
        t.arm(QueueId::from_raw(1), 0, 1_000);
        assert_eq!(t.fire(500), None);
    }

    #[test]
    fn fire_after_deadline_returns_queue_once() {
        let mut t = IdleTimer::new();
        t.arm(QueueId::from_raw(1), 0, 1_000);
        assert_eq!(t.fire(1_000), Some(QueueId::from_raw(1)));
        assert_eq!(t.fire(2_000), None);
    }

    #[test]
    fn cancel_races_safely_against_a_pending_fire() {
        let mut t = IdleTimer::new();
        t.arm(QueueId::from_raw(1), 0, 1_000);
        t.cancel();
        assert_eq!(t.fire(1_000), None);
    }
}
