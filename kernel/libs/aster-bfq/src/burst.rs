// SPDX-License-Identifier: MPL-2.0

//! Burst detection (§4.5): suppresses weight-raising for temporally
//! clustered queue creations sharing a parent group ("flash storms").

use crate::{
    id::{GroupId, QueueId},
    prelude::*,
};

/// Tracks recently created queues sharing a parent, to detect a burst of
/// queue creations.
#[derive(Default)]
pub struct BurstDetector {
    recent: Vec<(QueueId, GroupId)>,
    last_insert_ns: u64,
    /// Once a large burst has been recognized, the device stays in
    /// "large-burst mode": later-arriving queues past the interval are
    /// flagged directly on creation rather than needing to refill the list.
    in_large_burst_mode: bool,
}

/// Outcome of [`BurstDetector::on_queue_created`].
#[derive(Debug, PartialEq, Eq)]
pub enum BurstOutcome {
    /// The queue joined the tracked list; no burst (yet).
    Tracked,
    /// The queue was flagged directly because the device is already in
    /// large-burst mode.
    FlaggedImmediately,
    /// The list just reached the threshold: every listed queue (including
    /// this one) should be flagged `in_large_burst`, and the list is
    /// cleared.
    ThresholdReached(Vec<QueueId>),
}

impl BurstDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a new queue is created under `parent` at time `now`.
    pub fn on_queue_created(
        &mut self,
        queue: QueueId,
        parent: GroupId,
        now: u64,
        burst_interval_ns: u64,
        large_burst_thresh: u32,
    ) -> BurstOutcome {
        let within_interval = now.saturating_sub(self.last_insert_ns) <= burst_interval_ns;
        let shares_parent = self.recent.last().is_some_and(|(_, p)| *p == parent);

        if self.in_large_burst_mode && within_interval && shares_parent {
            self.last_insert_ns = now;
            return BurstOutcome::FlaggedImmediately;
        }

        if !within_interval || !shares_parent {
            self.recent.clear();
            self.in_large_burst_mode = false;
        }

        self.recent.push((queue, parent));
        self.last_insert_ns = now;

        if self.recent.len() as u32 >= large_burst_thresh {
            self.in_large_burst_mode = true;
            let flagged: Vec<QueueId> = self.recent.drain(..).map(|(q, _)| q).collect();
            BurstOutcome::ThresholdReached(flagged)
        } else {
            BurstOutcome::Tracked
        }
    }

    pub fn is_in_large_burst_mode(&self) -> bool {
        self.in_large_burst_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{GroupId, QueueId};

    fn qid(raw: usize) -> QueueId {
        QueueId::from_raw(raw)
    }
    fn gid(raw: usize) -> GroupId {
        GroupId::from_raw(raw)
    }

    #[test]
    fn ninth_queue_within_threshold_flags_all_nine() {
        let mut det = BurstDetector::new();
        let parent = gid(1);
        let mut last = None;
        for i in 0..8 {
            last = Some(det.on_queue_created(qid(i), parent, (i as u64) * 10, 180_000_000, 8));
        }
        assert!(matches!(last, Some(BurstOutcome::ThresholdReached(ref v)) if v.len() == 8));

        // The 9th, arriving while in large-burst mode, is flagged immediately.
        let ninth = det.on_queue_created(qid(8), parent, 90, 180_000_000, 8);
        assert_eq!(ninth, BurstOutcome::FlaggedImmediately);
    }

    #[test]
    fn different_parent_resets_the_list() {
        let mut det = BurstDetector::new();
        det.on_queue_created(qid(0), gid(1), 0, 180_000_000, 8);
        let outcome = det.on_queue_created(qid(1), gid(2), 1, 180_000_000, 8);
        assert_eq!(outcome, BurstOutcome::Tracked);
    }

    #[test]
    fn late_arrival_resets_the_list() {
        let mut det = BurstDetector::new();
        det.on_queue_created(qid(0), gid(1), 0, 180_000_000, 8);
        let outcome = det.on_queue_created(qid(1), gid(1), 1_000_000_000, 180_000_000, 8);
        assert_eq!(outcome, BurstOutcome::Tracked);
    }
}
