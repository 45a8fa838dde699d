// SPDX-License-Identifier: MPL-2.0

//! Cooperator merger (§4.7): queues whose next requests land close together
//! on the device are redirected to a single shared queue to preserve
//! sequentiality, and later split back apart if they drift.

use crate::{
    id::QueueId,
    queue::{Queue, QueueFlags},
    seek::SeekHistory,
    time::Nanos,
    weight_raising::WrState,
};

/// Seekyness threshold (population count of the seek-history window) above
/// which a queue is considered too seeky to be worth merging.
pub const SEEKY_THRESHOLD: u32 = SeekHistory::WINDOW_BITS / 2;

/// State saved at merge time so [`split`] can restore it later (§4.7
/// "restores the per-queue weight, idle-window, and burst-list membership
/// saved at merge time").
#[derive(Clone, Copy, Debug)]
pub struct CoopSnapshot {
    pub wr: WrState,
    pub idle_window: bool,
    pub in_burst: bool,
}

/// Whether `candidate` is eligible to merge into `target`, per §4.7's
/// eligibility list. Both queues must already share a parent and priority
/// class (enforced by the caller, since lookup happens through the shared
/// parent group's position tree) before this is checked.
pub fn is_merge_eligible(candidate: &Queue, target: &Queue, now: Nanos, wr_merge_block_ns: u64) -> bool {
    if candidate.is_oom() || target.is_oom() {
        return false;
    }
    if candidate.id == target.id {
        return false;
    }
    if !candidate.is_sync() || !target.is_sync() {
        return false;
    }
    if candidate.is_seeky(SEEKY_THRESHOLD) || target.is_seeky(SEEKY_THRESHOLD) {
        return false;
    }
    if wr_from_too_long(candidate, now, wr_merge_block_ns) || wr_from_too_long(target, now, wr_merge_block_ns) {
        return false;
    }
    if candidate.process_refs == 0 || target.process_refs == 0 {
        return false;
    }
    if candidate.is_merged() || target.is_merged() {
        return false;
    }
    true
}

fn wr_from_too_long(queue: &Queue, now: Nanos, wr_merge_block_ns: u64) -> bool {
    queue.wr.is_active() && queue.wr.elapsed(now) < wr_merge_block_ns
}

/// Merges `source` into `target`: redirects future requests, transfers the
/// process reference, inherits weight-raising if only the source had it,
/// and flags both as cooperating. Stashes the pre-merge state in
/// `source.coop_snapshot` for a later [`split`] to restore.
pub fn merge(source: &mut Queue, target: &mut Queue) {
    source.coop_snapshot = Some(CoopSnapshot {
        wr: source.wr,
        idle_window: source.flags.contains(QueueFlags::IDLE_WINDOW),
        in_burst: source.in_burst,
    });

    source.new_queue = Some(target.id);
    target.process_refs += source.process_refs;
    source.process_refs = 0;

    if source.wr.is_active() && !target.wr.is_active() {
        target.wr = source.wr;
    }

    target.flags |= QueueFlags::COOP;
    source.flags |= QueueFlags::COOP;
}

/// Reverses a merge: `queue` is split back out, restoring the state
/// captured at merge time in `queue.coop_snapshot`. A no-op if `queue` was
/// never the source of a merge.
pub fn split(queue: &mut Queue, former_target: QueueId) {
    debug_assert_eq!(queue.new_queue, Some(former_target));
    let Some(snapshot) = queue.coop_snapshot.take() else {
        return;
    };
    queue.new_queue = None;
    queue.process_refs = 1;
    queue.wr = snapshot.wr;
    queue.in_burst = snapshot.in_burst;
    queue.flags.set(QueueFlags::IDLE_WINDOW, snapshot.idle_window);
    queue.flags.remove(QueueFlags::COOP);
    queue.flags |= QueueFlags::SPLIT_COOP;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{group::Group, id::QueueId, request::Direction};

    fn new_queue(raw: usize, sync: bool) -> Queue {
        use crate::id::{EntityId, GroupId};
        let dir = if sync { Direction::Sync } else { Direction::Async };
        Queue::new(QueueId::from_raw(raw), EntityId::from_raw(raw), GroupId::from_raw(0), dir)
    }

    #[test]
    fn merge_then_split_restores_snapshot() {
        let mut q1 = new_queue(1, true);
        let mut q2 = new_queue(2, true);
        q1.flags.remove(QueueFlags::IDLE_WINDOW);
        let original_idle_window = q1.flags.contains(QueueFlags::IDLE_WINDOW);

        merge(&mut q1, &mut q2);
        assert_eq!(q1.new_queue, Some(q2.id));
        assert_eq!(q2.process_refs, 2);

        split(&mut q1, q2.id);
        assert_eq!(q1.new_queue, None);
        assert_eq!(q1.flags.contains(QueueFlags::IDLE_WINDOW), original_idle_window);
    }

    #[test]
    fn oom_queue_never_eligible() {
        let mut oom = new_queue(1, true);
        oom.flags |= QueueFlags::OOM;
        let other = new_queue(2, true);
        assert!(!is_merge_eligible(&oom, &other, 0, 0));
    }

    #[test]
    fn seeky_queue_is_not_eligible() {
        let mut seeky = new_queue(1, true);
        for _ in 0..32 {
            seeky.seek_history.push(true);
        }
        let other = new_queue(2, true);
        assert!(!is_merge_eligible(&seeky, &other, 0, 0));
    }

    #[test]
    fn position_tree_finds_close_queue_within_threshold() {
        let mut group = Group::new_root();
        group.set_position(1000, QueueId::from_raw(1));
        group.set_position(5000, QueueId::from_raw(2));
        let found = group.find_close_queue(1004, 8192, QueueId::from_raw(99));
        assert_eq!(found, Some(QueueId::from_raw(1)));
    }
}
