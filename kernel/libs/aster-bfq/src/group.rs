// SPDX-License-Identifier: MPL-2.0

//! Inner entities: groups compose child entities (queues or nested groups)
//! into a tree via per-node service trees (§3 Group).

use crate::{
    id::{EntityId, GroupId, QueueId},
    prelude::*,
    prio::IoPrioClass,
    sched_data::SchedNode,
    time::Sector,
};

/// An inner entity. Holds one service tree per priority class (via
/// [`SchedNode`]), the per-priority async-queue slots used to coalesce
/// async requests from different processes at the same priority, and the
/// position tree used by cooperator lookup (§4.7), keyed by each child
/// queue's next-request sector.
pub struct Group {
    pub id: GroupId,
    /// The entity representing this group in its parent's service tree.
    /// `None` for the permanent root group, which is not itself scheduled.
    pub entity: Option<EntityId>,
    pub parent: Option<GroupId>,

    pub sched: SchedNode,

    /// One shared async queue per priority class, looked up instead of
    /// creating a new queue for each async-submitting process.
    pub async_queues: [Option<QueueId>; IoPrioClass::COUNT],

    /// Cooperator lookup index: next-request sector -> queue, for every
    /// busy queue that is a direct child of this group.
    position_tree: BTreeMap<Sector, QueueId>,
}

impl Group {
    pub fn new_root() -> Self {
        Self {
            id: GroupId::from_raw(0),
            entity: None,
            parent: None,
            sched: SchedNode::new(),
            async_queues: [None; IoPrioClass::COUNT],
            position_tree: BTreeMap::new(),
        }
    }

    pub fn new_child(id: GroupId, entity: EntityId, parent: GroupId) -> Self {
        Self {
            id,
            entity: Some(entity),
            parent: Some(parent),
            sched: SchedNode::new(),
            async_queues: [None; IoPrioClass::COUNT],
            position_tree: BTreeMap::new(),
        }
    }

    pub fn async_queue(&self, class: IoPrioClass) -> Option<QueueId> {
        self.async_queues[class.index()]
    }

    pub fn set_async_queue(&mut self, class: IoPrioClass, queue: QueueId) {
        self.async_queues[class.index()] = Some(queue);
    }

    /// Registers (or re-registers) `queue`'s position under its current
    /// next-request sector, for cooperator lookup (§4.7).
    pub fn set_position(&mut self, sector: Sector, queue: QueueId) {
        self.position_tree.insert(sector, queue);
    }

    pub fn remove_position(&mut self, sector: Sector, queue: QueueId) {
        if self.position_tree.get(&sector) == Some(&queue) {
            self.position_tree.remove(&sector);
        }
    }

    /// Finds the queue whose next-request sector lies within `close_thr` of
    /// `sector`, other than `exclude`, preferring the closest candidate.
    pub fn find_close_queue(&self, sector: Sector, close_thr: u64, exclude: QueueId) -> Option<QueueId> {
        let before = self
            .position_tree
            .range(..=sector)
            .next_back()
            .filter(|(pos, _)| sector - **pos <= close_thr);
        let after = self
            .position_tree
            .range(sector..)
            .next()
            .filter(|(pos, _)| **pos - sector <= close_thr);

        [before, after]
            .into_iter()
            .flatten()
            .map(|(pos, q)| (sector.abs_diff(*pos), *q))
            .filter(|(_, q)| *q != exclude)
            .min_by_key(|(dist, _)| *dist)
            .map(|(_, q)| q)
    }
}
