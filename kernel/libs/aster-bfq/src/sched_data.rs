// SPDX-License-Identifier: MPL-2.0

//! The per-scheduling-node service trees and B-WF2Q+ selection logic
//! (§4.1). One `SchedNode` lives at the scheduler root and one inside every
//! [`crate::group::Group`]; the hierarchy descent that turns "the next
//! entity at the root" into "the next leaf queue" lives in
//! [`crate::SchedulerData::get_next_queue`], which recurses through groups'
//! `SchedNode`s.

use crate::{
    entity::Entity,
    id::EntityId,
    prelude::*,
    prio::IoPrioClass,
    service_tree::{ServiceTree, TreeKey},
    time::{vtime_delta, VirtualTime},
};

/// Where an entity's new `start` timestamp comes from on activation (§4.1
/// `activate`).
#[derive(Clone, Copy, Debug)]
pub enum ActivationOrigin {
    /// First-ever activation, or reactivation long after the entity was
    /// last on a tree: start from the node's current system virtual time.
    Fresh,
    /// Reactivation shortly after expiration: start is the larger of the
    /// entity's finish time at the previous expiration and the node's
    /// system virtual time.
    ResumedFrom(VirtualTime),
    /// Weight-raised entity reactivating after a brief idle period: the
    /// timestamps are back-shifted to the values they had the last time the
    /// entity was selected in-service, so the gap does not cost it service
    /// (§4.1 "hole recovery").
    HoleRecovery,
}

/// One scheduling node's per-priority-class active/idle trees.
pub struct SchedNode {
    trees: [ServiceTree; IoPrioClass::COUNT],
    pub system_vtime: VirtualTime,
    seq: u64,
}

impl Default for SchedNode {
    fn default() -> Self {
        Self {
            trees: core::array::from_fn(|_| ServiceTree::new()),
            system_vtime: VirtualTime::ZERO,
            seq: 0,
        }
    }
}

impl SchedNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn tree(&self, class: IoPrioClass) -> &ServiceTree {
        &self.trees[class.index()]
    }

    pub fn tree_mut(&mut self, class: IoPrioClass) -> &mut ServiceTree {
        &mut self.trees[class.index()]
    }

    pub fn busy_count(&self) -> usize {
        self.trees.iter().map(ServiceTree::active_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.iter().all(ServiceTree::is_empty)
    }

    /// `activate(entity)`: computes the new start/finish and inserts the
    /// entity into its class's active tree.
    pub fn activate(&mut self, entity: &mut Entity, origin: ActivationOrigin) {
        let class = entity.class;
        if entity.on_idle_tree {
            self.trees[class.index()].remove_idle(entity.id);
            entity.on_idle_tree = false;
        }
        entity.start = match origin {
            ActivationOrigin::Fresh => self.system_vtime,
            ActivationOrigin::ResumedFrom(prev_finish) => prev_finish.max(self.system_vtime),
            ActivationOrigin::HoleRecovery => entity.last_selected_start.max(self.system_vtime),
        };
        entity.recompute_finish();
        entity.activation_seq = self.next_seq();
        let key = TreeKey::new(entity.finish, entity.start, class, entity.activation_seq);
        self.trees[class.index()].insert_active(key, entity.id);
        entity.on_active_tree = true;
        self.system_vtime = self.system_vtime.max(entity.start);
    }

    /// `expire(entity, remaining_budget, charged_service)`: removes the
    /// entity from the active tree; if `has_more_work` is false it moves to
    /// the idle tree, otherwise it is reactivated in place with the
    /// remaining budget. `charged_service` is the (possibly time-scaled,
    /// §4.6) sectors the entity is charged for this activation; its `start`
    /// advances by the vtime-equivalent of that charge rather than jumping
    /// straight to the old `finish`, so a slow/seeky queue charged more than
    /// it actually transferred is pushed back further, while a queue charged
    /// its true (small) service keeps its elasticity.
    pub fn expire(
        &mut self,
        entity: &mut Entity,
        remaining_budget: u64,
        charged_service: u64,
        has_more_work: bool,
    ) {
        let class = entity.class;
        self.trees[class.index()].remove_active(entity.id);
        entity.on_active_tree = false;

        if !has_more_work {
            let key = TreeKey::new(entity.finish, entity.start, class, entity.activation_seq);
            self.trees[class.index()].insert_idle(key, entity.id);
            entity.on_idle_tree = true;
            return;
        }

        let weight = entity.weight.max(1);
        entity.start = entity.start.saturating_add(vtime_delta(charged_service, weight));
        entity.budget = remaining_budget;
        entity.recompute_finish();
        entity.activation_seq = self.next_seq();
        let key = TreeKey::new(entity.finish, entity.start, class, entity.activation_seq);
        self.trees[class.index()].insert_active(key, entity.id);
        entity.on_active_tree = true;
    }

    /// Removes `entity` from whichever tree holds it, without reactivating
    /// it (used when an entity loses all children/requests and is torn
    /// down rather than idled).
    pub fn remove(&mut self, entity: &mut Entity) {
        let class = entity.class;
        if entity.on_active_tree {
            self.trees[class.index()].remove_active(entity.id);
            entity.on_active_tree = false;
        }
        if entity.on_idle_tree {
            self.trees[class.index()].remove_idle(entity.id);
            entity.on_idle_tree = false;
        }
    }

    /// `get_next()` in strict-guarantees mode: classes are served strictly
    /// RT, then BE, then IDLE.
    pub fn get_next_strict(&self) -> Option<(IoPrioClass, EntityId)> {
        for class in IoPrioClass::ALL {
            if let Some((_, id)) = self.trees[class.index()].get_next(self.system_vtime) {
                return Some((class, id));
            }
        }
        None
    }

    /// `get_next()` under normal WF2Q+ eligibility: the globally smallest
    /// eligible finish time among all classes, letting classes interleave
    /// subject to weight.
    pub fn get_next_weighted(&self) -> Option<(IoPrioClass, EntityId)> {
        IoPrioClass::ALL
            .into_iter()
            .filter_map(|class| {
                self.trees[class.index()]
                    .get_next(self.system_vtime)
                    .map(|(key, id)| (key, class, id))
            })
            .min_by_key(|(key, _, _)| *key)
            .map(|(_, class, id)| (class, id))
    }

    /// Garbage-collects every idle entity whose finish time is already in
    /// the past, across all classes ("forget idle").
    pub fn forget_idle_all(&mut self) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for class in IoPrioClass::ALL {
            ids.extend(self.trees[class.index()].forget_idle(self.system_vtime));
        }
        ids
    }

    /// The minimum eligible finish time across all classes, used by the
    /// invariant check that the in-service entity has minimum eligible
    /// finish at every level (§8 property 3).
    pub fn min_eligible_finish(&self) -> Option<VirtualTime> {
        IoPrioClass::ALL
            .into_iter()
            .filter_map(|class| self.trees[class.index()].get_next(self.system_vtime))
            .map(|(key, _)| key.finish)
            .min()
    }
}
