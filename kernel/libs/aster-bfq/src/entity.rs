// SPDX-License-Identifier: MPL-2.0

//! The schedulable unit: a leaf `Queue` or an inner `Group` (§3 Entity).

use crate::{
    id::{EntityId, GroupId, QueueId},
    prio::IoPrioClass,
    time::{vtime_delta, VirtualTime},
};

/// What an entity's back-pointer refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Queue(QueueId),
    Group(GroupId),
}

/// A schedulable entity: either a leaf queue or an inner group.
///
/// Invariants maintained by [`crate::service_tree::ServiceTree`] and
/// [`crate::sched_data::SchedNode`] rather than by this struct in isolation:
/// `service <= budget` while on a tree, and
/// `finish == start + budget / effective_weight`.
#[derive(Clone, Debug)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub parent: Option<GroupId>,
    pub class: IoPrioClass,

    /// Current weight (raised or baseline).
    pub weight: u32,
    /// Weight before any weight-raising multiplier was applied.
    pub orig_weight: u32,

    pub on_active_tree: bool,
    pub on_idle_tree: bool,

    pub start: VirtualTime,
    pub finish: VirtualTime,

    /// Sectors this activation may serve.
    pub budget: u64,
    /// Sectors served so far during this activation.
    pub service: u64,

    /// Start/finish as of the last time this entity was selected
    /// in-service, used for the weight-raising "hole recovery" back-shift on
    /// reactivation after a brief idle period (§4.1 `expire`).
    pub last_selected_start: VirtualTime,
    pub last_selected_finish: VirtualTime,

    /// Monotonically increasing counter stamped at each (re)activation,
    /// breaking ties among entities with equal finish and start time
    /// (§4.1 tie-break rule, "then by insertion order").
    pub activation_seq: u64,
}

impl Entity {
    pub fn new(id: EntityId, kind: EntityKind, parent: Option<GroupId>, class: IoPrioClass, weight: u32) -> Self {
        Self {
            id,
            kind,
            parent,
            class,
            weight,
            orig_weight: weight,
            on_active_tree: false,
            on_idle_tree: false,
            start: VirtualTime::ZERO,
            finish: VirtualTime::ZERO,
            budget: 0,
            service: 0,
            last_selected_start: VirtualTime::ZERO,
            last_selected_finish: VirtualTime::ZERO,
            activation_seq: 0,
        }
    }

    /// Recomputes `finish` from the current `start`, `budget` and `weight`.
    pub fn recompute_finish(&mut self) {
        self.finish = self.start + vtime_delta(self.budget, self.weight);
    }

    /// Remaining budget for this activation.
    pub fn remaining_budget(&self) -> u64 {
        self.budget.saturating_sub(self.service)
    }

    pub fn is_weight_raised(&self) -> bool {
        self.weight > self.orig_weight
    }
}
