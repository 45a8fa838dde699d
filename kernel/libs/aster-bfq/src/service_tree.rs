// SPDX-License-Identifier: MPL-2.0

//! Per-priority-class ordered collections keyed by virtual finish time
//! (§4.1 "Service Tree and Entity Scheduler").
//!
//! Open Question resolution (SPEC_FULL §5.1): a true augmented tree caching
//! each subtree's minimum start time would need rotation hooks that neither
//! `alloc::collections::BTreeMap` nor `intrusive-collections` expose. This
//! is implemented instead as a `BTreeMap` keyed by `(finish, start, class,
//! activation_seq)`, ordered ascending by finish time. `get_next` scans that
//! ascending order and skips entities whose `start` is still in the future
//! relative to the system virtual time; because virtual time never goes
//! backwards, this always terminates and always returns the eligible entity
//! with the smallest finish time, at a cost of O(k) instead of O(log n) when
//! many ineligible entities happen to sort before the eligible minimum.

use crate::{id::EntityId, prelude::*, prio::IoPrioClass, time::VirtualTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TreeKey {
    pub finish: VirtualTime,
    pub start: VirtualTime,
    pub class: u8,
    pub activation_seq: u64,
}

impl TreeKey {
    pub fn new(finish: VirtualTime, start: VirtualTime, class: IoPrioClass, activation_seq: u64) -> Self {
        Self {
            finish,
            start,
            class: class.index() as u8,
            activation_seq,
        }
    }
}

/// One class's active/idle trees at a single scheduling node (the root
/// group or an inner group).
#[derive(Debug, Default)]
pub struct ServiceTree {
    active: BTreeMap<TreeKey, EntityId>,
    active_keys: BTreeMap<EntityId, TreeKey>,
    idle: BTreeMap<TreeKey, EntityId>,
    idle_keys: BTreeMap<EntityId, TreeKey>,
}

impl ServiceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_active(&mut self, key: TreeKey, id: EntityId) {
        self.active.insert(key, id);
        self.active_keys.insert(id, key);
    }

    pub fn remove_active(&mut self, id: EntityId) -> Option<TreeKey> {
        let key = self.active_keys.remove(&id)?;
        self.active.remove(&key);
        Some(key)
    }

    pub fn insert_idle(&mut self, key: TreeKey, id: EntityId) {
        self.idle.insert(key, id);
        self.idle_keys.insert(id, key);
    }

    pub fn remove_idle(&mut self, id: EntityId) -> Option<TreeKey> {
        let key = self.idle_keys.remove(&id)?;
        self.idle.remove(&key);
        Some(key)
    }

    pub fn contains_active(&self, id: EntityId) -> bool {
        self.active_keys.contains_key(&id)
    }

    pub fn contains_idle(&self, id: EntityId) -> bool {
        self.idle_keys.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// The eligible entity (`start <= vtime`) with the smallest finish time,
    /// if any. This is the WF2Q+ selection rule at a single scheduling node.
    pub fn get_next(&self, vtime: VirtualTime) -> Option<(TreeKey, EntityId)> {
        self.active
            .iter()
            .find(|(key, _)| key.start <= vtime)
            .map(|(key, id)| (*key, *id))
    }

    /// The minimum start time among active entities, used by invariant
    /// checks (§8 property 3) and by `activate`'s `system vtime` input.
    pub fn min_start(&self) -> Option<VirtualTime> {
        self.active.keys().map(|k| k.start).min()
    }

    /// Moves every idle entity whose finish time has already passed out of
    /// the idle tree ("forget idle", §4.1), returning their ids.
    pub fn forget_idle(&mut self, vtime: VirtualTime) -> Vec<EntityId> {
        let expired: Vec<TreeKey> = self
            .idle
            .range(..TreeKey::new(vtime, VirtualTime::ZERO, IoPrioClass::Rt, 0))
            .map(|(k, _)| *k)
            .collect();
        let mut ids = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(id) = self.idle.remove(&key) {
                self.idle_keys.remove(&id);
                ids.push(id);
            }
        }
        ids
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (TreeKey, EntityId)> + '_ {
        self.active.iter().map(|(k, v)| (*k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EntityId;

    fn id(raw: usize) -> EntityId {
        // EntityId has no public constructor outside the crate; tests live
        // inside the crate so `from_raw` is visible.
        EntityId::from_raw(raw)
    }

    #[test]
    fn get_next_picks_smallest_eligible_finish() {
        let mut tree = ServiceTree::new();
        tree.insert_active(
            TreeKey::new(VirtualTime::new(50), VirtualTime::new(10), IoPrioClass::Be, 1),
            id(1),
        );
        tree.insert_active(
            TreeKey::new(VirtualTime::new(30), VirtualTime::new(10), IoPrioClass::Be, 2),
            id(2),
        );
        let (_, next) = tree.get_next(VirtualTime::new(100)).unwrap();
        assert_eq!(next, id(2));
    }

    #[test]
    fn get_next_skips_ineligible_entities() {
        let mut tree = ServiceTree::new();
        // Smaller finish, but not yet eligible (start is in the future).
        tree.insert_active(
            TreeKey::new(VirtualTime::new(10), VirtualTime::new(1000), IoPrioClass::Be, 1),
            id(1),
        );
        tree.insert_active(
            TreeKey::new(VirtualTime::new(50), VirtualTime::new(10), IoPrioClass::Be, 2),
            id(2),
        );
        let (_, next) = tree.get_next(VirtualTime::new(100)).unwrap();
        assert_eq!(next, id(2));
    }

    #[test]
    fn forget_idle_removes_only_past_entities() {
        let mut tree = ServiceTree::new();
        tree.insert_idle(
            TreeKey::new(VirtualTime::new(5), VirtualTime::new(0), IoPrioClass::Be, 1),
            id(1),
        );
        tree.insert_idle(
            TreeKey::new(VirtualTime::new(500), VirtualTime::new(0), IoPrioClass::Be, 2),
            id(2),
        );
        let forgotten = tree.forget_idle(VirtualTime::new(100));
        assert_eq!(forgotten, vec![id(1)]);
        assert!(tree.contains_idle(id(2)));
    }
}
