// SPDX-License-Identifier: MPL-2.0

//! A proportional-share block-device I/O scheduler core, based on Budget
//! Fair Queueing (BFQ).
//!
//! [`SchedulerData`] is the per-device root (§3 "Scheduler-Data Root"): it
//! owns every [`Entity`], [`Queue`], [`Group`] and [`Request`] in arenas
//! addressed by small `Copy` ids (per the "cyclic/intrusive structures"
//! design note), and exposes the external interface of §6 — `insert_request`,
//! `merge`/`merged_request`/`merged_requests`/`allow_merge`, `dispatch`,
//! `activate_request`/`deactivate_request`/`completed_request`,
//! `init_icq`/`exit_icq`, `may_queue` and `forced_dispatch` — to the block
//! layer that embeds it. The kernel-side glue (request allocation, the
//! driver's own FIFO/dispatch lists, cgroup attachment) is an external
//! collaborator and out of scope for this crate; callers drive this root
//! from their own single per-device lock, matching §5's concurrency model.
//!
//! The crate is clock-agnostic (every entry point takes `now: Nanos`
//! explicitly) and has no timer of its own: [`SchedulerData::arm_idle_timer`]
//! tells the caller when to arm a real timer, and
//! [`SchedulerData::idle_timer_fired`] is how the caller reports it firing.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod burst;
mod coeff;
mod config;
mod cooperator;
mod dispatcher;
mod entity;
mod error;
mod expiration;
mod group;
mod id;
mod idling;
mod peak_rate;
mod prelude;
mod prio;
mod queue;
mod request;
mod sched_data;
mod seek;
mod stats;
mod time;
mod weight_raising;

pub use config::Config;
pub use error::{Error, Result};
pub use expiration::ExpireReason;
pub use id::{EntityId, GroupId, IoContextId, QueueId, RequestId};
pub use prio::{DeviceSpeed, IoPrioClass};
pub use request::{Direction, IoStruct, MergeDecision};
pub use stats::SchedulerStats;
pub use time::{Nanos, Sector};

use alloc::collections::BTreeSet;
use log::{debug, trace, warn};
use slab::Slab;

use crate::{
    burst::{BurstDetector, BurstOutcome},
    dispatcher::IdleTimer,
    entity::{Entity, EntityKind},
    expiration::{charge_service, is_slow, next_max_budget},
    group::Group,
    idling::{needs_idling_for_guarantees, should_idle, IdlingScenario},
    peak_rate::PeakRateEstimator,
    queue::{Queue, QueueFlags, QueueState},
    request::Request,
    sched_data::ActivationOrigin,
    seek::{is_seek, sdist, SEEK_THR_SECTORS},
    weight_raising::{interactive_duration_ms, predict_soft_rt_next_start},
};

/// Default weight assigned to a freshly created queue, absent any external
/// ioprio-to-weight mapping (that mapping is the block-layer glue's job,
/// §1 "out of scope").
pub const DEFAULT_WEIGHT: u32 = 100;

/// Seekyness population-count threshold above which a queue counts as
/// "seeky" (GLOSSARY), shared by the idling and cooperator decisions.
const SEEKY_THRESHOLD: u32 = seek::SeekHistory::WINDOW_BITS / 2;

/// Guard added on top of `slice_idle` when clamping the soft-rt next-start
/// predictor (§4.3); keeps the predicted deadline from landing exactly on
/// the idling window boundary.
const SOFT_RT_GUARD_NS: u64 = 1_000_000;

/// What a caller must do as a direct result of a [`SchedulerData`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MayQueue {
    /// Allocation must succeed; the in-service queue is `waiting` and needs
    /// this request to make progress (§6 `may_queue`).
    Must,
    May,
}

/// Per-process `icq` control block (§6 `init_icq`/`exit_icq`): owns the
/// pointer to this process's synchronous queue and the weight/class it was
/// created with. Async requests do not need one of these, since they share
/// a per-group, per-class queue looked up through [`Group::async_queue`].
struct IoContext {
    group: GroupId,
    weight: u32,
    class: IoPrioClass,
    sync_queue: Option<QueueId>,
}

/// The per-device scheduler root (§3 "Scheduler-Data Root").
pub struct SchedulerData {
    config: Config,

    entities: Slab<Entity>,
    queues: Slab<Queue>,
    groups: Slab<Group>,
    requests: Slab<Request>,
    io_contexts: Slab<IoContext>,

    root: GroupId,
    in_service: Option<QueueId>,
    oom_queue: QueueId,

    idle_timer: IdleTimer,
    burst: BurstDetector,
    peak_rate: PeakRateEstimator,

    rq_in_driver: u64,
    queued: u64,
    last_dispatch_ns: Nanos,
}

impl SchedulerData {
    pub fn new(config: Config) -> Self {
        let mut groups = Slab::new();
        let root = GroupId::from_raw(groups.insert(Group::new_root()));

        let mut entities = Slab::new();
        let mut queues = Slab::new();
        let oom_entity_key = {
            let entry = entities.vacant_entry();
            let id = EntityId::from_raw(entry.key());
            entry.insert(Entity::new(id, EntityKind::Queue(QueueId::from_raw(0)), Some(root), IoPrioClass::Be, DEFAULT_WEIGHT));
            id
        };
        let oom_queue = {
            let entry = queues.vacant_entry();
            let id = QueueId::from_raw(entry.key());
            entry.insert(Queue::new_oom(id, oom_entity_key, root));
            id
        };
        entities[oom_entity_key.raw()].kind = EntityKind::Queue(oom_queue);

        Self {
            config,
            entities,
            queues,
            groups,
            requests: Slab::new(),
            io_contexts: Slab::new(),
            root,
            in_service: None,
            oom_queue,
            idle_timer: IdleTimer::new(),
            burst: BurstDetector::new(),
            peak_rate: PeakRateEstimator::new(),
            rq_in_driver: 0,
            queued: 0,
            last_dispatch_ns: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn oom_queue(&self) -> QueueId {
        self.oom_queue
    }

    pub fn root_group(&self) -> GroupId {
        self.root
    }

    // ---- §3 Group lifecycle: cgroup attach / detach ---------------------

    /// Attaches a new child group entity under `parent` (§3 Group
    /// lifecycle, "created on cgroup attach"). `class`/`weight` are the
    /// group entity's own scheduling parameters within `parent`'s service
    /// tree; the returned id can be passed to [`Self::init_icq`] or back
    /// into this method to build a deeper hierarchy. The cgroup policy that
    /// decides *when* to attach/detach a group is the external glue's job
    /// (§1 "cgroup policy wiring" is out of scope); this only builds the
    /// generic entity/group node the hierarchy needs.
    pub fn create_group(&mut self, parent: GroupId, class: IoPrioClass, weight: u32) -> GroupId {
        let entity_key = {
            let entry = self.entities.vacant_entry();
            let id = EntityId::from_raw(entry.key());
            entry.insert(Entity::new(id, EntityKind::Group(GroupId::from_raw(0)), Some(parent), class, weight));
            id
        };
        let gid = {
            let entry = self.groups.vacant_entry();
            let id = GroupId::from_raw(entry.key());
            entry.insert(Group::new_child(id, entity_key, parent));
            id
        };
        self.entities[entity_key.raw()].kind = EntityKind::Group(gid);
        trace!("created group {:?} under {:?}", gid, parent);
        gid
    }

    /// Detaches `group` (§3 Group lifecycle, "torn down on detach"). A
    /// no-op for the permanent root group. The caller must have already
    /// drained or reparented every queue and child group under it; any
    /// entity slot this leaves dangling is the caller's bug, not this
    /// method's to paper over.
    pub fn destroy_group(&mut self, group: GroupId) {
        if group == self.root {
            return;
        }
        let Some(g) = self.groups.try_remove(group.raw()) else {
            return;
        };
        if let Some(entity_id) = g.entity {
            if let Some(parent) = g.parent {
                if self.entities[entity_id.raw()].on_active_tree || self.entities[entity_id.raw()].on_idle_tree {
                    let parent_group = &mut self.groups[parent.raw()];
                    let entity = &mut self.entities[entity_id.raw()];
                    parent_group.sched.remove(entity);
                }
            }
            self.entities.try_remove(entity_id.raw());
        }
        trace!("destroyed group {:?}", group);
    }

    // ---- §6: init_icq / exit_icq --------------------------------------

    /// Allocates a fresh per-process control block under `group`, with
    /// `weight` and priority `class`.
    pub fn init_icq(&mut self, group: GroupId, class: IoPrioClass, weight: u32) -> IoContextId {
        let entry = self.io_contexts.vacant_entry();
        let id = IoContextId::from_raw(entry.key());
        entry.insert(IoContext {
            group,
            weight,
            class,
            sync_queue: None,
        });
        id
    }

    /// Releases `icq`'s reference on its sync queue. The queue itself is
    /// only torn down once every process and in-flight reference has gone
    /// (§3 Queue lifecycle); a queue with pending requests or in-flight
    /// refs survives and is picked up again via `get_or_create_sync_queue`
    /// should the io-context somehow be reused, but ordinarily the caller
    /// drops `icq` entirely after this call.
    pub fn exit_icq(&mut self, icq: IoContextId) {
        let Some(ctx) = self.io_contexts.try_remove(icq.raw()) else {
            return;
        };
        if let Some(qid) = ctx.sync_queue {
            if let Some(queue) = self.queues.get_mut(qid.raw()) {
                queue.process_refs = queue.process_refs.saturating_sub(1);
                if queue.process_refs == 0 && queue.in_flight_refs == 0 && queue.is_empty() {
                    self.destroy_queue(qid);
                }
            }
        }
    }

    fn destroy_queue(&mut self, qid: QueueId) {
        if qid == self.oom_queue {
            return;
        }
        let Some(queue) = self.queues.try_remove(qid.raw()) else {
            return;
        };
        let entity_id = queue.entity;
        if let Some(entity) = self.entities.get_mut(entity_id.raw()) {
            if entity.on_active_tree || entity.on_idle_tree {
                let parent = entity.parent;
                if let Some(parent) = parent {
                    let group = &mut self.groups[parent.raw()];
                    let entity = &mut self.entities[entity_id.raw()];
                    group.sched.remove(entity);
                }
            }
        }
        self.entities.try_remove(entity_id.raw());
        if let Some(sector) = queue.next_request_sector() {
            self.groups[queue.parent.raw()].remove_position(sector, qid);
        }
    }

    // ---- Queue lookup / creation ---------------------------------------

    /// The queue a new request from `icq` in the given `direction` should
    /// land in: the io-context's own sync queue (created on first use), or
    /// the group's shared per-class async queue (§3 Group "per-priority
    /// async-queue slots").
    fn get_or_create_queue(&mut self, icq: IoContextId, direction: Direction, now: Nanos) -> QueueId {
        let (group, weight, class) = {
            let ctx = &self.io_contexts[icq.raw()];
            (ctx.group, ctx.weight, ctx.class)
        };

        match direction {
            Direction::Sync => {
                if let Some(qid) = self.io_contexts[icq.raw()].sync_queue {
                    return self.resolve_queue(qid);
                }
                let qid = self.create_queue(group, class, weight, direction, now);
                self.io_contexts[icq.raw()].sync_queue = Some(qid);
                qid
            }
            Direction::Async => {
                if let Some(qid) = self.groups[group.raw()].async_queue(class) {
                    return self.resolve_queue(qid);
                }
                let qid = self.create_queue(group, class, weight, direction, now);
                self.groups[group.raw()].set_async_queue(class, qid);
                qid
            }
        }
    }

    fn create_queue(&mut self, group: GroupId, class: IoPrioClass, weight: u32, direction: Direction, now: Nanos) -> QueueId {
        let entity_key = {
            let entry = self.entities.vacant_entry();
            let id = EntityId::from_raw(entry.key());
            entry.insert(Entity::new(id, EntityKind::Queue(QueueId::from_raw(0)), Some(group), class, weight));
            id
        };
        let qid = {
            let entry = self.queues.vacant_entry();
            let id = QueueId::from_raw(entry.key());
            entry.insert(Queue::new(id, entity_key, group, direction));
            id
        };
        self.entities[entity_key.raw()].kind = EntityKind::Queue(qid);

        match self.burst.on_queue_created(qid, group, now, ns(self.config.burst_interval_ms), self.config.large_burst_thresh) {
            BurstOutcome::Tracked => {}
            BurstOutcome::FlaggedImmediately => {
                self.queues[qid.raw()].flags |= QueueFlags::IN_LARGE_BURST;
                debug!("queue {:?} flagged into an already-recognized large burst", qid);
            }
            BurstOutcome::ThresholdReached(members) => {
                for member in members {
                    if let Some(q) = self.queues.get_mut(member.raw()) {
                        q.flags |= QueueFlags::IN_LARGE_BURST;
                        q.wr.stop();
                    }
                }
                debug!("large burst recognized at {:?}, {} queues flagged", group, self.config.large_burst_thresh);
            }
        }

        trace!("created queue {:?} under group {:?}", qid, group);
        qid
    }

    /// Follows a queue's `new_queue` cooperator-merge chain to its current
    /// target, with a visited set bounding the walk against a cycle (per
    /// the "cyclic/intrusive structures" design note).
    fn resolve_queue(&self, mut qid: QueueId) -> QueueId {
        let mut seen = BTreeSet::new();
        while let Some(queue) = self.queues.get(qid.raw()) {
            let Some(next) = queue.new_queue else { break };
            if !seen.insert(qid) {
                warn!("cooperator chain cycle detected at {:?}, breaking", qid);
                break;
            }
            qid = next;
        }
        qid
    }

    // ---- §6: insert_request ---------------------------------------------

    /// Pushes a new request from `icq` onto the FIFO and sector-sorted
    /// index of the appropriate queue, possibly triggering a cooperator
    /// merge and/or preempting the in-service queue (§4.2 `idle -> busy`).
    pub fn insert_request(
        &mut self,
        icq: IoContextId,
        direction: Direction,
        sector: Sector,
        n_sectors: u32,
        now: Nanos,
    ) -> RequestId {
        let qid = self.get_or_create_queue(icq, direction, now);
        self.maybe_merge_cooperators(qid, sector, now);
        let qid = self.resolve_queue(qid);

        let request_key = {
            let entry = self.requests.vacant_entry();
            let id = RequestId::from_raw(entry.key());
            let fifo_deadline = now.saturating_add(ns(match direction {
                Direction::Sync => self.config.fifo_expire_sync_ms,
                Direction::Async => self.config.fifo_expire_async_ms,
            }));
            entry.insert(Request {
                id,
                queue: qid,
                sector,
                n_sectors,
                direction,
                inserted_at: now,
                fifo_deadline,
            });
            id
        };

        let was_busy = !self.queues[qid.raw()].is_empty();
        {
            let queue = &mut self.queues[qid.raw()];
            if let Some(last) = queue.last_request_sector {
                queue.seek_history.push(is_seek(last, sector, SEEK_THR_SECTORS));
            }
            queue.insert_request(&self.requests[request_key.raw()]);
        }
        if let Some(next_sector) = self.queues[qid.raw()].next_request_sector() {
            let parent = self.queues[qid.raw()].parent;
            self.groups[parent.raw()].set_position(next_sector, qid);
        }
        self.queued += 1;

        if !was_busy {
            self.on_queue_busy(qid, now);
        }

        request_key
    }

    /// `idle -> busy` (§4.2): activates the entity, maybe starts weight
    /// raising, maybe preempts the in-service queue.
    fn on_queue_busy(&mut self, qid: QueueId, now: Nanos) {
        self.maybe_start_weight_raising(qid, now);

        let entity_id = self.queues[qid.raw()].entity;
        {
            let wr = self.queues[qid.raw()].wr;
            let entity = &mut self.entities[entity_id.raw()];
            entity.weight = entity.orig_weight.saturating_mul(if wr.is_active() { wr.coeff } else { 1 });
            if entity.budget == 0 {
                entity.budget = self.effective_max_budget(qid);
            }
        }
        self.queues[qid.raw()].flags.remove(QueueFlags::JUST_CREATED);
        self.queues[qid.raw()].state = QueueState::Busy;

        let origin = {
            let entity = &self.entities[entity_id.raw()];
            if entity.on_idle_tree {
                ActivationOrigin::ResumedFrom(entity.finish)
            } else {
                ActivationOrigin::Fresh
            }
        };
        self.activate_entity(entity_id, origin);

        if self.should_preempt(qid) {
            let _ = self.expire_in_service(ExpireReason::Preempted, now);
        }
    }

    fn should_preempt(&self, candidate: QueueId) -> bool {
        let Some(in_service) = self.in_service else { return false };
        if in_service == candidate {
            return false;
        }
        if !self.config.strict_guarantees {
            return false;
        }
        let candidate_class = self.entities[self.queues[candidate.raw()].entity.raw()].class;
        let in_service_class = self.entities[self.queues[in_service.raw()].entity.raw()].class;
        candidate_class < in_service_class
    }

    fn effective_max_budget(&self, qid: QueueId) -> u64 {
        let configured = self.queues[qid.raw()].next_max_budget;
        if configured > 0 {
            return configured;
        }
        if self.config.max_budget_sectors > 0 {
            return self.config.max_budget_sectors;
        }
        let peak = self.peak_rate.peak_rate();
        if peak == 0 {
            return self.config.min_budget_sectors.max(1024);
        }
        (peak * self.config.timeout_sync_ms as u64 / 1000).max(self.config.min_budget_sectors)
    }

    fn activate_entity(&mut self, entity_id: EntityId, origin: ActivationOrigin) {
        let parent = self.entities[entity_id.raw()]
            .parent
            .expect("a scheduled entity always has a parent group");
        let group = &mut self.groups[parent.raw()];
        let entity = &mut self.entities[entity_id.raw()];
        group.sched.activate(entity, origin);

        // Bubble the activation up: if the parent group itself was not
        // already scheduled in its own parent (i.e. it just became busy),
        // activate its entity too. The permanent root group has no entity
        // of its own and terminates the climb.
        if let Some(group_entity) = self.groups[parent.raw()].entity {
            if !self.entities[group_entity.raw()].on_active_tree {
                let budget = self.config.min_budget_sectors.max(self.peak_rate.peak_rate().max(1));
                self.entities[group_entity.raw()].budget = budget;
                self.activate_entity(group_entity, ActivationOrigin::Fresh);
            }
        }
    }

    // ---- Cooperator merger (§4.7) ---------------------------------------

    fn maybe_merge_cooperators(&mut self, qid: QueueId, next_sector: Sector, now: Nanos) {
        if self.queues[qid.raw()].is_oom() || self.queues[qid.raw()].is_merged() {
            return;
        }
        let parent = self.queues[qid.raw()].parent;
        let Some(close) = self.groups[parent.raw()].find_close_queue(next_sector, self.config.cooperator_close_thr_sectors, qid) else {
            return;
        };
        let wr_block_ns = ns(self.config.wr_merge_block_ms);
        let eligible = {
            let candidate = &self.queues[qid.raw()];
            let target = &self.queues[close.raw()];
            candidate.parent == target.parent
                && cooperator::is_merge_eligible(candidate, target, now, wr_block_ns)
        };
        if !eligible {
            return;
        }

        let (source, target) = (qid, close);
        {
            let (lo, hi) = if source.raw() < target.raw() {
                (source, target)
            } else {
                (target, source)
            };
            let (a, b) = self.queues.get2_mut(lo.raw(), hi.raw());
            if source.raw() < target.raw() {
                cooperator::merge(a.unwrap(), b.unwrap());
            } else {
                cooperator::merge(b.unwrap(), a.unwrap());
            }
        };
        debug!("merged queue {:?} into cooperator {:?}", source, target);
    }

    /// Splits `qid` back out of its cooperator merge, restoring the state
    /// captured at merge time (§3 supplemented "split as a first-class
    /// operation").
    pub fn split(&mut self, qid: QueueId) {
        let Some(target) = self.queues[qid.raw()].new_queue else {
            return;
        };
        cooperator::split(&mut self.queues[qid.raw()], target);
        debug!("split queue {:?} back out of cooperator {:?}", qid, target);
    }

    // ---- Weight raising (§4.3) -------------------------------------------

    fn maybe_start_weight_raising(&mut self, qid: QueueId, now: Nanos) {
        if !self.config.low_latency {
            return;
        }
        let queue = &self.queues[qid.raw()];
        if queue.is_oom() || !queue.is_sync() || queue.flags.contains(QueueFlags::IN_LARGE_BURST) || queue.flags.contains(QueueFlags::COOP) {
            return;
        }
        if queue.wr.is_active() {
            return;
        }

        // A queue's first-ever busy transition is eligible too: idle time is
        // measured from `last_idle_backlogged`, which defaults to zero, so a
        // queue whose first request arrives long after device/clock start
        // reads as having been idle for that whole span (§8 scenario 1).
        let idle_elapsed = now.saturating_sub(queue.last_idle_backlogged);
        let is_interactive = idle_elapsed >= ns(self.config.wr_min_idle_time_ms);
        let is_soft_rt = queue.soft_rt_next_start != 0 && now >= queue.soft_rt_next_start;

        let speed = self.peak_rate.device_speed();
        let peak = self.peak_rate.peak_rate();
        if is_soft_rt {
            let duration = self.config.wr_rt_max_time_ms as u64;
            self.queues[qid.raw()].wr.start_soft_rt(now, self.config.wr_coeff, duration);
            debug!("queue {:?} entered soft-real-time weight raising", qid);
        } else if is_interactive {
            let duration = interactive_duration_ms(speed, peak);
            self.queues[qid.raw()].wr.start_interactive(now, self.config.wr_coeff, duration);
            debug!("queue {:?} entered interactive weight raising for {}ms", qid, duration);
        }
    }

    fn refresh_soft_rt_if_active(&mut self, qid: QueueId, now: Nanos) {
        let duration = self.config.wr_rt_max_time_ms as u64;
        self.queues[qid.raw()].wr.refresh_soft_rt(now, duration);
    }

    // ---- §6: merge / merged_request / merged_requests / allow_merge -----

    /// Looks up a front/back merge candidate for a bio landing at `sector`
    /// with length `n_sectors` against `icq`'s queue.
    pub fn merge(&self, icq: IoContextId, direction: Direction, sector: Sector, n_sectors: u32) -> MergeDecision {
        let ctx = &self.io_contexts[icq.raw()];
        let qid = match direction {
            Direction::Sync => ctx.sync_queue,
            Direction::Async => self.groups[ctx.group.raw()].async_queue(ctx.class),
        };
        let Some(qid) = qid else { return MergeDecision::NoMerge };
        let qid = self.resolve_queue(qid);
        let Some(queue) = self.queues.get(qid.raw()) else { return MergeDecision::NoMerge };

        let end = sector.saturating_add(n_sectors as u64);
        if let Some((_, &id)) = queue.sort_index().get(&end).map(|id| (end, id)) {
            return MergeDecision::FrontMerge(id);
        }
        if let Some((&before_sector, &id)) = queue.sort_index().range(..sector).next_back() {
            if let Some(request) = self.requests.get(id.raw()) {
                if request.end_sector() == sector {
                    let _ = before_sector;
                    return MergeDecision::BackMerge(id);
                }
            }
        }
        MergeDecision::NoMerge
    }

    /// Re-sorts `rq` after a front/back merge changed its sector range.
    pub fn merged_request(&mut self, rq: RequestId, new_sector: Sector, new_n_sectors: u32) -> Result<()> {
        let Some(request) = self.requests.get(rq.raw()) else {
            return Err(Error::UnknownRequest);
        };
        let qid = request.queue;
        let old_sector = request.sector;
        if let Some(request) = self.requests.get_mut(rq.raw()) {
            request.sector = new_sector;
            request.n_sectors = new_n_sectors;
        }
        if let Some(queue) = self.queues.get_mut(qid.raw()) {
            queue.resort_request(rq, old_sector, new_sector);
        }
        Ok(())
    }

    /// Folds `next` into `rq`: extends `rq`'s sector range to cover both,
    /// inherits the earlier FIFO deadline, and drops `next`.
    pub fn merged_requests(&mut self, rq: RequestId, next: RequestId) -> Result<()> {
        let Some(next_req) = self.requests.try_remove(next.raw()) else {
            return Err(Error::UnknownRequest);
        };
        if let Some(queue) = self.queues.get_mut(next_req.queue.raw()) {
            queue.remove_request(next, next_req.sector);
        }
        let Some(request) = self.requests.get_mut(rq.raw()) else {
            return Err(Error::UnknownRequest);
        };
        let old_sector = request.sector;
        let new_start = request.sector.min(next_req.sector);
        let new_end = request.end_sector().max(next_req.end_sector());
        request.sector = new_start;
        request.n_sectors = (new_end - new_start) as u32;
        request.fifo_deadline = request.fifo_deadline.min(next_req.fifo_deadline);
        let qid = request.queue;
        if let Some(queue) = self.queues.get_mut(qid.raw()) {
            queue.resort_request(rq, old_sector, new_start);
        }
        self.queued = self.queued.saturating_sub(1);
        Ok(())
    }

    /// Whether a bio for `icq` may merge into `rq` (§6 `allow_merge`):
    /// gated by sync/async compatibility and the same cooperator-merge
    /// eligibility used for queue-level merging.
    pub fn allow_merge(&self, rq: RequestId, icq: IoContextId, direction: Direction) -> bool {
        let Some(request) = self.requests.get(rq.raw()) else { return false };
        if request.direction != direction {
            return false;
        }
        let ctx = &self.io_contexts[icq.raw()];
        let requester_qid = match direction {
            Direction::Sync => ctx.sync_queue,
            Direction::Async => self.groups[ctx.group.raw()].async_queue(ctx.class),
        };
        let Some(requester_qid) = requester_qid else { return false };
        let requester_qid = self.resolve_queue(requester_qid);
        let owner_qid = self.resolve_queue(request.queue);
        requester_qid == owner_qid
    }

    // ---- §6: dispatch -----------------------------------------------------

    /// Recursively descends the entity hierarchy, class-first, to find the
    /// next eligible leaf queue (§4.1 `get_next`).
    fn select_next_queue(&self) -> Option<QueueId> {
        self.select_from_group(self.root)
    }

    fn select_from_group(&self, group_id: GroupId) -> Option<QueueId> {
        let group = &self.groups[group_id.raw()];
        let next = if self.config.strict_guarantees {
            group.sched.get_next_strict()
        } else {
            group.sched.get_next_weighted()
        }?;
        match self.entities[next.1.raw()].kind {
            EntityKind::Queue(qid) => Some(qid),
            EntityKind::Group(gid) => self.select_from_group(gid),
        }
    }

    /// Moves up to one request into the driver's dispatch list, honoring
    /// `strict_guarantees` serialization (§6 `dispatch`).
    pub fn dispatch(&mut self, now: Nanos, force: bool) -> Option<RequestId> {
        if self.config.strict_guarantees && self.rq_in_driver > 0 && !force {
            return None;
        }

        if self.in_service.is_none() {
            let qid = self.select_next_queue()?;
            self.select_in_service(qid, now);
        }
        let qid = self.in_service?;

        let last_pos = self.queues[qid.raw()].last_request_sector.unwrap_or(0);
        let Some(rq_id) = self.queues[qid.raw()].next_in_sector_order(last_pos) else {
            // Sort list already empty; nothing left to dispatch this slice.
            self.on_sort_list_drained(qid, now);
            return None;
        };
        let request = self.requests[rq_id.raw()];

        {
            let queue = &mut self.queues[qid.raw()];
            queue.remove_request(rq_id, request.sector);
            if let Some(last) = queue.last_request_sector {
                queue.seek_history.push(is_seek(last, request.sector, SEEK_THR_SECTORS));
            }
            queue.last_request_sector = Some(request.end_sector());
        }

        let driver_busy = self.rq_in_driver > 0;
        self.peak_rate.on_dispatch(now, request.sector, request.n_sectors, driver_busy);
        self.rq_in_driver += 1;
        self.queued = self.queued.saturating_sub(1);
        self.last_dispatch_ns = now;

        let entity_id = self.queues[qid.raw()].entity;
        self.entities[entity_id.raw()].service += request.n_sectors as u64;

        if self.entities[entity_id.raw()].service >= self.entities[entity_id.raw()].budget {
            let _ = self.expire_in_service(ExpireReason::BudgetExhausted, now);
        } else if self.queues[qid.raw()].is_empty() {
            self.on_sort_list_drained(qid, now);
        }

        Some(rq_id)
    }

    fn select_in_service(&mut self, qid: QueueId, now: Nanos) {
        self.in_service = Some(qid);
        self.idle_timer.cancel();
        let entity_id = self.queues[qid.raw()].entity;
        self.entities[entity_id.raw()].service = 0;
        self.queues[qid.raw()].state = QueueState::InService;
        self.queues[qid.raw()].service_start_ns = now;
        let weight_ratio = self.entities[entity_id.raw()].weight.max(1) as u64;
        self.queues[qid.raw()].budget_timeout = now.saturating_add(ns(self.config.timeout_sync_ms).saturating_mul(weight_ratio) / DEFAULT_WEIGHT as u64);
        trace!("queue {:?} selected in-service", qid);
    }

    /// §4.2 `in-service -> waiting` or expiration: the sort list has
    /// drained but the queue may still have more I/O coming.
    fn on_sort_list_drained(&mut self, qid: QueueId, now: Nanos) {
        let scenario = self.idling_scenario(qid);
        if should_idle(&scenario) {
            self.queues[qid.raw()].flags |= QueueFlags::WAIT_REQUEST;
            self.queues[qid.raw()].state = QueueState::Waiting;
            self.idle_timer.arm(qid, now, self.config.slice_idle_ns);
            trace!("queue {:?} waiting, idle timer armed", qid);
        } else {
            let _ = self.expire_in_service(ExpireReason::NoMoreRequests, now);
        }
    }

    fn idling_scenario(&self, qid: QueueId) -> IdlingScenario {
        let entity_id = self.queues[qid.raw()].entity;
        let entity = &self.entities[entity_id.raw()];
        let queue = &self.queues[qid.raw()];

        let symmetric = self.is_symmetric_scenario();
        let other_wr_backlogged = self.queues.iter().any(|(id, q)| {
            id != qid.raw() && q.wr.is_active() && matches!(q.state, QueueState::Busy | QueueState::InService | QueueState::Waiting)
        });

        IdlingScenario {
            queue_is_sync_non_idle_class: queue.is_sync() && entity.class != IoPrioClass::Idle,
            device_benefits_from_idling_for_throughput: !queue.is_seeky(SEEKY_THRESHOLD),
            queue_is_seeky: queue.is_seeky(SEEKY_THRESHOLD),
            symmetric_scenario: symmetric,
            queue_is_weight_raised: queue.wr.is_active(),
            other_weight_raised_queue_backlogged: other_wr_backlogged,
        }
    }

    /// GLOSSARY "Symmetric scenario": all busy queues/groups share one
    /// weight and none is weight-raised.
    fn is_symmetric_scenario(&self) -> bool {
        let mut weight = None;
        for (_, queue) in self.queues.iter() {
            if !matches!(queue.state, QueueState::Busy | QueueState::InService | QueueState::Waiting) {
                continue;
            }
            if queue.wr.is_active() {
                return false;
            }
            let entity = &self.entities[queue.entity.raw()];
            match weight {
                None => weight = Some(entity.weight),
                Some(w) if w != entity.weight => return false,
                _ => {}
            }
        }
        true
    }

    // ---- §6: activate_request / deactivate_request / completed_request --

    pub fn activate_request(&mut self) {
        self.rq_in_driver += 1;
    }

    pub fn deactivate_request(&mut self) {
        self.rq_in_driver = self.rq_in_driver.saturating_sub(1);
    }

    /// §6 `completed_request`: decrements the in-driver counter, feeds the
    /// peak-rate estimator, and maybe expires or re-idles.
    pub fn completed_request(&mut self, rq: RequestId, n_sectors: u32, now: Nanos) {
        self.rq_in_driver = self.rq_in_driver.saturating_sub(1);
        self.peak_rate.on_completion(now, n_sectors);

        let Some(request) = self.requests.try_remove(rq.raw()) else {
            return;
        };
        let qid = self.resolve_queue(request.queue);
        let Some(queue) = self.queues.get_mut(qid.raw()) else { return };
        queue.in_flight_refs = queue.in_flight_refs.saturating_sub(1);

        if queue.wr.kind == crate::weight_raising::WrKind::SoftRt {
            self.refresh_soft_rt_if_active(qid, now);
        }

        if queue.process_refs == 0 && queue.in_flight_refs == 0 && queue.is_empty() && !matches!(queue.state, QueueState::InService) {
            self.destroy_queue(qid);
        }
    }

    // ---- §4.6: expiration and budget feedback ----------------------------

    /// Expires the in-service queue for `reason`, recomputing its budget
    /// for the next activation and either reactivating or idling it.
    ///
    /// Returns [`Error::NoInServiceQueue`] if no queue is currently
    /// in-service; callers that already know one is selected (every
    /// internal call site) may discard the result.
    pub fn expire_in_service(&mut self, reason: ExpireReason, now: Nanos) -> Result<()> {
        let Some(qid) = self.in_service.take() else {
            return Err(Error::NoInServiceQueue);
        };
        self.idle_timer.cancel();
        self.queues[qid.raw()].flags.remove(QueueFlags::WAIT_REQUEST);

        let entity_id = self.queues[qid.raw()].entity;
        let elapsed = now.saturating_sub(self.queues[qid.raw()].service_start_ns);
        let service = self.entities[entity_id.raw()].service;
        let budget = self.entities[entity_id.raw()].budget;
        let slow = is_slow(elapsed, service, self.effective_max_budget(qid).max(budget));
        let charged = charge_service(reason, service, budget, elapsed, slow, self.peak_rate.peak_rate());

        let is_async = !self.queues[qid.raw()].is_sync();
        let has_more_work = !self.queues[qid.raw()].is_empty();
        let new_budget = next_max_budget(
            reason,
            self.queues[qid.raw()].next_max_budget.max(budget),
            service,
            self.config.min_budget_sectors,
            has_more_work,
            is_async,
            self.effective_max_budget(qid),
        );
        self.queues[qid.raw()].next_max_budget = new_budget;

        if reason == ExpireReason::TooIdle && service <= (2 * budget) / 10 {
            // §8 scenario 4: TOO_IDLE with little service served clears IO_bound
            // without touching wr_coeff.
            self.queues[qid.raw()].flags.remove(QueueFlags::IO_BOUND);
        }

        if !has_more_work {
            self.queues[qid.raw()].last_idle_backlogged = now;
            self.queues[qid.raw()].service_from_backlogged = 0;
            self.queues[qid.raw()].soft_rt_next_start = predict_soft_rt_next_start(
                self.queues[qid.raw()].last_idle_backlogged,
                service,
                self.config.wr_max_softrt_rate_sectors_per_s,
                now,
                self.config.slice_idle_ns,
                SOFT_RT_GUARD_NS,
            );
            self.queues[qid.raw()].state = QueueState::Idle;
        } else {
            self.queues[qid.raw()].service_from_backlogged = self.queues[qid.raw()].service_from_backlogged.saturating_add(service);
            self.queues[qid.raw()].state = QueueState::Busy;
        }

        if self.queues[qid.raw()].wr.has_expired(now) {
            self.queues[qid.raw()].wr.stop();
        }

        let parent = self.entities[entity_id.raw()].parent.expect("queue entity always has a parent");
        let group = &mut self.groups[parent.raw()];
        let entity = &mut self.entities[entity_id.raw()];
        entity.last_selected_start = entity.start;
        entity.last_selected_finish = entity.finish;
        group.sched.expire(entity, new_budget, charged, has_more_work);

        debug!("queue {:?} expired: {:?}, has_more_work={}", qid, reason, has_more_work);
        Ok(())
    }

    /// Caller-driven idling timer firing (§4.4): expires the queue with
    /// `TOO_IDLE` unless new activity raced in first (the
    /// `IdleTimer::fire` check handles that race).
    pub fn idle_timer_fired(&mut self, now: Nanos) {
        let Some(qid) = self.idle_timer.fire(now) else {
            return;
        };
        if self.in_service == Some(qid) {
            let _ = self.expire_in_service(ExpireReason::TooIdle, now);
        }
    }

    pub fn is_idle_timer_armed(&self) -> bool {
        self.idle_timer.is_armed()
    }

    // ---- §6: may_queue ----------------------------------------------------

    pub fn may_queue(&self, icq: IoContextId, direction: Direction) -> MayQueue {
        let ctx = &self.io_contexts[icq.raw()];
        let qid = match direction {
            Direction::Sync => ctx.sync_queue,
            Direction::Async => self.groups[ctx.group.raw()].async_queue(ctx.class),
        };
        if let Some(qid) = qid {
            if self.in_service == Some(qid) && self.queues[qid.raw()].flags.contains(QueueFlags::WAIT_REQUEST) {
                return MayQueue::Must;
            }
        }
        MayQueue::May
    }

    // ---- §5 Cancellation: forced_dispatch ---------------------------------

    /// Drains every pending request across every class and group into the
    /// returned list, resetting budgets and forgetting idle entries (§5
    /// "on device removal or scheduler switch").
    pub fn forced_dispatch(&mut self) -> alloc::vec::Vec<RequestId> {
        let mut drained = alloc::vec::Vec::new();
        let qids: alloc::vec::Vec<QueueId> = self.queues.iter().map(|(k, _)| QueueId::from_raw(k)).collect();
        for qid in qids {
            loop {
                let last_pos = self.queues[qid.raw()].last_request_sector.unwrap_or(0);
                let Some(rq_id) = self.queues[qid.raw()].next_in_sector_order(last_pos) else {
                    break;
                };
                let sector = self.requests[rq_id.raw()].sector;
                self.queues[qid.raw()].remove_request(rq_id, sector);
                drained.push(rq_id);
            }
            let entity_id = self.queues[qid.raw()].entity;
            self.entities[entity_id.raw()].budget = 0;
            self.entities[entity_id.raw()].service = 0;
            let parent = self.entities[entity_id.raw()].parent;
            if let Some(parent) = parent {
                let group = &mut self.groups[parent.raw()];
                let entity = &mut self.entities[entity_id.raw()];
                group.sched.remove(entity);
                group.sched.forget_idle_all();
            }
        }
        self.queued = 0;
        self.in_service = None;
        debug!("forced_dispatch drained {} requests", drained.len());
        drained
    }

    // ---- §3 supplemented: stats() -----------------------------------------

    pub fn stats(&self) -> SchedulerStats {
        let busy_queues = self
            .queues
            .iter()
            .filter(|(_, q)| matches!(q.state, QueueState::Busy | QueueState::InService | QueueState::Waiting))
            .count();
        let wr_busy_queues = self
            .queues
            .iter()
            .filter(|(_, q)| matches!(q.state, QueueState::Busy | QueueState::InService | QueueState::Waiting) && q.wr.is_active())
            .count();
        SchedulerStats {
            busy_queues,
            wr_busy_queues,
            rq_in_driver: self.rq_in_driver,
            queued: self.queued,
            peak_rate_sectors_per_s: self.peak_rate.peak_rate(),
            device_speed: Some(self.peak_rate.device_speed()),
        }
    }

    pub fn in_service_queue(&self) -> Option<QueueId> {
        self.in_service
    }

    pub fn entity_of(&self, qid: QueueId) -> Option<&Entity> {
        self.queues.get(qid.raw()).map(|q| &self.entities[q.entity.raw()])
    }

    pub fn queue(&self, qid: QueueId) -> Option<&Queue> {
        self.queues.get(qid.raw())
    }

    /// The queue currently handling `icq`'s requests in `direction`, if one
    /// has been created yet. Read-only: unlike [`Self::get_or_create_queue`]
    /// this never allocates, and follows a cooperator-merge chain to its
    /// current target so callers correlating diagnostics (`Self::queue`,
    /// `Self::entity_of`) against an io-context see the queue actually
    /// carrying its requests, e.g. for cgroup io.stat reporting.
    pub fn queue_of(&self, icq: IoContextId, direction: Direction) -> Option<QueueId> {
        let ctx = self.io_contexts.get(icq.raw())?;
        let qid = match direction {
            Direction::Sync => ctx.sync_queue,
            Direction::Async => self.groups[ctx.group.raw()].async_queue(ctx.class),
        }?;
        Some(self.resolve_queue(qid))
    }
}

/// Converts a millisecond tunable into nanoseconds, used throughout when
/// reading `Config`'s `*_ms` fields against a `Nanos` clock.
const fn ns(ms: u32) -> u64 {
    (ms as u64).saturating_mul(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> SchedulerData {
        SchedulerData::new(Config::default())
    }

    /// §8 scenario 1: a single sync queue, idle for more than 2s, then
    /// issuing 8 sync 4-KiB (8-sector) reads. On the first busy transition
    /// it must enter interactive weight raising with the default coefficient
    /// and a duration clamped to [3s, 13s]; with no other queue to compete
    /// with, every request drains from the same in-service queue.
    #[test]
    fn single_interactive_queue_gets_weight_raised_and_drains_fifo() {
        let mut sched = scheduler();
        let icq = sched.init_icq(sched.root_group(), IoPrioClass::Be, DEFAULT_WEIGHT);
        let idle_start = ns(3_000); // 3s, past wr_min_idle_time (2s)

        sched.insert_request(icq, Direction::Sync, 0, 8, idle_start);
        let qid = sched.queue_of(icq, Direction::Sync).unwrap();
        assert!(sched.queue(qid).unwrap().wr.is_active());
        assert_eq!(sched.queue(qid).unwrap().wr.coeff, sched.config().wr_coeff);
        let cur_max_time = sched.queue(qid).unwrap().wr.cur_max_time_ns;
        assert!((ns(3_000)..=ns(13_000)).contains(&cur_max_time));

        for sector in (8..64).step_by(8) {
            sched.insert_request(icq, Direction::Sync, sector, 8, idle_start);
        }
        assert_eq!(sched.queue(qid).unwrap().len(), 8);

        for _ in 0..8 {
            let dispatched = sched.dispatch(idle_start, false);
            assert!(dispatched.is_some(), "all 8 requests must dispatch from the only queue");
            assert_eq!(sched.in_service_queue(), Some(qid));
        }
        assert!(sched.queue(qid).unwrap().is_empty());
    }

    /// §8 scenario 3: 9 queues created under the same parent within
    /// `burst_interval` (180ms default), threshold 8. The 8th creation
    /// recognizes the burst and retroactively flags all 8 plus stops any
    /// weight raising already granted; the 9th, arriving while the device is
    /// in large-burst mode, is flagged directly. None ends up weight-raised
    /// on its first busy transition, even though every one of them is idle
    /// long enough (from `last_idle_backlogged == 0`) to otherwise qualify.
    #[test]
    fn large_burst_of_nine_queues_suppresses_weight_raising() {
        let mut sched = scheduler();
        let root = sched.root_group();
        let base = ns(3_000); // idle_elapsed from 0 exceeds wr_min_idle_time for every member

        let mut qids = Vec::new();
        for i in 0..9u64 {
            let icq = sched.init_icq(root, IoPrioClass::Be, DEFAULT_WEIGHT);
            let now = base + i * ns(10);
            // Sectors spaced far apart so the cooperator merger never kicks in.
            sched.insert_request(icq, Direction::Sync, i * 1_000_000, 8, now);
            qids.push(sched.queue_of(icq, Direction::Sync).unwrap());
        }

        for qid in qids {
            let queue = sched.queue(qid).unwrap();
            assert!(queue.flags.contains(QueueFlags::IN_LARGE_BURST), "{:?} not flagged", qid);
            assert!(!queue.wr.is_active(), "{:?} should not be weight-raised", qid);
        }
    }

    /// §8 scenario 5: two sync queues whose next-request sectors (1000 and
    /// 1004) lie within `close_thr`. Inserting the second triggers a
    /// cooperator merge; both io-contexts resolve to the same queue
    /// afterwards, the survivor is flagged `COOP` and gained a process
    /// reference, and a further request from either io-context lands in the
    /// merged queue.
    #[test]
    fn cooperator_merge_routes_subsequent_requests_to_target() {
        let mut sched = scheduler();
        let root = sched.root_group();
        let now = 0;

        let icq_a = sched.init_icq(root, IoPrioClass::Be, DEFAULT_WEIGHT);
        let icq_b = sched.init_icq(root, IoPrioClass::Be, DEFAULT_WEIGHT);

        sched.insert_request(icq_a, Direction::Sync, 1000, 8, now);
        sched.insert_request(icq_b, Direction::Sync, 1004, 8, now);

        let target_a = sched.queue_of(icq_a, Direction::Sync).unwrap();
        let target_b = sched.queue_of(icq_b, Direction::Sync).unwrap();
        assert_eq!(target_a, target_b, "both io-contexts must resolve to the same merged queue");

        let target = sched.queue(target_a).unwrap();
        assert!(target.flags.contains(QueueFlags::COOP));
        assert_eq!(target.process_refs, 2);

        let len_before = sched.queue(target_a).unwrap().len();
        sched.insert_request(icq_a, Direction::Sync, 2000, 8, now);
        assert_eq!(sched.queue(target_a).unwrap().len(), len_before + 1);
    }

    /// §8 scenario 4: expiring a weight-raised, seeky queue with `TOO_IDLE`
    /// when it served at most `2 * budget / 10` sectors must clear its
    /// `IO_BOUND` flag without reducing `wr_coeff`.
    #[test]
    fn too_idle_expiration_with_little_service_clears_io_bound_not_wr_coeff() {
        let mut sched = scheduler();
        let root = sched.root_group();
        let icq = sched.init_icq(root, IoPrioClass::Be, DEFAULT_WEIGHT);
        let now = 0;
        sched.insert_request(icq, Direction::Sync, 0, 8, now);
        let qid = sched.queue_of(icq, Direction::Sync).unwrap();

        let entity_id = sched.queues[qid.raw()].entity;
        sched.in_service = Some(qid);
        sched.entities[entity_id.raw()].budget = 1000;
        sched.entities[entity_id.raw()].service = 100; // <= 2*1000/10 == 200
        sched.queues[qid.raw()].flags |= QueueFlags::IO_BOUND;
        sched.queues[qid.raw()].wr.start_interactive(now, 30, 5_000);

        sched.expire_in_service(ExpireReason::TooIdle, now + ns(1)).unwrap();

        let queue = sched.queue(qid).unwrap();
        assert!(!queue.flags.contains(QueueFlags::IO_BOUND));
        assert!(queue.wr.is_active());
        assert_eq!(queue.wr.coeff, 30);
    }

    /// §8 round-trip/idempotence: folding one request into another via
    /// `merged_requests` removes the folded-away request from the queue and
    /// decrements the global `queued` counter by exactly one.
    #[test]
    fn merged_requests_folds_next_into_rq_and_decrements_queued() {
        let mut sched = scheduler();
        let root = sched.root_group();
        let icq = sched.init_icq(root, IoPrioClass::Be, DEFAULT_WEIGHT);
        let now = 0;

        let rq1 = sched.insert_request(icq, Direction::Sync, 0, 8, now);
        let rq2 = sched.insert_request(icq, Direction::Sync, 8, 8, now);
        let qid = sched.queue_of(icq, Direction::Sync).unwrap();
        assert_eq!(sched.queue(qid).unwrap().len(), 2);
        assert_eq!(sched.stats().queued, 2);

        sched.merged_requests(rq1, rq2).unwrap();

        assert_eq!(sched.queue(qid).unwrap().len(), 1);
        assert_eq!(sched.stats().queued, 1);
    }

    /// §8 invariant 2: `wr_busy_queues` equals the number of busy queues
    /// with an active weight raise, counting only queues in a busy-ish
    /// state (`Busy`, `InService`, or `Waiting`).
    #[test]
    fn stats_wr_busy_queues_matches_raised_queue_count() {
        let mut sched = scheduler();
        let root = sched.root_group();

        let icq_raised = sched.init_icq(root, IoPrioClass::Be, DEFAULT_WEIGHT);
        sched.insert_request(icq_raised, Direction::Sync, 0, 8, ns(3_000));

        let icq_plain = sched.init_icq(root, IoPrioClass::Be, DEFAULT_WEIGHT);
        sched.insert_request(icq_plain, Direction::Sync, 10_000_000, 8, ns(500));

        let stats = sched.stats();
        assert_eq!(stats.busy_queues, 2);
        assert_eq!(stats.wr_busy_queues, 1);
    }
}
