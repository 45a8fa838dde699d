// SPDX-License-Identifier: MPL-2.0

//! The per-process queue state machine (§4.2).

use bitflags::bitflags;

use crate::{
    cooperator::CoopSnapshot,
    id::{EntityId, GroupId, QueueId, RequestId},
    prelude::*,
    request::{Direction, Request},
    seek::SeekHistory,
    time::{Nanos, Sector},
    weight_raising::WrState,
};

bitflags! {
    /// Queue flags (§3 Queue).
    pub struct QueueFlags: u32 {
        /// Requests are synchronous.
        const SYNC            = 1 << 0;
        /// The queue's recent history indicates it keeps submitting more
        /// I/O once the current batch is served ("IO-bound").
        const IO_BOUND         = 1 << 1;
        /// The queue benefits from idling between activations.
        const IDLE_WINDOW       = 1 << 2;
        /// Idling is armed awaiting a new request (`waiting` state).
        const WAIT_REQUEST      = 1 << 3;
        /// Flagged during large-burst formation or membership (§4.5).
        const IN_LARGE_BURST    = 1 << 4;
        /// Currently the target or source of a cooperator merge (§4.7).
        const COOP             = 1 << 5;
        /// Was split out of a cooperator merge and should not immediately
        /// re-merge with the same partner.
        const SPLIT_COOP        = 1 << 6;
        /// Must allocate a request even under memory pressure (in-service,
        /// `waiting`, needs a request to make progress).
        const MUST_ALLOC        = 1 << 7;
        /// The fifo_expire deadline fired for the head request.
        const FIFO_EXPIRE       = 1 << 8;
        /// Never yet made busy; suppresses some heuristics on first
        /// activation.
        const JUST_CREATED      = 1 << 9;
        /// A soft-real-time predictor recompute is pending.
        const SOFTRT_UPDATE     = 1 << 10;
        /// This is the OOM sentinel queue: it never participates in burst
        /// detection, cooperator merging, or weight raising (§7, Design
        /// Note / Open Question 1).
        const OOM               = 1 << 11;
    }
}

/// The queue's coarse lifecycle state (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Busy,
    InService,
    /// In-service, sort list empty, idling timer armed.
    Waiting,
}

/// A leaf entity: the per-process (or per-priority-async-shared) queue of
/// pending requests.
pub struct Queue {
    pub id: QueueId,
    pub entity: EntityId,
    pub parent: GroupId,
    pub direction: Direction,

    pub state: QueueState,
    pub flags: QueueFlags,

    /// FIFO order of arrival, used for the expiry deadline.
    fifo: VecDeque<RequestId>,
    /// Sector-sorted index, used for request selection within a slice and
    /// for cooperator's next-request-sector lookup.
    sort_index: BTreeMap<Sector, RequestId>,

    pub wr: WrState,

    /// `Some(target)` once this queue has been merged into another; new
    /// requests should be redirected there (§4.7).
    pub new_queue: Option<QueueId>,
    pub split_from: Option<QueueId>,

    /// State saved at merge time, consumed by a later [`Self::new_queue`]
    /// split (§4.7 "the merger is reversed by splitting the queue back out
    /// via the io-context linkage"). `None` once split back out, or if this
    /// queue was never the source of a merge.
    pub coop_snapshot: Option<CoopSnapshot>,

    pub in_burst: bool,

    pub seek_history: SeekHistory,
    pub last_request_sector: Option<Sector>,

    /// Reference count held by owning io-contexts (processes).
    pub process_refs: u32,
    /// Reference count held by in-flight requests.
    pub in_flight_refs: u32,

    /// The armed per-slice deadline while in service (read by §4.6 step 1's
    /// "slow" determination). Kept distinct from
    /// [`Self::last_idle_backlogged`] rather than overloaded the way the
    /// original does (Design Note / Open Question 3).
    pub budget_timeout: Nanos,

    pub last_idle_backlogged: Nanos,
    pub service_from_backlogged: u64,
    pub soft_rt_next_start: Nanos,

    /// When this queue was last selected in-service, used to compute
    /// elapsed slice time for the §4.6 step 1 "slow" determination.
    pub service_start_ns: Nanos,

    /// This activation's per-priority budget cap, recomputed on every
    /// expiration per §4.6 step 3. Distinct from `Entity::budget`, which is
    /// the budget actually granted to the current activation; this is the
    /// value fed into the *next* activation.
    pub next_max_budget: u64,
}

impl Queue {
    pub fn new(id: QueueId, entity: EntityId, parent: GroupId, direction: Direction) -> Self {
        let mut flags = QueueFlags::IDLE_WINDOW | QueueFlags::JUST_CREATED;
        if direction == Direction::Sync {
            flags |= QueueFlags::SYNC;
        }
        Self {
            id,
            entity,
            parent,
            direction,
            state: QueueState::Idle,
            flags,
            fifo: VecDeque::new(),
            sort_index: BTreeMap::new(),
            wr: WrState::default(),
            new_queue: None,
            split_from: None,
            coop_snapshot: None,
            in_burst: false,
            seek_history: SeekHistory::new(),
            last_request_sector: None,
            process_refs: 1,
            in_flight_refs: 0,
            budget_timeout: 0,
            last_idle_backlogged: 0,
            service_from_backlogged: 0,
            soft_rt_next_start: 0,
            service_start_ns: 0,
            next_max_budget: 0,
        }
    }

    pub fn new_oom(id: QueueId, entity: EntityId, parent: GroupId) -> Self {
        let mut queue = Self::new(id, entity, parent, Direction::Async);
        queue.flags |= QueueFlags::OOM;
        queue.flags.remove(QueueFlags::JUST_CREATED);
        queue
    }

    pub fn is_oom(&self) -> bool {
        self.flags.contains(QueueFlags::OOM)
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(QueueFlags::SYNC)
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_merged(&self) -> bool {
        self.new_queue.is_some()
    }

    /// Inserts a request into both the FIFO and the sector-sorted index.
    pub fn insert_request(&mut self, request: &Request) {
        self.fifo.push_back(request.id);
        self.sort_index.insert(request.sector, request.id);
        self.last_request_sector = Some(request.end_sector());
    }

    /// Removes a request after it has been dispatched or merged away.
    pub fn remove_request(&mut self, id: RequestId, sector: Sector) {
        self.fifo.retain(|&r| r != id);
        self.sort_index.remove(&sector);
    }

    pub fn front_fifo(&self) -> Option<RequestId> {
        self.fifo.front().copied()
    }

    /// The request with the smallest sector at or after `from`, wrapping to
    /// the smallest overall if none is found (head-proximity selection,
    /// §4.9 referenced by §5 "Ordering guarantees").
    pub fn next_in_sector_order(&self, from: Sector) -> Option<RequestId> {
        self.sort_index
            .range(from..)
            .next()
            .or_else(|| self.sort_index.iter().next())
            .map(|(_, id)| *id)
    }

    pub fn next_request_sector(&self) -> Option<Sector> {
        self.sort_index.keys().next().copied()
    }

    pub fn is_seeky(&self, threshold: u32) -> bool {
        self.seek_history.is_seeky(threshold)
    }

    /// The sector-sorted index, for merge candidate lookup (§6 `merge`) and
    /// cooperator-adjacent scans. Read-only: mutation goes through
    /// [`Self::insert_request`], [`Self::remove_request`], or
    /// [`Self::resort_request`].
    pub fn sort_index(&self) -> &BTreeMap<Sector, RequestId> {
        &self.sort_index
    }

    /// Re-keys a request already in the sort index after a front/back merge
    /// changed its sector (§6 `merged_request`).
    pub fn resort_request(&mut self, id: RequestId, old_sector: Sector, new_sector: Sector) {
        if self.sort_index.get(&old_sector) == Some(&id) {
            self.sort_index.remove(&old_sector);
        }
        self.sort_index.insert(new_sector, id);
    }
}
