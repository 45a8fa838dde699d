// SPDX-License-Identifier: MPL-2.0

//! A cheap, read-only counters snapshot (§3 supplemented feature), the
//! natural observability surface the Testable Properties in spec §8 assert
//! over — analogous to a `/proc` or sysfs readout in the real scheduler,
//! and not excluded by the sysfs-tuning-surface Non-goal since it is
//! read-only introspection rather than a tuning knob.

use crate::prio::DeviceSpeed;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub busy_queues: usize,
    pub wr_busy_queues: usize,
    pub rq_in_driver: u64,
    pub queued: u64,
    pub peak_rate_sectors_per_s: u64,
    pub device_speed: Option<DeviceSpeed>,
}
