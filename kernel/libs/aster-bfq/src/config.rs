// SPDX-License-Identifier: MPL-2.0

//! Tunables (§6), preserved under their original attribute names for
//! compatibility with callers that persist or expose them, each clamped to
//! its declared valid range on construction and on every setter call (§7b).
//!
//! This plays the role `sysfs` attributes play in the real scheduler: a
//! plain configuration struct, the same ambient shape as `BlockDeviceMeta`
//! in the teacher crate.

/// Scheduler tunables. All durations are in milliseconds unless the field
/// name says otherwise, matching the units documented in spec §6.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    pub fifo_expire_sync_ms: u32,
    pub fifo_expire_async_ms: u32,
    pub back_seek_max_kib: u32,
    pub back_seek_penalty: u32,
    pub slice_idle_ns: u64,
    /// Per-activation budget cap, in sectors. `0` means "auto": derived from
    /// the peak-rate estimate (§4.8).
    pub max_budget_sectors: u64,
    pub timeout_sync_ms: u32,
    pub strict_guarantees: bool,
    pub low_latency: bool,
    pub wr_coeff: u32,
    pub wr_rt_max_time_ms: u32,
    pub wr_min_idle_time_ms: u32,
    pub wr_min_inter_arr_async_ms: u32,
    pub wr_max_softrt_rate_sectors_per_s: u64,
    /// How long after weight-raising starts cooperator merging is blocked
    /// (Design Note / Open Question 3 — made a tunable rather than a bare
    /// constant, since the source gives it no theoretical derivation).
    pub wr_merge_block_ms: u32,
    /// `close_thr` of §4.7: the sector distance within which two queues'
    /// next requests are considered cooperator candidates.
    pub cooperator_close_thr_sectors: u64,
    /// `burst_interval` of §4.5.
    pub burst_interval_ms: u32,
    /// `large_burst_thresh` of §4.5.
    pub large_burst_thresh: u32,
    /// Minimum per-activation budget (`min_budget` referenced throughout
    /// §4.6's budget feedback rules).
    pub min_budget_sectors: u64,
}

const MIN_SLICE_IDLE_NS: u64 = 1_000_000; // 1ms
const MAX_SLICE_IDLE_NS: u64 = 100_000_000; // 100ms
const MIN_BUDGET_FLOOR_SECTORS: u64 = 128;
const MAX_BUDGET_CEIL_SECTORS: u64 = 64 * 1024 * 1024;

impl Default for Config {
    fn default() -> Self {
        Self {
            fifo_expire_sync_ms: 250,
            fifo_expire_async_ms: 125,
            back_seek_max_kib: 16384,
            back_seek_penalty: 2,
            slice_idle_ns: 8_000_000,
            max_budget_sectors: 0,
            timeout_sync_ms: 125,
            strict_guarantees: false,
            low_latency: true,
            wr_coeff: 30,
            wr_rt_max_time_ms: 300,
            wr_min_idle_time_ms: 2_000,
            wr_min_inter_arr_async_ms: 500,
            wr_max_softrt_rate_sectors_per_s: 7_000,
            wr_merge_block_ms: 100,
            cooperator_close_thr_sectors: 8_192,
            burst_interval_ms: 180,
            large_burst_thresh: 8,
            min_budget_sectors: 4 * 1024,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default().clamped()
    }

    /// Returns a copy with every field clamped to its declared valid range.
    pub fn clamped(mut self) -> Self {
        self.clamp();
        self
    }

    /// Clamps every field in place; called after construction and after any
    /// setter mutates a field, so an out-of-range tunable can never reach
    /// the scheduling core (§7b).
    pub fn clamp(&mut self) {
        self.fifo_expire_sync_ms = self.fifo_expire_sync_ms.clamp(1, 60_000);
        self.fifo_expire_async_ms = self.fifo_expire_async_ms.clamp(1, 60_000);
        self.back_seek_max_kib = self.back_seek_max_kib.clamp(0, 1 << 20);
        self.back_seek_penalty = self.back_seek_penalty.clamp(1, 16);
        self.slice_idle_ns = self.slice_idle_ns.clamp(MIN_SLICE_IDLE_NS, MAX_SLICE_IDLE_NS);
        self.max_budget_sectors = self
            .max_budget_sectors
            .clamp(0, MAX_BUDGET_CEIL_SECTORS);
        self.timeout_sync_ms = self.timeout_sync_ms.clamp(1, 60_000);
        self.wr_coeff = self.wr_coeff.clamp(1, 1_000);
        self.wr_rt_max_time_ms = self.wr_rt_max_time_ms.clamp(1, 60_000);
        self.wr_min_idle_time_ms = self.wr_min_idle_time_ms.clamp(0, 60_000);
        self.wr_min_inter_arr_async_ms = self.wr_min_inter_arr_async_ms.clamp(0, 60_000);
        self.wr_max_softrt_rate_sectors_per_s = self.wr_max_softrt_rate_sectors_per_s.clamp(1, u64::MAX / 2);
        self.wr_merge_block_ms = self.wr_merge_block_ms.clamp(0, 60_000);
        self.cooperator_close_thr_sectors = self.cooperator_close_thr_sectors.clamp(1, 1 << 30);
        self.burst_interval_ms = self.burst_interval_ms.clamp(1, 60_000);
        self.large_burst_thresh = self.large_burst_thresh.clamp(1, 1024);
        self.min_budget_sectors = self
            .min_budget_sectors
            .clamp(MIN_BUDGET_FLOOR_SECTORS, MAX_BUDGET_CEIL_SECTORS);
    }

    /// Sets `slice_idle_ns`, clamping it to its valid range.
    pub fn set_slice_idle_ns(&mut self, value: u64) {
        self.slice_idle_ns = value;
        self.clamp();
    }

    /// Sets `max_budget_sectors`, clamping it to its valid range.
    pub fn set_max_budget_sectors(&mut self, value: u64) {
        self.max_budget_sectors = value;
        self.clamp();
    }

    /// Sets `strict_guarantees`.
    pub fn set_strict_guarantees(&mut self, value: bool) {
        self.strict_guarantees = value;
    }

    /// Sets `low_latency`.
    pub fn set_low_latency(&mut self, value: bool) {
        self.low_latency = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_already_in_range() {
        let mut cfg = Config::default();
        let before = cfg;
        cfg.clamp();
        assert_eq!(before, cfg);
    }

    #[test]
    fn out_of_range_tunable_is_clamped_not_rejected() {
        let mut cfg = Config::default();
        cfg.wr_coeff = 0;
        cfg.slice_idle_ns = 0;
        cfg.clamp();
        assert!(cfg.wr_coeff >= 1);
        assert!(cfg.slice_idle_ns >= MIN_SLICE_IDLE_NS);
    }
}
