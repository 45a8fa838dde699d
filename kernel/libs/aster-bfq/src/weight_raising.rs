// SPDX-License-Identifier: MPL-2.0

//! Weight raising (§4.3): a transient multiplication of a queue's effective
//! weight to reduce latency for interactive or soft-real-time workloads.

use crate::{
    coeff::{wr_reference, MAX_WR_DURATION_MS, MIN_WR_DURATION_MS, SOFTRT_WR_COEFF_FACTOR},
    prio::DeviceSpeed,
    time::Nanos,
};

/// Why a queue is currently weight-raised, if at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrKind {
    None,
    /// Raised because the queue looked interactive: idle long enough, then
    /// bursting requests.
    Interactive,
    /// Raised because the queue's demand fits a soft-real-time pattern;
    /// continually refreshed while the predicate holds.
    SoftRt,
}

impl Default for WrKind {
    fn default() -> Self {
        Self::None
    }
}

/// A queue's weight-raising state.
#[derive(Clone, Copy, Debug)]
pub struct WrState {
    pub kind: WrKind,
    /// Multiplier on `orig_weight`; `1` when not raised.
    pub coeff: u32,
    pub start_ns: Nanos,
    pub cur_max_time_ns: u64,
}

impl Default for WrState {
    fn default() -> Self {
        Self {
            kind: WrKind::None,
            coeff: 1,
            start_ns: 0,
            cur_max_time_ns: 0,
        }
    }
}

impl WrState {
    pub fn is_active(&self) -> bool {
        !matches!(self.kind, WrKind::None)
    }

    pub fn elapsed(&self, now: Nanos) -> u64 {
        now.saturating_sub(self.start_ns)
    }

    /// Duration elapsed, per the termination condition "duration elapsed".
    pub fn has_expired(&self, now: Nanos) -> bool {
        self.is_active() && self.elapsed(now) >= self.cur_max_time_ns
    }

    pub fn start_interactive(&mut self, now: Nanos, base_coeff: u32, duration_ms: u64) {
        self.kind = WrKind::Interactive;
        self.coeff = base_coeff.max(1);
        self.start_ns = now;
        self.cur_max_time_ns = duration_ms.saturating_mul(1_000_000);
    }

    pub fn start_soft_rt(&mut self, now: Nanos, base_coeff: u32, duration_ms: u64) {
        self.kind = WrKind::SoftRt;
        self.coeff = base_coeff.saturating_mul(SOFTRT_WR_COEFF_FACTOR).max(1);
        self.start_ns = now;
        self.cur_max_time_ns = duration_ms.saturating_mul(1_000_000);
    }

    /// Refreshes a soft-real-time raise that is still active, per §4.3
    /// "continually refreshed while the soft-rt predicate holds". A no-op
    /// if the queue is not currently soft-rt raised.
    pub fn refresh_soft_rt(&mut self, now: Nanos, duration_ms: u64) {
        if self.kind == WrKind::SoftRt {
            self.start_ns = now;
            self.cur_max_time_ns = duration_ms.saturating_mul(1_000_000);
        }
    }

    /// Ends weight raising immediately (queue joined a large burst, or was
    /// explicitly ended).
    pub fn stop(&mut self) {
        *self = Self::default();
    }
}

/// `T_ref * R_ref / peak_rate`, clamped to `[MIN_WR_DURATION_MS,
/// MAX_WR_DURATION_MS]` (§4.3 interactive raising duration).
pub fn interactive_duration_ms(speed: DeviceSpeed, peak_rate_sectors_per_s: u64) -> u64 {
    let reference = wr_reference(speed);
    let peak = peak_rate_sectors_per_s.max(1);
    let raw = reference
        .t_ref_ms
        .saturating_mul(reference.r_ref_sectors_per_s)
        / peak;
    raw.clamp(MIN_WR_DURATION_MS, MAX_WR_DURATION_MS)
}

/// Soft-real-time next-start predictor (§4.3): after the last request of a
/// batch completes, this is the time by which the queue must still be idle
/// for the *next* busy transition to count as soft-rt.
///
/// `last_idle_backlogged` is the time the queue last went from idle to
/// backlogged; `service_from_backlogged` is sectors served since then;
/// `soft_rate` is the reference rate ceiling (`wr_max_softrt_rate`); the
/// result is clamped above by `now + slice_idle + guard` so a predictor
/// error can never push the deadline arbitrarily far into the future.
pub fn predict_soft_rt_next_start(
    last_idle_backlogged_ns: Nanos,
    service_from_backlogged_sectors: u64,
    soft_rate_sectors_per_s: u64,
    now: Nanos,
    slice_idle_ns: u64,
    guard_ns: u64,
) -> Nanos {
    let rate = soft_rate_sectors_per_s.max(1);
    let duration_ns = (service_from_backlogged_sectors as u128 * 1_000_000_000u128 / rate as u128) as u64;
    let predicted = last_idle_backlogged_ns.saturating_add(duration_ns);
    let ceiling = now.saturating_add(slice_idle_ns).saturating_add(guard_ns);
    predicted.min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_duration_clamped_to_window() {
        let d = interactive_duration_ms(DeviceSpeed::Fast, 1);
        assert_eq!(d, MAX_WR_DURATION_MS);
        let d = interactive_duration_ms(DeviceSpeed::Fast, u64::MAX / 2);
        assert_eq!(d, MIN_WR_DURATION_MS);
    }

    #[test]
    fn soft_rt_refresh_only_affects_softrt_state() {
        let mut wr = WrState::default();
        wr.start_interactive(0, 30, 5_000);
        wr.refresh_soft_rt(1_000, 300);
        assert_eq!(wr.kind, WrKind::Interactive);
        assert_eq!(wr.cur_max_time_ns, 5_000 * 1_000_000);
    }

    #[test]
    fn predictor_is_clamped_by_ceiling() {
        let predicted = predict_soft_rt_next_start(0, u64::MAX, 1, 0, 8_000_000, 1_000_000);
        assert_eq!(predicted, 9_000_000);
    }
}
