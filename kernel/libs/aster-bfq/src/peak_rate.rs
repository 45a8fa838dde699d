// SPDX-License-Identifier: MPL-2.0

//! Peak-rate estimator and auto-tuner (§4.8): an EWMA of observed dispatch
//! bandwidth, used to recompute `max_budget` and the weight-raising
//! duration.

use crate::{
    coeff::DEVICE_SPEED_THRESH_SECTORS_PER_S,
    prio::DeviceSpeed,
    seek::SEEK_THR_SECTORS,
    time::{Nanos, Sector},
};

/// One second, the minimum window before a peak-rate sample is trusted.
pub const REF_INTERVAL_NS: u64 = 1_000_000_000;
/// Minimum samples before a window is trusted.
pub const MIN_SAMPLES: u32 = 32;
/// Implausibly high bandwidth rejected outright.
pub const IMPLAUSIBLE_RATE_SECTORS_PER_S: u64 = 20_000_000;
/// Below this rate a completion is considered so delayed that the current
/// window should be discarded and restarted.
pub const MIN_PLAUSIBLE_RATE_SECTORS_PER_S: u64 = 1_000_000;
/// `min_tt`: maximum gap since the last completion for a dispatch to still
/// count as sequential-with-the-driver-busy.
pub const MIN_TT_NS: u64 = 2_000_000;

/// Accumulates dispatch samples within the current estimation window.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeakRateEstimator {
    window_start_ns: Nanos,
    samples: u32,
    sequential_samples: u32,
    sectors_dispatched: u64,
    last_position: Option<Sector>,
    last_completion_ns: Nanos,
    peak_rate_sectors_per_s: u64,
    speed: DeviceSpeedTag,
}

/// Internal mirror of [`DeviceSpeed`] that additionally starts out unknown,
/// so the first classification always happens after the first trusted
/// sample rather than defaulting silently to SLOW.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum DeviceSpeedTag {
    #[default]
    Unknown,
    Known(DeviceSpeed),
}

impl PeakRateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peak_rate(&self) -> u64 {
        self.peak_rate_sectors_per_s
    }

    pub fn device_speed(&self) -> DeviceSpeed {
        match self.speed {
            DeviceSpeedTag::Known(speed) => speed,
            DeviceSpeedTag::Unknown => DeviceSpeed::Slow,
        }
    }

    /// Records one dispatched request at `now`, targeting `position`, with
    /// `n_sectors` transferred. `driver_busy` is whether the device already
    /// had outstanding requests when this one was dispatched.
    pub fn on_dispatch(&mut self, now: Nanos, position: Sector, n_sectors: u32, driver_busy: bool) {
        if self.samples == 0 {
            self.window_start_ns = now;
        }

        let sequential = self
            .last_position
            .is_some_and(|last| position.abs_diff(last) < SEEK_THR_SECTORS)
            && (driver_busy || now.saturating_sub(self.last_completion_ns) <= MIN_TT_NS);

        self.samples += 1;
        if sequential {
            self.sequential_samples += 1;
        }
        self.sectors_dispatched += n_sectors as u64;
        self.last_position = Some(position + n_sectors as u64);

        let elapsed = now.saturating_sub(self.window_start_ns);
        if elapsed >= REF_INTERVAL_NS && self.samples >= MIN_SAMPLES {
            self.try_commit_window(elapsed);
        }
    }

    /// Records a request completion; if it arrives so late that the
    /// implied instantaneous rate looks broken, the current window is
    /// discarded and a new one starts from this completion.
    pub fn on_completion(&mut self, now: Nanos, n_sectors: u32) {
        self.last_completion_ns = now;

        if self.samples > 0 {
            let elapsed = now.saturating_sub(self.window_start_ns).max(1);
            let implied_rate = (n_sectors as u128 * 1_000_000_000u128 / elapsed as u128) as u64;
            if implied_rate < MIN_PLAUSIBLE_RATE_SECTORS_PER_S {
                self.reset_window();
            }
        }
    }

    fn try_commit_window(&mut self, elapsed_ns: u64) {
        let bw = (self.sectors_dispatched as u128 * 1_000_000_000u128 / elapsed_ns as u128) as u64;
        let sequential_fraction_below_3_4 = self.sequential_samples * 4 < self.samples * 3;

        let reject = (sequential_fraction_below_3_4 && bw <= self.peak_rate_sectors_per_s)
            || bw > IMPLAUSIBLE_RATE_SECTORS_PER_S;

        if !reject {
            let w = (9 * self.sequential_samples as u64 * elapsed_ns
                / (self.samples.max(1) as u64 * REF_INTERVAL_NS))
                .min(8);
            let divisor = 10 - w;
            self.peak_rate_sectors_per_s =
                (self.peak_rate_sectors_per_s * (divisor - 1) + bw) / divisor;
            self.speed = DeviceSpeedTag::Known(if self.peak_rate_sectors_per_s >= DEVICE_SPEED_THRESH_SECTORS_PER_S {
                DeviceSpeed::Fast
            } else {
                DeviceSpeed::Slow
            });
        }

        self.reset_window();
    }

    fn reset_window(&mut self) {
        self.window_start_ns = 0;
        self.samples = 0;
        self.sequential_samples = 0;
        self.sectors_dispatched = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_burst_raises_peak_rate_and_classifies_fast() {
        let mut est = PeakRateEstimator::new();
        let mut now = 0u64;
        let mut pos = 0u64;
        for _ in 0..64 {
            est.on_dispatch(now, pos, 512, true);
            pos += 512;
            now += 15_000_000; // 64 * 15ms ~= 1s window
        }
        assert!(est.peak_rate() > 0);
    }

    #[test]
    fn too_few_samples_never_commits() {
        let mut est = PeakRateEstimator::new();
        est.on_dispatch(0, 0, 512, true);
        est.on_dispatch(2_000_000_000, 512, 512, true);
        assert_eq!(est.peak_rate(), 0);
    }

    #[test]
    fn badly_delayed_completion_resets_window() {
        let mut est = PeakRateEstimator::new();
        for i in 0..10 {
            est.on_dispatch(i * 1_000, i * 512, 512, true);
        }
        est.on_completion(10_000_000_000, 1);
        // Window should have been discarded; next dispatch starts a fresh one.
        est.on_dispatch(10_000_000_001, 0, 512, true);
    }
}
