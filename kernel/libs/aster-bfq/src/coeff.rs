// SPDX-License-Identifier: MPL-2.0

//! Reference-rate tables for weight-raising duration scaling (§4.3, §4.8).
//!
//! Per the "global mutable state" design note, these tables are produced
//! once and frozen; since they depend only on the device speed
//! classification (a closed two-valued enum), they are plain `const` data
//! rather than anything computed at startup.

use crate::prio::DeviceSpeed;

/// Reference bandwidth (sectors/s) and reference weight-raising duration
/// (ms) for a device speed class.
///
/// The interactive weight-raising duration is `T_ref * R_ref / peak_rate`,
/// clamped to `[MIN_WR_DURATION_MS, MAX_WR_DURATION_MS]` (§4.3).
#[derive(Clone, Copy, Debug)]
pub struct WrReference {
    pub r_ref_sectors_per_s: u64,
    pub t_ref_ms: u64,
}

const WR_REFERENCE_SLOW: WrReference = WrReference {
    r_ref_sectors_per_s: 7_000,
    t_ref_ms: 5_000,
};

const WR_REFERENCE_FAST: WrReference = WrReference {
    r_ref_sectors_per_s: 18_000,
    t_ref_ms: 5_000,
};

pub fn wr_reference(speed: DeviceSpeed) -> WrReference {
    match speed {
        DeviceSpeed::Slow => WR_REFERENCE_SLOW,
        DeviceSpeed::Fast => WR_REFERENCE_FAST,
    }
}

/// Peak-rate thresholds (sectors/s) separating FAST from SLOW devices,
/// applied after each peak-rate re-estimation (§4.8).
pub const DEVICE_SPEED_THRESH_SECTORS_PER_S: u64 = 10_000;

pub const MIN_WR_DURATION_MS: u64 = 3_000;
pub const MAX_WR_DURATION_MS: u64 = 13_000;

/// Multiplier applied to `wr_coeff` for soft-real-time raising (§4.3).
pub const SOFTRT_WR_COEFF_FACTOR: u32 = 2;
