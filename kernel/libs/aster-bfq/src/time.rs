// SPDX-License-Identifier: MPL-2.0

//! Time and virtual-time types.
//!
//! The crate is clock-agnostic: every operation that needs "now" takes it as
//! an explicit `Nanos` argument supplied by the caller (the block-layer glue
//! reads the real clock; tests drive a fake one). There is no process-wide
//! clock state, matching the "no global mutable state beyond the per-device
//! root" design note.

use core::ops::Add;

/// Wall-clock time in nanoseconds, as measured by the caller.
pub type Nanos = u64;

/// A sector count or a sector address, depending on context.
pub type Sector = u64;

/// Fixed-point scale applied when converting a budget (in sectors) and a
/// weight into a virtual-time delta, so that `budget / weight` retains
/// precision instead of truncating to zero for small budgets and large
/// weights.
pub const VTIME_SCALE: u64 = 256;

/// A WF2Q+ virtual timestamp.
///
/// Virtual time only ever moves forward within a scheduling node, and is
/// compared, never subtracted across nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualTime(u64);

impl VirtualTime {
    pub const ZERO: VirtualTime = VirtualTime(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

impl Add<u64> for VirtualTime {
    type Output = VirtualTime;

    fn add(self, delta: u64) -> VirtualTime {
        self.saturating_add(delta)
    }
}

/// Computes the virtual-time delta `budget / weight` in `VTIME_SCALE` fixed
/// point, per the entity invariant `finish == start + budget / weight`.
///
/// `weight` of zero is nonsensical (every entity has a positive weight by
/// construction) and is treated as 1 to avoid a division by zero from ever
/// reaching the caller.
pub fn vtime_delta(budget_sectors: u64, weight: u32) -> u64 {
    let weight = weight.max(1) as u64;
    budget_sectors.saturating_mul(VTIME_SCALE) / weight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtime_delta_is_monotonic_in_budget() {
        assert!(vtime_delta(200, 100) > vtime_delta(100, 100));
    }

    #[test]
    fn vtime_delta_is_antitonic_in_weight() {
        assert!(vtime_delta(100, 100) > vtime_delta(100, 200));
    }

    #[test]
    fn higher_weight_finishes_sooner_for_equal_budget() {
        let low = VirtualTime::ZERO + vtime_delta(1000, 100);
        let high = VirtualTime::ZERO + vtime_delta(1000, 200);
        assert!(high < low);
    }
}
