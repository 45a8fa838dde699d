// SPDX-License-Identifier: MPL-2.0

//! Expiration and budget feedback (§4.6): deciding why a slice ended, how
//! much service to charge, and how to resize the budget for the entity's
//! next activation.

use int_to_c_enum::TryFromInt;

/// Why the in-service queue was expired.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
pub enum ExpireReason {
    BudgetTimeout = 0,
    BudgetExhausted = 1,
    TooIdle = 2,
    NoMoreRequests = 3,
    Preempted = 4,
}

/// A queue is "slow" when it served less than half its budget over at
/// least 20ms (the rotational-bias floor below which short slices instead
/// use seekyness as the slow proxy, per §4.6 step 1).
pub const SLOW_ELAPSED_FLOOR_NS: u64 = 20_000_000;

pub fn is_slow(elapsed_ns: u64, service_sectors: u64, max_budget_sectors: u64) -> bool {
    elapsed_ns >= SLOW_ELAPSED_FLOOR_NS && service_sectors * 2 < max_budget_sectors
}

/// §4.6 step 2: decide whether to charge the actual sectors served, or a
/// time-derived charge (scaled by the peak rate) that discourages seeky
/// hogging while preserving elasticity for genuinely fast queues.
pub fn charge_service(
    reason: ExpireReason,
    actual_service_sectors: u64,
    budget_sectors: u64,
    elapsed_ns: u64,
    slow: bool,
    peak_rate_sectors_per_s: u64,
) -> u64 {
    let timed_out_with_budget_left =
        reason == ExpireReason::BudgetTimeout && actual_service_sectors * 3 < budget_sectors * 2;

    if slow || timed_out_with_budget_left {
        (elapsed_ns as u128 * peak_rate_sectors_per_s as u128 / 1_000_000_000u128) as u64
    } else {
        actual_service_sectors
    }
}

/// §4.6 step 3: the next activation's `max_budget`, per expiration reason.
///
/// Async queues bypass this entirely and always get `configured_max_budget`
/// (the `Config::max_budget_sectors` tunable, or the peak-rate-derived
/// auto value), regardless of why they expired.
///
/// The `TOO_IDLE`-without-outstanding-requests case ("shrink by 4x
/// min_budget") is read here as subtracting four times the minimum budget
/// from the current one (floored at the minimum), rather than dividing by
/// four, since the spec phrases the adjustment as an additive "shrink by"
/// rather than a multiplicative rescale; this interpretation is recorded in
/// DESIGN.md.
pub fn next_max_budget(
    reason: ExpireReason,
    prev_max_budget_sectors: u64,
    actual_service_sectors: u64,
    min_budget_sectors: u64,
    has_outstanding_requests: bool,
    is_async: bool,
    configured_max_budget_sectors: u64,
) -> u64 {
    if is_async {
        return configured_max_budget_sectors.max(min_budget_sectors);
    }

    match reason {
        ExpireReason::TooIdle => {
            if has_outstanding_requests {
                prev_max_budget_sectors.saturating_mul(2)
            } else {
                prev_max_budget_sectors
                    .saturating_sub(min_budget_sectors.saturating_mul(4))
                    .max(min_budget_sectors)
            }
        }
        ExpireReason::BudgetTimeout => prev_max_budget_sectors.saturating_mul(2),
        ExpireReason::BudgetExhausted => prev_max_budget_sectors.saturating_mul(4),
        ExpireReason::NoMoreRequests => actual_service_sectors.max(min_budget_sectors),
        ExpireReason::Preempted => prev_max_budget_sectors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausted_quadruples() {
        assert_eq!(
            next_max_budget(ExpireReason::BudgetExhausted, 1000, 1000, 100, false, false, 0),
            4000
        );
    }

    #[test]
    fn too_idle_with_outstanding_doubles() {
        assert_eq!(
            next_max_budget(ExpireReason::TooIdle, 1000, 100, 100, true, false, 0),
            2000
        );
    }

    #[test]
    fn too_idle_without_outstanding_shrinks_but_not_below_min() {
        let result = next_max_budget(ExpireReason::TooIdle, 300, 50, 100, false, false, 0);
        assert_eq!(result, 100);
    }

    #[test]
    fn no_more_requests_uses_actual_service_floor_min() {
        assert_eq!(
            next_max_budget(ExpireReason::NoMoreRequests, 1000, 50, 100, false, false, 0),
            100
        );
        assert_eq!(
            next_max_budget(ExpireReason::NoMoreRequests, 1000, 500, 100, false, false, 0),
            500
        );
    }

    #[test]
    fn async_queue_always_gets_configured_budget() {
        assert_eq!(
            next_max_budget(ExpireReason::BudgetExhausted, 1000, 1000, 100, false, true, 5000),
            5000
        );
    }

    #[test]
    fn slow_queue_is_charged_by_time_not_service() {
        let charge = charge_service(ExpireReason::NoMoreRequests, 10, 1000, 40_000_000, true, 10_000);
        // 40ms at 10,000 sectors/s == 400 sectors, far more than the 10 actually served.
        assert_eq!(charge, 400);
    }

    #[test]
    fn fast_queue_is_charged_actual_service() {
        let charge = charge_service(ExpireReason::BudgetExhausted, 900, 1000, 5_000_000, false, 10_000);
        assert_eq!(charge, 900);
    }
}
