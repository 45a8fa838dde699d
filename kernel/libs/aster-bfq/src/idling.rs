// SPDX-License-Identifier: MPL-2.0

//! Idling controller (§4.4): deciding whether to idle the device once a
//! queue's sort list drains but it may still have more I/O coming.

/// Inputs describing the scenario relevant to the idling decision; computed
/// by the caller from the full scheduler state (all busy queues/groups).
#[derive(Clone, Copy, Debug)]
pub struct IdlingScenario {
    /// The queue is synchronous and not classified `Idle` priority.
    pub queue_is_sync_non_idle_class: bool,
    /// The device has no internal parallel queueing (e.g. a simple
    /// rotational disk) or is rotational and the queue's I/O is sequential.
    pub device_benefits_from_idling_for_throughput: bool,
    /// The queue is seeky.
    pub queue_is_seeky: bool,
    /// All busy queues/groups share one weight and none is weight-raised
    /// (GLOSSARY "Symmetric scenario").
    pub symmetric_scenario: bool,
    /// The queue itself is currently weight-raised.
    pub queue_is_weight_raised: bool,
    /// Some other weight-raised queue is backlogged.
    pub other_weight_raised_queue_backlogged: bool,
}

/// Whether idling is needed purely to preserve service guarantees, i.e. the
/// scenario is asymmetric in a way throughput-only idling would miss.
pub fn needs_idling_for_guarantees(scenario: &IdlingScenario) -> bool {
    !scenario.symmetric_scenario || scenario.queue_is_weight_raised || scenario.other_weight_raised_queue_backlogged
}

/// §4.4: whether the controller should arm the idling timer for this queue.
pub fn should_idle(scenario: &IdlingScenario) -> bool {
    if !scenario.queue_is_sync_non_idle_class {
        return false;
    }

    if scenario.queue_is_seeky && scenario.symmetric_scenario && !scenario.queue_is_weight_raised {
        return false;
    }

    scenario.device_benefits_from_idling_for_throughput || needs_idling_for_guarantees(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> IdlingScenario {
        IdlingScenario {
            queue_is_sync_non_idle_class: true,
            device_benefits_from_idling_for_throughput: false,
            queue_is_seeky: false,
            symmetric_scenario: true,
            queue_is_weight_raised: false,
            other_weight_raised_queue_backlogged: false,
        }
    }

    #[test]
    fn async_queue_never_idles() {
        let mut s = base();
        s.queue_is_sync_non_idle_class = false;
        s.device_benefits_from_idling_for_throughput = true;
        assert!(!should_idle(&s));
    }

    #[test]
    fn seeky_symmetric_non_raised_skips_idling() {
        let mut s = base();
        s.queue_is_seeky = true;
        assert!(!should_idle(&s));
    }

    #[test]
    fn seeky_but_weight_raised_still_idles_for_guarantees() {
        let mut s = base();
        s.queue_is_seeky = true;
        s.queue_is_weight_raised = true;
        assert!(should_idle(&s));
    }

    #[test]
    fn asymmetric_scenario_idles_for_guarantees_even_without_throughput_benefit() {
        let mut s = base();
        s.symmetric_scenario = false;
        assert!(should_idle(&s));
    }
}
