// SPDX-License-Identifier: MPL-2.0

//! I/O priority classes and device speed classification, as closed sum
//! types (per the "tagged variants" design note).

use int_to_c_enum::TryFromInt;

/// The I/O priority class of an entity, served strictly RT > BE > IDLE when
/// the scheduler runs in strict-guarantees mode (§4.1).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromInt)]
pub enum IoPrioClass {
    Rt = 0,
    Be = 1,
    Idle = 2,
}

impl IoPrioClass {
    pub const COUNT: usize = 3;

    pub const ALL: [IoPrioClass; Self::COUNT] = [Self::Rt, Self::Be, Self::Idle];

    pub const fn index(self) -> usize {
        self as u8 as usize
    }
}

impl Default for IoPrioClass {
    fn default() -> Self {
        Self::Be
    }
}

/// Coarse device classification used to pick the weight-raising reference
/// rate/duration pair (§4.8) and the "slow" charging bias (§4.6).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
pub enum DeviceSpeed {
    Slow = 0,
    Fast = 1,
}

impl Default for DeviceSpeed {
    fn default() -> Self {
        Self::Slow
    }
}
