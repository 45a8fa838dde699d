// SPDX-License-Identifier: MPL-2.0

//! Errors surfaced by the scheduling core to its caller.
//!
//! Most failure modes described by the algorithm (allocation failure, an
//! out-of-range tunable) are handled by substitution or clamping rather than
//! by a `Result`; see the crate-level docs. The variants here are reserved
//! for genuine caller mistakes, such as addressing an id that the arena no
//! longer holds.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by the public entry points of [`crate::SchedulerData`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The given `QueueId` does not name a queue currently held by the arena.
    UnknownQueue,
    /// The given `GroupId` does not name a group currently held by the arena.
    UnknownGroup,
    /// The given `RequestId` does not name a request currently held by the arena.
    UnknownRequest,
    /// The operation requires an in-service queue, but none is selected.
    NoInServiceQueue,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::UnknownQueue => "unknown queue id",
            Self::UnknownGroup => "unknown group id",
            Self::UnknownRequest => "unknown request id",
            Self::NoInServiceQueue => "no in-service queue",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Error {}
