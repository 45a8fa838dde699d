// SPDX-License-Identifier: MPL-2.0

//! Small `Copy` identifiers addressing entries in the crate's arenas.
//!
//! Per the "cyclic/intrusive structures" design note, entities, queues,
//! groups and requests are never reached through owning pointers from more
//! than one place; every secondary collection (service trees, the burst
//! list, the position tree, the async-slot back-pointers) holds one of these
//! ids instead.

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(usize);

        impl $name {
            pub(crate) fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            pub(crate) fn raw(self) -> usize {
                self.0
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies an [`crate::entity::Entity`] in the scheduler's entity arena.
    EntityId
);
define_id!(
    /// Identifies a [`crate::queue::Queue`] in the scheduler's queue arena.
    QueueId
);
define_id!(
    /// Identifies a [`crate::group::Group`] in the scheduler's group arena.
    GroupId
);
define_id!(
    /// Identifies a [`crate::request::Request`] in the scheduler's request arena.
    RequestId
);
define_id!(
    /// Identifies an [`crate::IoContext`] (the per-process `icq` control
    /// block that owns sync/async queue pointers, §6 `init_icq`/`exit_icq`).
    IoContextId
);
