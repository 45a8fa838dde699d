// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
pub(crate) use core::{
    cmp::Ordering,
    fmt::{self, Debug},
};
