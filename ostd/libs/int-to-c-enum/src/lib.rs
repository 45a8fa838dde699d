// SPDX-License-Identifier: MPL-2.0

//! A convenient derive macro for converting an integer to a C-like enum.
//!
//! ```ignore
//! #[derive(TryFromInt)]
//! #[repr(u8)]
//! enum Color {
//!     Red = 0,
//!     Green = 1,
//!     Blue = 2,
//! }
//!
//! assert!(Color::try_from(1).is_ok());
//! assert!(Color::try_from(3).is_err());
//! ```

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "derive")]
pub use int_to_c_enum_derive::TryFromInt;

/// The error returned when converting an out-of-range integer to a C-like enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TryFromIntError(());

impl TryFromIntError {
    #[doc(hidden)]
    pub const fn new() -> Self {
        Self(())
    }
}

impl core::fmt::Display for TryFromIntError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("out of range integral type conversion attempted")
    }
}

#[cfg(feature = "derive")]
impl core::error::Error for TryFromIntError {}
