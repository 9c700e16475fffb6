//! Math utilities

mod mod_group;

use core::ops::{Add, Rem, Sub};

pub use mod_group::*;

/// A utility trait for unsigned integer types
pub trait UnsignedNumber:
    Copy
    + Add<Self, Output = Self>
    + Sub<Self, Output = Self>
    + Rem<Self, Output = Self>
    + PartialEq
    + Eq
    + PartialOrd
    + Ord
{
    /// the zero value
    const ZERO: Self;
    /// the 1 value
    const ONE: Self;
}

macro_rules! impl_unsigned_number {
    ($($typ:ident),*) => {
        $(
            impl UnsignedNumber for $typ {
                const ZERO: Self = 0;
                const ONE: Self = 1;
            }
        )*
    };
}

impl_unsigned_number!(u8, u16, u32, u64, usize);
