//! Numbers in the additive group modulo n.
//!
//! Used for ring indices that wrap around at the end of a queue.

use core::{
    fmt::{LowerHex, UpperHex},
    ops::{Add, AddAssign},
};

use super::UnsignedNumber;

/// A number that automatically wrapps at [Self::modulo].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrappingValue<T: UnsignedNumber> {
    value: T,
    modulo: T,
}

impl<T: UnsignedNumber> WrappingValue<T> {
    /// Creates a new [WrappingValue] with the value 0
    ///
    /// # Panics
    ///
    /// if `modulo` is 0
    pub fn zero(modulo: T) -> Self {
        Self::new(T::ZERO, modulo)
    }

    /// Creates a new [WrappingValue]
    ///
    /// `value` is reduced modulo `modulo`.
    ///
    /// # Panics
    ///
    /// if `modulo` is 0
    pub fn new(value: T, modulo: T) -> Self {
        assert!(modulo != T::ZERO, "modulo must not be 0");
        Self {
            value: value % modulo,
            modulo,
        }
    }

    /// The value
    pub fn value(self) -> T {
        self.value
    }

    /// The modulo used for all calculations
    pub fn modulo(self) -> T {
        self.modulo
    }

    /// The highest valid value using this [Self::modulo].
    pub fn max(self) -> T {
        self.modulo - T::ONE
    }
}

impl<T: UnsignedNumber> Add<T> for WrappingValue<T> {
    type Output = Self;

    fn add(self, rhs: T) -> Self::Output {
        let rhs = rhs % self.modulo;
        // value + rhs could overflow T, so compare against the distance to the modulo
        let to_wrap = self.modulo - self.value;
        let value = if rhs >= to_wrap {
            rhs - to_wrap
        } else {
            self.value + rhs
        };
        Self {
            value,
            modulo: self.modulo,
        }
    }
}

impl<T: UnsignedNumber> AddAssign<T> for WrappingValue<T> {
    fn add_assign(&mut self, rhs: T) {
        *self = *self + rhs;
    }
}

impl<T> core::fmt::Debug for WrappingValue<T>
where
    T: UnsignedNumber + core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("({:?} % {:?})", self.value, self.modulo))
    }
}

impl<T> LowerHex for WrappingValue<T>
where
    T: UnsignedNumber + LowerHex,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("({:#x} % {:#x})", self.value, self.modulo))
    }
}

impl<T> UpperHex for WrappingValue<T>
where
    T: UnsignedNumber + UpperHex,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("({:#X} % {:#X})", self.value, self.modulo))
    }
}

#[cfg(test)]
mod test {
    use super::WrappingValue;

    #[test]
    fn test_wrapping() {
        let mut wrapping = WrappingValue::zero(5u8);

        wrapping += 4;
        assert_eq!(wrapping.value(), 4);

        wrapping += 1;
        assert_eq!(wrapping.value(), 0);

        wrapping += 5;
        assert_eq!(wrapping.value(), 0);

        wrapping += 7;
        assert_eq!(wrapping.value(), 2);
    }

    #[test]
    fn test_wrapping_overflow() {
        let mut wrapping = WrappingValue::zero(5u8);

        wrapping += 4;
        assert_eq!(wrapping.value(), 4);

        wrapping += 255;
        assert_eq!(wrapping.value(), 4);

        wrapping += 254;
        assert_eq!(wrapping.value(), 3);
    }

    #[test]
    fn test_wrapping_large_modulo() {
        let mut wrapping = WrappingValue::new(u16::MAX - 1, u16::MAX);
        assert_eq!(wrapping.max(), u16::MAX - 1);

        wrapping += 1;
        assert_eq!(wrapping.value(), 0);

        wrapping += u16::MAX - 2;
        assert_eq!(wrapping.value(), u16::MAX - 2);

        wrapping += 3;
        assert_eq!(wrapping.value(), 1);
    }

    #[test]
    fn new_reduces_value() {
        let wrapping = WrappingValue::new(12u32, 5);
        assert_eq!(wrapping.value(), 2);
        assert_eq!(wrapping.modulo(), 5);
    }
}
