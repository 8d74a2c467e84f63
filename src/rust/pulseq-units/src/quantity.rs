// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, Div, Mul, Neg, Sub};

use num_traits::Zero;

use crate::{Unit, round_to_significant_digits};

/// A physical value tagged with its runtime unit.
///
/// # Examples
/// ```rust
/// use pulseq_units::{hertz, seconds};
///
/// let f = hertz(5.8e9);
/// let t = seconds(100e-9);
/// assert_ne!(f.unit, t.unit);
/// ```
#[derive(Clone, Copy, Default)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub const fn new(value: f64, unit: Unit) -> Self {
        Quantity { value, unit }
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        if self.unit != other.unit {
            return false;
        }
        let a = self.value;
        let b = other.value;
        if a.is_zero() && b.is_zero() { true } else { a == b }
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.unit != other.unit {
            return None;
        }
        self.value.partial_cmp(&other.value)
    }
}

impl Debug for Quantity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Quantity")
            .field("value", &self.value)
            .field("unit", &self.unit)
            .finish()
    }
}

impl Add for Quantity {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.unit, rhs.unit);
        Quantity {
            value: self.value + rhs.value,
            unit: self.unit,
        }
    }
}

impl Sub for Quantity {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.unit, rhs.unit);
        Quantity {
            value: self.value - rhs.value,
            unit: self.unit,
        }
    }
}

impl Mul<f64> for Quantity {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self::Output {
        Quantity {
            value: self.value * rhs,
            unit: self.unit,
        }
    }
}

impl Div<f64> for Quantity {
    type Output = Self;

    fn div(self, rhs: f64) -> Self::Output {
        Quantity {
            value: self.value / rhs,
            unit: self.unit,
        }
    }
}

impl Neg for Quantity {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Quantity {
            value: -self.value,
            unit: self.unit,
        }
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            Display::fmt(&self.value, f)?;
        } else {
            // The debug representation picks precision and scientific notation
            // automatically, which reads better for instrument values. Round
            // slightly below epsilon precision to hide accumulated float noise.
            let significand_digits = (-f64::EPSILON.log10() - 1.0) as u32;
            let value = round_to_significant_digits(self.value, significand_digits);
            Debug::fmt(&value, f)?;
        }
        if self.unit != Unit::Dimensionless {
            write!(f, " ")?;
            Display::fmt(&self.unit, f)?;
        }
        Ok(())
    }
}

pub const fn seconds(value: f64) -> Quantity {
    Quantity::new(value, Unit::Seconds)
}

pub const fn hertz(value: f64) -> Quantity {
    Quantity::new(value, Unit::Hertz)
}

pub const fn dimensionless(value: f64) -> Quantity {
    Quantity::new(value, Unit::Dimensionless)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let q = seconds(1e-6);
        assert_eq!(format!("{q}"), "1e-6 s");

        let q = seconds(1.1500000000000002e-6);
        assert_eq!(format!("{q}"), "1.15e-6 s");

        let q = dimensionless(0.5);
        assert_eq!(format!("{q}"), "0.5");
    }

    #[test]
    fn test_eq() {
        assert_eq!(seconds(1e-6), seconds(1e-6));
        assert_eq!(seconds(0.0), seconds(-0.0));
        assert_ne!(seconds(1.0), hertz(1.0));
        assert_ne!(seconds(1e-6), seconds(2e-6));
    }

    #[test]
    fn test_cmp_across_units() {
        assert!(seconds(1e-6) < seconds(2e-6));
        assert!(seconds(1.0).partial_cmp(&hertz(1.0)).is_none());
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(seconds(1e-6) + seconds(1e-6), seconds(2e-6));
        assert_eq!(hertz(3e9) - hertz(1e9), hertz(2e9));
        assert_eq!(seconds(1e-6) * 2.0, seconds(2e-6));
        assert_eq!(seconds(2e-6) / 2.0, seconds(1e-6));
        assert_eq!(-seconds(1e-6), seconds(-1e-6));
    }
}
