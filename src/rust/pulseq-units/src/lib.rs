// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Runtime physical-unit tagging for swept instrument parameters.
//!
//! Sweep axes carry their unit through to the result sink, and co-swept
//! parameters must agree on it, so the tag is a runtime value rather than a
//! zero-sized type parameter.

pub mod quantity;

pub use quantity::{Quantity, dimensionless, hertz, seconds};

use std::fmt;
use std::fmt::{Display, Formatter};

/// Physical unit of a channel register or sweep axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Unit {
    /// Unitless fraction of full scale, e.g. a DAC gain.
    #[default]
    Dimensionless,
    Hertz,
    Seconds,
    Degrees,
}

impl Display for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Unit::Dimensionless => "",
            Unit::Hertz => "Hz",
            Unit::Seconds => "s",
            Unit::Degrees => "deg",
        };
        write!(f, "{symbol}")
    }
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Dimensionless => "",
            Unit::Hertz => "Hz",
            Unit::Seconds => "s",
            Unit::Degrees => "deg",
        }
    }
}

pub(crate) fn round_to_significant_digits(x: f64, n: u32) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        let order = x.abs().log10().floor();
        let scale = 10f64.powf((n as f64) - 1.0 - order);
        (x * scale).round() / scale
    }
}
