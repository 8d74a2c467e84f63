// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Sweep descriptors.
//!
//! A [`HardwareSweep`] is iterated by the device's own looping hardware in a
//! single acquisition; a [`SoftwareSweep`] is iterated by the host, one
//! acquisition per point.

use pulseq_units::Unit;

use crate::parameter::{ParameterArena, RegisterId};
use crate::{Error, Result};

/// Optional removal of the first and/or last generated sweep point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trim {
    pub skip_first: bool,
    pub skip_last: bool,
}

impl Trim {
    pub const NONE: Trim = Trim {
        skip_first: false,
        skip_last: false,
    };
}

/// A device-looped sweep over one quantized register.
///
/// Start and stop are quantized independently and the step is computed in
/// the integer domain with truncating division, matching the fixed-point
/// step register of the device. Points are generated by repeated integer
/// addition so the host enumeration cannot drift from the device's counter.
#[derive(Debug, Clone)]
pub struct HardwareSweep {
    register: RegisterId,
    start_code: i64,
    step_code: i64,
    count: usize,
    quantum: f64,
    name: String,
    unit: Unit,
}

impl HardwareSweep {
    pub fn new(
        arena: &ParameterArena,
        register: RegisterId,
        start: f64,
        stop: f64,
        num: usize,
        trim: Trim,
    ) -> Result<Self> {
        if num < 2 {
            return Err(Error::Precondition(format!(
                "hardware sweep needs at least 2 points to define a step, got {num}"
            )));
        }
        let parameter = arena.get(register);
        let start_code = parameter.encode(start)?;
        let stop_code = parameter.encode(stop)?;
        // Truncating division, as executed by the device step register. A
        // zero step is valid and yields a constant-valued loop.
        let step_code = (stop_code - start_code) / (num as i64 - 1);

        let mut first = start_code;
        let mut count = num;
        if trim.skip_first {
            first += step_code;
            count -= 1;
        }
        if trim.skip_last {
            count -= 1;
        }
        if count == 0 {
            return Err(Error::Precondition(
                "hardware sweep trimmed to zero points".to_string(),
            ));
        }
        Ok(HardwareSweep {
            register,
            start_code: first,
            step_code,
            count,
            quantum: parameter.quantum(),
            name: parameter.name().to_string(),
            unit: parameter.unit(),
        })
    }

    pub fn register(&self) -> RegisterId {
        self.register
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn start_code(&self) -> i64 {
        self.start_code
    }

    pub fn step_code(&self) -> i64 {
        self.step_code
    }

    /// Physical units per code of the swept register.
    pub fn quantum(&self) -> f64 {
        self.quantum
    }

    /// Physical step between consecutive points. May differ slightly from a
    /// naive float division of the requested span; the integer step is
    /// authoritative.
    pub fn step(&self) -> f64 {
        self.step_code as f64 * self.quantum
    }

    /// The exact integer code sequence the device will execute.
    pub fn codes(&self) -> Vec<i64> {
        let mut codes = Vec::with_capacity(self.count);
        let mut code = self.start_code;
        for _ in 0..self.count {
            codes.push(code);
            code += self.step_code;
        }
        codes
    }

    /// Physical values corresponding to [`Self::codes`].
    pub fn values(&self) -> Vec<f64> {
        self.codes()
            .into_iter()
            .map(|c| c as f64 * self.quantum)
            .collect()
    }

    /// Physical value of the first point, used to park the register before
    /// the loop starts.
    pub fn first_value(&self) -> f64 {
        self.start_code as f64 * self.quantum
    }
}

/// A host-looped sweep assigning the same value sequence to one or more
/// co-varying registers.
///
/// Co-swept registers share a single coordinate axis; all of them must carry
/// the same physical unit.
#[derive(Debug, Clone)]
pub struct SoftwareSweep {
    registers: Vec<RegisterId>,
    values: Vec<f64>,
    name: String,
    unit: Unit,
}

impl SoftwareSweep {
    /// Build from an explicit value sequence, used verbatim after trimming.
    pub fn from_values(
        arena: &ParameterArena,
        registers: Vec<RegisterId>,
        values: Vec<f64>,
        trim: Trim,
    ) -> Result<Self> {
        let (name, unit) = Self::check_registers(arena, &registers)?;
        let mut values = values;
        if trim.skip_first && !values.is_empty() {
            values.remove(0);
        }
        if trim.skip_last {
            values.pop();
        }
        if values.is_empty() {
            return Err(Error::Precondition(format!(
                "software sweep over '{name}' has no points left after trimming"
            )));
        }
        Ok(SoftwareSweep {
            registers,
            values,
            name,
            unit,
        })
    }

    /// Build a linearly spaced sequence of `num` values from `start` to
    /// `stop` inclusive.
    pub fn linspace(
        arena: &ParameterArena,
        registers: Vec<RegisterId>,
        start: f64,
        stop: f64,
        num: usize,
        trim: Trim,
    ) -> Result<Self> {
        if num < 2 {
            return Err(Error::Precondition(format!(
                "software linspace sweep needs at least 2 points, got {num}"
            )));
        }
        let step = (stop - start) / (num as f64 - 1.0);
        let values = (0..num).map(|i| start + step * i as f64).collect();
        Self::from_values(arena, registers, values, trim)
    }

    fn check_registers(
        arena: &ParameterArena,
        registers: &[RegisterId],
    ) -> Result<(String, Unit)> {
        let Some(first) = registers.first() else {
            return Err(Error::Precondition(
                "software sweep needs at least one parameter".to_string(),
            ));
        };
        let name = arena.get(*first).name().to_string();
        let unit = arena.get(*first).unit();
        for id in &registers[1..] {
            let other = arena.get(*id);
            if other.unit() != unit {
                return Err(Error::Precondition(format!(
                    "co-swept parameters '{name}' ({unit}) and '{}' ({}) differ in unit",
                    other.name(),
                    other.unit()
                )));
            }
        }
        Ok((name, unit))
    }

    pub fn registers(&self) -> &[RegisterId] {
        &self.registers
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Assign the value of step `index` to every co-swept register.
    pub(crate) fn apply(&self, arena: &mut ParameterArena, index: usize) -> Result<()> {
        let value = self.values[index];
        for id in &self.registers {
            arena.get_mut(*id).set(value)?;
        }
        Ok(())
    }
}
