// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use pulseq_units::Unit;

use crate::channel::RegisterSpec;
use crate::{Error, Result};

/// Stable handle of a quantized register inside a [`ParameterArena`].
///
/// Instructions hold ids rather than owned copies, so two instructions that
/// sweep "the same" physical knob always resolve to one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(pub(crate) usize);

/// A physical value backed by a discrete device register.
///
/// `encode` maps a physical value to the integer code the register holds and
/// fails for values outside the representable range; `decode` is total over
/// the code range. `decode(encode(x))` rounds `x` to the nearest
/// representable quantum.
#[derive(Debug, Clone)]
pub struct QuantizedParameter {
    name: String,
    spec: RegisterSpec,
    /// Live physical value, mutated by `set` and read at acquisition time.
    value: f64,
}

impl QuantizedParameter {
    pub fn new(name: impl Into<String>, spec: RegisterSpec) -> Self {
        QuantizedParameter {
            name: name.into(),
            spec,
            value: 0.0f64.clamp(spec.physical_min(), spec.physical_max()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.spec.unit
    }

    /// Smallest representable physical step of this register.
    pub fn quantum(&self) -> f64 {
        self.spec.resolution
    }

    pub fn spec(&self) -> &RegisterSpec {
        &self.spec
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn encode(&self, value: f64) -> Result<i64> {
        let code = (value / self.spec.resolution).round() as i64;
        if code < self.spec.code_min || code > self.spec.code_max {
            return Err(Error::Quantization {
                register: self.name.clone(),
                value,
                min: self.spec.physical_min(),
                max: self.spec.physical_max(),
            });
        }
        Ok(code)
    }

    pub fn decode(&self, code: i64) -> f64 {
        code as f64 * self.spec.resolution
    }

    /// Update the live value. The requested value is kept verbatim; encoding
    /// only validates that the register can represent it.
    pub fn set(&mut self, value: f64) -> Result<()> {
        self.encode(value)?;
        self.value = value;
        Ok(())
    }

    /// Update the live value, snapping it to the representable grid, and
    /// return the snapped value.
    pub fn set_quantized(&mut self, value: f64) -> Result<f64> {
        let code = self.encode(value)?;
        self.value = self.decode(code);
        Ok(self.value)
    }
}

/// Owning store of all quantized registers of a protocol.
#[derive(Debug, Clone, Default)]
pub struct ParameterArena {
    registers: Vec<QuantizedParameter>,
}

impl ParameterArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parameter: QuantizedParameter) -> RegisterId {
        self.registers.push(parameter);
        RegisterId(self.registers.len() - 1)
    }

    pub fn get(&self, id: RegisterId) -> &QuantizedParameter {
        &self.registers[id.0]
    }

    pub fn get_mut(&mut self, id: RegisterId) -> &mut QuantizedParameter {
        &mut self.registers[id.0]
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}
