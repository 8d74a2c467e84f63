// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Per-channel register descriptions.
//!
//! Every physical channel quantizes each register role with its own
//! resolution and code range. Two channels of the same kind may carry
//! different resolutions, so an integer code is never portable across
//! channels.

use pulseq_units::Unit;

/// Role of a quantized register within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterRole {
    Gain,
    Frequency,
    Phase,
    Time,
}

/// Quantization contract of one register: the physical step per code and the
/// signed or unsigned code range the timing hardware can hold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterSpec {
    /// Physical units per integer code.
    pub resolution: f64,
    pub code_min: i64,
    pub code_max: i64,
    pub unit: Unit,
}

impl RegisterSpec {
    pub fn new(resolution: f64, code_min: i64, code_max: i64, unit: Unit) -> Self {
        debug_assert!(resolution > 0.0);
        debug_assert!(code_min <= code_max);
        RegisterSpec {
            resolution,
            code_min,
            code_max,
            unit,
        }
    }

    /// Smallest representable physical value.
    pub fn physical_min(&self) -> f64 {
        self.code_min as f64 * self.resolution
    }

    /// Largest representable physical value.
    pub fn physical_max(&self) -> f64 {
        self.code_max as f64 * self.resolution
    }
}

/// A signal-generation port with its sampling clock and register widths.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorChannel {
    pub index: usize,
    /// Sampling rate of the DAC in Hz.
    pub sampling_rate: f64,
    pub freq_bits: u32,
    pub phase_bits: u32,
    pub gain_bits: u32,
    pub time_bits: u32,
}

impl GeneratorChannel {
    pub fn register_spec(&self, role: RegisterRole) -> RegisterSpec {
        match role {
            RegisterRole::Gain => {
                // Signed full-scale fraction; +1.0 maps to the largest code.
                let max = (1i64 << (self.gain_bits - 1)) - 1;
                RegisterSpec::new(1.0 / max as f64, -max - 1, max, Unit::Dimensionless)
            }
            RegisterRole::Frequency => RegisterSpec::new(
                self.sampling_rate / (1u64 << self.freq_bits) as f64,
                0,
                (1i64 << self.freq_bits) - 1,
                Unit::Hertz,
            ),
            RegisterRole::Phase => RegisterSpec::new(
                360.0 / (1u64 << self.phase_bits) as f64,
                0,
                (1i64 << self.phase_bits) - 1,
                Unit::Degrees,
            ),
            RegisterRole::Time => RegisterSpec::new(
                1.0 / self.sampling_rate,
                0,
                (1i64 << self.time_bits) - 1,
                Unit::Seconds,
            ),
        }
    }
}

/// A digitization port. Frequency here is the downconversion frequency of
/// the readout window; time is quantized on the ADC sample clock.
#[derive(Debug, Clone, Copy)]
pub struct DigitizerChannel {
    pub index: usize,
    /// Sampling rate of the ADC in Hz.
    pub sampling_rate: f64,
    pub freq_bits: u32,
    pub time_bits: u32,
}

impl DigitizerChannel {
    /// Register description for `role`, or `None` for roles a digitizer
    /// does not carry (gain, phase).
    pub fn register_spec(&self, role: RegisterRole) -> Option<RegisterSpec> {
        match role {
            RegisterRole::Frequency => Some(RegisterSpec::new(
                self.sampling_rate / (1u64 << self.freq_bits) as f64,
                0,
                (1i64 << self.freq_bits) - 1,
                Unit::Hertz,
            )),
            RegisterRole::Time => Some(RegisterSpec::new(
                1.0 / self.sampling_rate,
                0,
                (1i64 << self.time_bits) - 1,
                Unit::Seconds,
            )),
            RegisterRole::Gain | RegisterRole::Phase => None,
        }
    }

    /// Period of one decimated sample, the time axis step of waveform
    /// acquisitions.
    pub fn sample_period(&self) -> f64 {
        1.0 / self.sampling_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_gain_spec() {
        let ch = GeneratorChannel {
            index: 0,
            sampling_rate: 6.144e9,
            freq_bits: 32,
            phase_bits: 32,
            gain_bits: 16,
            time_bits: 24,
        };
        let spec = ch.register_spec(RegisterRole::Gain);
        assert_eq!(spec.code_max, 32767);
        assert_eq!(spec.code_min, -32768);
        assert_eq!(spec.physical_max(), 1.0);
        assert_eq!(spec.unit, Unit::Dimensionless);
    }

    #[test]
    fn test_resolution_differs_between_channels() {
        let fast = GeneratorChannel {
            index: 0,
            sampling_rate: 6.144e9,
            freq_bits: 32,
            phase_bits: 32,
            gain_bits: 16,
            time_bits: 24,
        };
        let slow = GeneratorChannel {
            sampling_rate: 4.096e9,
            ..fast
        };
        let a = fast.register_spec(RegisterRole::Frequency);
        let b = slow.register_spec(RegisterRole::Frequency);
        assert_ne!(a.resolution, b.resolution);
    }

    #[test]
    fn test_digitizer_has_no_gain_or_phase_register() {
        let ch = DigitizerChannel {
            index: 0,
            sampling_rate: 2.048e9,
            freq_bits: 32,
            time_bits: 24,
        };
        assert!(ch.register_spec(RegisterRole::Frequency).is_some());
        assert!(ch.register_spec(RegisterRole::Time).is_some());
        assert!(ch.register_spec(RegisterRole::Gain).is_none());
        assert!(ch.register_spec(RegisterRole::Phase).is_none());
    }
}
