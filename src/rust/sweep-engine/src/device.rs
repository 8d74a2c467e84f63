// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The acquisition-device contract.
//!
//! The engine treats the device as a black box that executes one compiled
//! program and hands back raw sample buffers. Transport and bytecode
//! encoding live behind this trait.

use ndarray::ArrayD;

use crate::program::CompiledProgram;

/// Raw sample buffers of one device invocation.
///
/// One array per digitizer channel, ordered like
/// [`CompiledProgram::digitizer_channels`]. For windowed captures the shape
/// is `[repetitions, hw_loop…, readouts_per_shot, 2]` with hardware loop
/// axes in device nesting order, outermost first (the loop bound last runs
/// innermost). For waveform captures the readout axis is replaced by a
/// per-sample time axis and `sample_period` is set.
#[derive(Debug, Clone)]
pub struct RawBuffers {
    pub per_channel: Vec<ArrayD<f64>>,
    /// Seconds per decimated sample, present for waveform and bulk captures.
    pub sample_period: Option<f64>,
}

impl RawBuffers {
    pub fn windowed(per_channel: Vec<ArrayD<f64>>) -> Self {
        RawBuffers {
            per_channel,
            sample_period: None,
        }
    }

    pub fn waveform(per_channel: Vec<ArrayD<f64>>, sample_period: f64) -> Self {
        RawBuffers {
            per_channel,
            sample_period: Some(sample_period),
        }
    }
}

/// One blocking acquisition on an exclusive device handle.
///
/// Implementations must not be invoked concurrently against the same handle;
/// the orchestrator serializes all calls. Errors are surfaced unmodified and
/// are not retried by this layer.
pub trait AcquisitionDevice {
    /// Execute `program` once, `program.repetitions()` shots per hardware
    /// loop point, and return the raw buffers. `progress` requests the
    /// device's own coarse progress reporting, if it has any; the inner
    /// hardware loops are otherwise not observable from the host.
    fn run(&mut self, program: &CompiledProgram, progress: bool) -> anyhow::Result<RawBuffers>;
}
