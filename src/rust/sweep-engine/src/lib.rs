// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Sweep composition and acquisition orchestration for pulse-sequencing
//! acquisition devices.
//!
//! The engine quantizes physical parameters onto device registers, composes
//! hardware-looped and host-looped sweeps over them, compiles instruction
//! protocols into schedulable programs and reduces the raw buffers of each
//! acquisition into coordinate-labeled result rows.

pub mod assemble;
pub mod channel;
pub mod device;
mod error;
pub mod instruction;
pub mod orchestrator;
pub mod parameter;
pub mod program;
pub mod settings;
pub mod sink;
pub mod sweep;

pub use error::{Error, Result};

pub use channel::{DigitizerChannel, GeneratorChannel, RegisterRole, RegisterSpec};
pub use device::{AcquisitionDevice, RawBuffers};
pub use instruction::{Instruction, Protocol, ProtocolBuilder};
pub use orchestrator::{CancelToken, Progress, RunSummary, SweepRun, SweepSpec};
pub use parameter::{ParameterArena, QuantizedParameter, RegisterId};
pub use program::{generate_program, CompiledProgram, SweepSession};
pub use settings::{AcquisitionConfig, AcquisitionMode, StateClassifier};
pub use sink::{MemorySink, ResultSink};
pub use sweep::{HardwareSweep, SoftwareSweep, Trim};
