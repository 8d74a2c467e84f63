// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Program driver: compiles a protocol plus its active hardware sweeps into
//! one schedulable unit and performs the blocking acquisition call.

use std::collections::HashSet;

use log::debug;
use pulseq_units::Quantity;

use crate::device::{AcquisitionDevice, RawBuffers};
use crate::instruction::{ProgramLayout, Protocol, ProtocolState, Timeline};
use crate::parameter::RegisterId;
use crate::sweep::HardwareSweep;
use crate::{Error, Result};

/// Session state threaded through compilation and acquisition.
///
/// Tracks which registers currently carry a hardware sweep. The set is
/// appended to during compilation and released between acquisitions, never
/// during one.
#[derive(Debug, Default)]
pub struct SweepSession {
    swept: HashSet<RegisterId>,
}

impl SweepSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_swept(&self, register: RegisterId) -> bool {
        self.swept.contains(&register)
    }

    pub(crate) fn mark_swept(&mut self, register: RegisterId, name: &str) -> Result<()> {
        if !self.swept.insert(register) {
            return Err(Error::Precondition(format!(
                "parameter '{name}' already carries a hardware sweep"
            )));
        }
        Ok(())
    }

    pub(crate) fn release_all(&mut self) {
        self.swept.clear();
    }
}

/// One device loop of a compiled program, in nesting order.
#[derive(Debug, Clone)]
pub struct CompiledLoop {
    pub register: RegisterId,
    pub start_code: i64,
    pub step_code: i64,
    pub count: usize,
    /// Physical units per code of the looped register.
    pub quantum: f64,
    pub parameter: String,
}

impl CompiledLoop {
    /// Physical value at loop iteration `index`.
    pub fn value_at(&self, index: usize) -> f64 {
        (self.start_code + self.step_code * index as i64) as f64 * self.quantum
    }
}

/// A schedulable unit: the resolved shot timeline, channel/envelope layout
/// and the bound hardware loops.
#[derive(Debug)]
pub struct CompiledProgram {
    timeline: Timeline,
    layout: ProgramLayout,
    /// Loops in device nesting order, outermost first. Bindings were applied
    /// in reverse declared order, so this is the reverse of the declared
    /// sweep order; raw buffer axes follow it.
    loops: Vec<CompiledLoop>,
    repetitions: usize,
    readouts_per_shot: usize,
    digitizer_channels: Vec<usize>,
    state: ProtocolState,
}

impl CompiledProgram {
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn layout(&self) -> &ProgramLayout {
        &self.layout
    }

    /// Loops in device nesting order (outermost first).
    pub fn loops(&self) -> &[CompiledLoop] {
        &self.loops
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    pub fn readouts_per_shot(&self) -> usize {
        self.readouts_per_shot
    }

    pub fn digitizer_channels(&self) -> &[usize] {
        &self.digitizer_channels
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Hardware loop extents in buffer axis order.
    pub fn loop_extents(&self) -> Vec<usize> {
        self.loops.iter().map(|l| l.count).collect()
    }

    /// Perform one blocking acquisition, host-averaging `soft_avgs` full
    /// device invocations. Must not run concurrently against one handle.
    pub fn acquire(
        &mut self,
        device: &mut dyn AcquisitionDevice,
        soft_avgs: usize,
        progress: bool,
    ) -> Result<RawBuffers> {
        self.state = ProtocolState::Acquiring;
        let result = self.acquire_inner(device, soft_avgs, progress);
        self.state = match result {
            Ok(_) => ProtocolState::Done,
            Err(_) => ProtocolState::Failed,
        };
        result
    }

    fn acquire_inner(
        &self,
        device: &mut dyn AcquisitionDevice,
        soft_avgs: usize,
        progress: bool,
    ) -> Result<RawBuffers> {
        let mut accumulated = device.run(self, progress).map_err(Error::Device)?;
        self.check_buffers(&accumulated)?;
        for _ in 1..soft_avgs {
            let next = device.run(self, progress).map_err(Error::Device)?;
            self.check_buffers(&next)?;
            for (acc, buf) in accumulated.per_channel.iter_mut().zip(&next.per_channel) {
                if acc.shape() != buf.shape() {
                    return Err(Error::new(
                        "device returned differently shaped buffers across soft averages",
                    ));
                }
                *acc += buf;
            }
        }
        if soft_avgs > 1 {
            for acc in accumulated.per_channel.iter_mut() {
                *acc /= soft_avgs as f64;
            }
        }
        Ok(accumulated)
    }

    fn check_buffers(&self, buffers: &RawBuffers) -> Result<()> {
        if buffers.per_channel.len() != self.digitizer_channels.len() {
            return Err(Error::new(format!(
                "device returned {} channel buffers, expected {}",
                buffers.per_channel.len(),
                self.digitizer_channels.len()
            )));
        }
        Ok(())
    }
}

/// Compile `protocol` with the given hardware sweeps bound.
///
/// Every sweep must be claimed by an instruction field that supports
/// sweeping; bindings are applied in reverse declared order because the
/// device nests its loops in a last-bound-is-innermost discipline. The
/// resulting buffer axes therefore carry the hardware sweeps in reverse
/// declared order, which the result assembler undoes before emission.
pub fn generate_program(
    protocol: &Protocol,
    hardware_sweeps: &[HardwareSweep],
    session: &mut SweepSession,
    repetitions: usize,
) -> Result<CompiledProgram> {
    let mut layout = ProgramLayout::default();
    for instruction in protocol.instructions() {
        instruction.initialize(&mut layout);
    }
    let mut timeline = Timeline::default();
    for instruction in protocol.instructions() {
        instruction.append_to(&mut timeline, protocol.arena());
    }

    let mut loops = Vec::with_capacity(hardware_sweeps.len());
    for sweep in hardware_sweeps.iter().rev() {
        bind_sweep(protocol, sweep)?;
        session.mark_swept(sweep.register(), sweep.name())?;
        debug!(
            "bound hardware loop over '{}': {} points, step {}",
            sweep.name(),
            sweep.len(),
            Quantity::new(sweep.step(), sweep.unit())
        );
        loops.push(CompiledLoop {
            register: sweep.register(),
            start_code: sweep.start_code(),
            step_code: sweep.step_code(),
            count: sweep.len(),
            quantum: sweep.quantum(),
            parameter: sweep.name().to_string(),
        });
    }
    debug!(
        "compiled program: {} timeline entries, {} hardware loops, {} repetitions",
        timeline.entries.len(),
        loops.len(),
        repetitions
    );

    Ok(CompiledProgram {
        timeline,
        layout,
        loops,
        repetitions,
        readouts_per_shot: protocol.readouts_per_shot(),
        digitizer_channels: protocol.digitizer_channels(),
        state: ProtocolState::Compiled,
    })
}

/// Locate the instruction field claiming `sweep`'s register and check it is
/// sweepable.
fn bind_sweep(protocol: &Protocol, sweep: &HardwareSweep) -> Result<()> {
    let mut unsupported: Option<(&'static str, _)> = None;
    for instruction in protocol.instructions() {
        if let Some(field) = instruction.claims(sweep.register()) {
            if instruction.hardware_sweepable().contains(&field) {
                // Several instructions may share a swept register; the loop
                // updates the one register and all of them move together.
                return Ok(());
            }
            unsupported = Some((instruction.kind(), field));
        }
    }
    match unsupported {
        Some((instruction, field)) => Err(Error::UnsupportedSweep {
            instruction,
            field,
        }),
        None => Err(Error::UnboundSweep {
            parameter: sweep.name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::channel::RegisterSpec;
    use crate::instruction::{Envelope, Instruction, Pulse, Readout};
    use crate::parameter::QuantizedParameter;
    use crate::sweep::Trim;
    use pulseq_units::Unit;

    /// Returns a constant buffer equal to its invocation count, so host
    /// averages are easy to predict.
    struct CountingDevice {
        runs: usize,
    }

    impl AcquisitionDevice for CountingDevice {
        fn run(
            &mut self,
            program: &CompiledProgram,
            _progress: bool,
        ) -> anyhow::Result<RawBuffers> {
            self.runs += 1;
            let shape = [program.repetitions(), program.readouts_per_shot(), 2];
            let buffer = ArrayD::from_elem(IxDyn(&shape), self.runs as f64);
            Ok(RawBuffers::windowed(vec![buffer]))
        }
    }

    /// Grows the readout axis on every invocation.
    struct ShapeShiftingDevice {
        runs: usize,
    }

    impl AcquisitionDevice for ShapeShiftingDevice {
        fn run(
            &mut self,
            program: &CompiledProgram,
            _progress: bool,
        ) -> anyhow::Result<RawBuffers> {
            self.runs += 1;
            let shape = [program.repetitions(), self.runs, 2];
            Ok(RawBuffers::windowed(vec![ArrayD::zeros(IxDyn(&shape))]))
        }
    }

    fn test_protocol() -> (Protocol, RegisterId, RegisterId) {
        let mut builder = Protocol::builder();
        let gain = builder.add_register(QuantizedParameter::new(
            "gain",
            RegisterSpec::new(1.0 / 32767.0, -32768, 32767, Unit::Dimensionless),
        ));
        let length = builder.add_register(QuantizedParameter::new(
            "length",
            RegisterSpec::new(1e-9, 0, 1 << 24, Unit::Seconds),
        ));
        let env = builder.add_envelope(Envelope {
            name: "gauss".to_string(),
            samples: 256,
        });
        builder.push(Instruction::Pulse(Pulse {
            generator: 0,
            envelope: env,
            gain: gain.into(),
            frequency: 5.0e9.into(),
            phase: 0.0.into(),
            length: length.into(),
        }));
        builder.push(Instruction::Readout(Readout {
            digitizer: 0,
            frequency: 5.0e9.into(),
            length: 1e-6.into(),
            wait_after: 100e-9.into(),
        }));
        (builder.build(), gain, length)
    }

    #[test]
    fn test_loops_are_bound_in_reverse_declared_order() {
        let mut builder = Protocol::builder();
        let a = builder.add_register(QuantizedParameter::new(
            "a",
            RegisterSpec::new(1.0, 0, 100, Unit::Dimensionless),
        ));
        let b = builder.add_register(QuantizedParameter::new(
            "b",
            RegisterSpec::new(1.0, 0, 100, Unit::Dimensionless),
        ));
        let env = builder.add_envelope(Envelope {
            name: "flat".to_string(),
            samples: 16,
        });
        builder.push(Instruction::Pulse(Pulse {
            generator: 0,
            envelope: env,
            gain: a.into(),
            frequency: b.into(),
            phase: 0.0.into(),
            length: 16e-9.into(),
        }));
        let protocol = builder.build();
        let arena = protocol.arena();
        let sweeps = vec![
            HardwareSweep::new(arena, a, 0.0, 10.0, 11, Trim::NONE).unwrap(),
            HardwareSweep::new(arena, b, 0.0, 4.0, 5, Trim::NONE).unwrap(),
        ];
        let mut session = SweepSession::new();
        let program = generate_program(&protocol, &sweeps, &mut session, 10).unwrap();
        // Declared order (a, b); device nesting order is reversed.
        assert_eq!(program.loops()[0].parameter, "b");
        assert_eq!(program.loops()[1].parameter, "a");
        assert_eq!(program.loop_extents(), vec![5, 11]);
        assert!(session.is_swept(a));
        assert!(session.is_swept(b));
    }

    #[test]
    fn test_unbound_sweep_is_rejected() {
        let (protocol, _, _) = test_protocol();
        let mut arena = protocol.arena().clone();
        let orphan = arena.insert(QuantizedParameter::new(
            "orphan",
            RegisterSpec::new(1.0, 0, 10, Unit::Dimensionless),
        ));
        let sweep = HardwareSweep::new(&arena, orphan, 0.0, 5.0, 6, Trim::NONE).unwrap();
        let mut session = SweepSession::new();
        let err = generate_program(&protocol, &[sweep], &mut session, 1).unwrap_err();
        assert!(matches!(err, Error::UnboundSweep { parameter } if parameter == "orphan"));
    }

    #[test]
    fn test_unsupported_field_is_rejected() {
        let (protocol, _, length) = test_protocol();
        let sweep =
            HardwareSweep::new(protocol.arena(), length, 0.0, 1e-6, 11, Trim::NONE).unwrap();
        let mut session = SweepSession::new();
        let err = generate_program(&protocol, &[sweep], &mut session, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedSweep {
                instruction: "pulse",
                ..
            }
        ));
    }

    #[test]
    fn test_double_sweep_of_one_register_is_rejected() {
        let (protocol, gain, _) = test_protocol();
        let arena = protocol.arena();
        let s1 = HardwareSweep::new(arena, gain, 0.0, 1.0, 11, Trim::NONE).unwrap();
        let s2 = HardwareSweep::new(arena, gain, 0.0, 0.5, 6, Trim::NONE).unwrap();
        let mut session = SweepSession::new();
        assert!(matches!(
            generate_program(&protocol, &[s1, s2], &mut session, 1),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_acquire_host_averages_soft_runs() {
        let (protocol, _, _) = test_protocol();
        let mut session = SweepSession::new();
        let mut program = generate_program(&protocol, &[], &mut session, 2).unwrap();
        let mut device = CountingDevice { runs: 0 };
        let buffers = program.acquire(&mut device, 4, false).unwrap();
        assert_eq!(device.runs, 4);
        // The four runs return 1, 2, 3 and 4 everywhere.
        assert!(
            buffers.per_channel[0]
                .iter()
                .all(|v| (*v - 2.5).abs() < 1e-12)
        );
        assert_eq!(program.state(), ProtocolState::Done);
    }

    #[test]
    fn test_acquire_rejects_shape_change_across_soft_runs() {
        let (protocol, _, _) = test_protocol();
        let mut session = SweepSession::new();
        let mut program = generate_program(&protocol, &[], &mut session, 2).unwrap();
        let mut device = ShapeShiftingDevice { runs: 0 };
        let err = program.acquire(&mut device, 2, false).unwrap_err();
        assert!(matches!(err, Error::Anyhow(_)));
        assert_eq!(program.state(), ProtocolState::Failed);
    }

    #[test]
    fn test_value_at_follows_integer_steps() {
        let (protocol, gain, _) = test_protocol();
        let sweep =
            HardwareSweep::new(protocol.arena(), gain, 0.0, 1.0, 11, Trim::NONE).unwrap();
        let mut session = SweepSession::new();
        let program = generate_program(&protocol, &[sweep.clone()], &mut session, 1).unwrap();
        let values = sweep.values();
        for (i, expected) in values.iter().enumerate() {
            assert!((program.loops()[0].value_at(i) - expected).abs() < 1e-12);
        }
    }
}
