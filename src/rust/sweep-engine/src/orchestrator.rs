// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The sweep orchestrator: drives the host-side sweep loop around the
//! blocking device acquisitions.
//!
//! Software sweeps form the outer Cartesian product, iterated row-major with
//! the first-declared sweep slowest; every point recompiles the protocol and
//! performs one acquisition covering all hardware sweeps at once. Progress
//! and cancellation are granular to the software loop only, the device call
//! itself is atomic from the host's point of view.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::assemble::{Assembler, MultiIndex};
use crate::device::AcquisitionDevice;
use crate::instruction::Protocol;
use crate::program::{SweepSession, generate_program};
use crate::settings::AcquisitionConfig;
use crate::sink::ResultSink;
use crate::sweep::{HardwareSweep, SoftwareSweep};
use crate::Result;

/// One declared sweep dimension, in declaration order.
#[derive(Debug, Clone)]
pub enum SweepSpec {
    Hardware(HardwareSweep),
    Software(SoftwareSweep),
}

/// Progress over the software sweep loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Cooperative cancellation handle, checked between software iterations.
///
/// Cancellation never interrupts a running acquisition; rows emitted before
/// the cancel point are kept and the run is finalized as partial.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    /// Rows emitted to the sink.
    pub rows: usize,
    /// Software iterations completed.
    pub completed: usize,
    /// Software iterations planned.
    pub total: usize,
    pub cancelled: bool,
}

/// Builder for one orchestrated sweep run over a protocol.
pub struct SweepRun<'a> {
    protocol: &'a mut Protocol,
    device: &'a mut dyn AcquisitionDevice,
    sink: &'a mut dyn ResultSink,
    config: AcquisitionConfig,
    sweeps: Vec<SweepSpec>,
    on_progress: Option<Box<dyn FnMut(Progress) + 'a>>,
    cancel: Option<CancelToken>,
}

impl<'a> SweepRun<'a> {
    pub fn new(
        protocol: &'a mut Protocol,
        device: &'a mut dyn AcquisitionDevice,
        sink: &'a mut dyn ResultSink,
        config: AcquisitionConfig,
    ) -> Self {
        SweepRun {
            protocol,
            device,
            sink,
            config,
            sweeps: Vec::new(),
            on_progress: None,
            cancel: None,
        }
    }

    /// Append one sweep dimension. Declaration order is coordinate order.
    pub fn sweep(mut self, spec: SweepSpec) -> Self {
        self.sweeps.push(spec);
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(Progress) + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run the full sweep. Device errors abort the run without finalizing
    /// the sink; cancellation finalizes the partial run.
    pub fn execute(mut self) -> Result<RunSummary> {
        let mut hardware = Vec::new();
        let mut software = Vec::new();
        for spec in self.sweeps {
            match spec {
                SweepSpec::Hardware(sweep) => hardware.push(sweep),
                SweepSpec::Software(sweep) => software.push(sweep),
            }
        }
        self.config.validate(!hardware.is_empty())?;

        let assembler = Assembler::register(
            &mut *self.sink,
            &self.config,
            &software.iter().collect::<Vec<_>>(),
            &hardware.iter().collect::<Vec<_>>(),
            &self.protocol.digitizer_channels(),
            self.protocol.readouts_per_shot(),
        )?;

        // Park each hardware-swept register on its first point so the host
        // copy stays coherent with what the device loop will execute.
        for sweep in &hardware {
            self.protocol
                .arena_mut()
                .get_mut(sweep.register())
                .set(sweep.first_value())?;
        }

        let extents: Vec<usize> = software.iter().map(SoftwareSweep::len).collect();
        let total: usize = extents.iter().product();
        let mut session = SweepSession::new();
        let mut completed = 0;
        let mut rows = 0;
        let mut cancelled = false;

        for index in MultiIndex::new(extents) {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                cancelled = true;
                break;
            }
            let mut coords = Vec::with_capacity(software.len());
            for (sweep, &i) in software.iter().zip(&index) {
                sweep.apply(self.protocol.arena_mut(), i)?;
                coords.push(sweep.values()[i]);
            }
            let mut program = generate_program(
                self.protocol,
                &hardware,
                &mut session,
                self.config.repetitions(),
            )?;
            let buffers = program.acquire(
                &mut *self.device,
                self.config.soft_avgs(),
                self.config.progress(),
            )?;
            rows += assembler.emit(&mut *self.sink, &coords, &buffers)?;
            session.release_all();
            completed += 1;
            debug!("software sweep point {completed}/{total} acquired");
            if let Some(callback) = self.on_progress.as_mut() {
                callback(Progress { completed, total });
            }
        }

        let run_id = self.sink.finalize()?;
        Ok(RunSummary {
            run_id,
            rows,
            completed,
            total,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use ndarray::{ArrayD, Dimension, IxDyn};
    use num_complex::Complex64;

    use super::*;
    use crate::channel::RegisterSpec;
    use crate::device::RawBuffers;
    use crate::instruction::{Envelope, Instruction, Pulse, Readout};
    use crate::parameter::{QuantizedParameter, RegisterId};
    use crate::program::CompiledProgram;
    use crate::settings::AcquisitionMode;
    use crate::sink::{AxisId, MemorySink, ResultId, RowKey, SinkValue};
    use crate::sweep::Trim;
    use crate::Error;
    use pulseq_units::Unit;

    /// Synthesizes windowed buffers whose I component equals the sum of the
    /// hardware loop values at each point, so reductions are predictable.
    struct StubDevice {
        runs: usize,
    }

    impl StubDevice {
        fn new() -> Self {
            StubDevice { runs: 0 }
        }
    }

    impl AcquisitionDevice for StubDevice {
        fn run(
            &mut self,
            program: &CompiledProgram,
            _progress: bool,
        ) -> anyhow::Result<RawBuffers> {
            self.runs += 1;
            let mut shape = vec![program.repetitions()];
            shape.extend(program.loop_extents());
            shape.push(program.readouts_per_shot());
            shape.push(2);
            let loops = program.loops();
            let mut buffer = ArrayD::zeros(IxDyn(&shape));
            for (index, value) in buffer.indexed_iter_mut() {
                let index = index.slice();
                if index[index.len() - 1] == 0 {
                    *value = loops
                        .iter()
                        .enumerate()
                        .map(|(axis, l)| l.value_at(index[1 + axis]))
                        .sum();
                }
            }
            let channels = program.digitizer_channels().len();
            Ok(RawBuffers::windowed(vec![buffer; channels]))
        }
    }

    fn gain_wait_protocol() -> (Protocol, RegisterId, RegisterId) {
        let mut builder = Protocol::builder();
        let gain = builder.add_register(QuantizedParameter::new(
            "gain",
            RegisterSpec::new(0.01, 0, 100, Unit::Dimensionless),
        ));
        let wait = builder.add_register(QuantizedParameter::new(
            "wait_after",
            RegisterSpec::new(1e-9, 0, 1 << 30, Unit::Seconds),
        ));
        let env = builder.add_envelope(Envelope {
            name: "flat".to_string(),
            samples: 16,
        });
        builder.push(Instruction::Pulse(Pulse {
            generator: 0,
            envelope: env,
            gain: gain.into(),
            frequency: 5.0e9.into(),
            phase: 0.0.into(),
            length: 16e-9.into(),
        }));
        builder.push(Instruction::Readout(Readout {
            digitizer: 0,
            frequency: 5.0e9.into(),
            length: 1e-6.into(),
            wait_after: wait.into(),
        }));
        (builder.build(), gain, wait)
    }

    #[test]
    fn test_software_outer_hardware_inner() {
        let (mut protocol, gain, wait) = gain_wait_protocol();
        let hw = HardwareSweep::new(protocol.arena(), gain, 0.0, 1.0, 11, Trim::NONE).unwrap();
        let sw = SoftwareSweep::from_values(
            protocol.arena(),
            vec![wait],
            vec![100e-9, 200e-9],
            Trim::NONE,
        )
        .unwrap();
        let mut device = StubDevice::new();
        let mut sink = MemorySink::new();
        let config = AcquisitionConfig::new(AcquisitionMode::Accumulated, 3);
        let summary = SweepRun::new(&mut protocol, &mut device, &mut sink, config)
            .sweep(SweepSpec::Software(sw))
            .sweep(SweepSpec::Hardware(hw))
            .execute()
            .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.rows, 22);
        assert!(!summary.cancelled);
        assert_eq!(device.runs, 2);
        assert_eq!(sink.rows().len(), 22);

        // Software coordinate varies slowest, hardware coordinate fastest.
        let wait_axis = RowKey::Axis(AxisId(0));
        let gain_axis = RowKey::Axis(AxisId(1));
        let avg = RowKey::Result(ResultId(0));
        for (row_index, row_wait, row_gain) in
            [(0, 100e-9, 0.0), (10, 100e-9, 1.0), (11, 200e-9, 0.0)]
        {
            assert_eq!(
                sink.cell(row_index, wait_axis),
                Some(&SinkValue::Float(row_wait))
            );
            let Some(SinkValue::Float(g)) = sink.cell(row_index, gain_axis) else {
                panic!("missing gain coordinate in row {row_index}");
            };
            assert!((g - row_gain).abs() < 1e-12);
            // The stub writes the gain value into the I component.
            let Some(SinkValue::Complex(v)) = sink.cell(row_index, avg) else {
                panic!("missing averaged value in row {row_index}");
            };
            assert!((v - Complex64::new(row_gain, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn test_progress_reported_per_software_point() {
        let (mut protocol, _, wait) = gain_wait_protocol();
        let sw = SoftwareSweep::linspace(
            protocol.arena(),
            vec![wait],
            0.0,
            300e-9,
            4,
            Trim::NONE,
        )
        .unwrap();
        let mut device = StubDevice::new();
        let mut sink = MemorySink::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_handle = Rc::clone(&seen);
        let config = AcquisitionConfig::new(AcquisitionMode::Accumulated, 1);
        let summary = SweepRun::new(&mut protocol, &mut device, &mut sink, config)
            .sweep(SweepSpec::Software(sw))
            .on_progress(move |p| sink_handle.borrow_mut().push(p))
            .execute()
            .unwrap();

        assert_eq!(summary.completed, 4);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 4);
        assert_eq!(
            *seen,
            (1..=4)
                .map(|completed| Progress {
                    completed,
                    total: 4
                })
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_cancellation_finalizes_partial_run() {
        let (mut protocol, _, wait) = gain_wait_protocol();
        let sw = SoftwareSweep::from_values(
            protocol.arena(),
            vec![wait],
            vec![1e-9, 2e-9, 3e-9],
            Trim::NONE,
        )
        .unwrap();
        let mut device = StubDevice::new();
        let mut sink = MemorySink::new();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let config = AcquisitionConfig::new(AcquisitionMode::Accumulated, 1);
        let summary = SweepRun::new(&mut protocol, &mut device, &mut sink, config)
            .sweep(SweepSpec::Software(sw))
            .with_cancel(cancel)
            .on_progress(move |p| {
                if p.completed == 2 {
                    trigger.cancel();
                }
            })
            .execute()
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.run_id, "memory-run-1");
        assert_eq!(sink.rows().len(), 2);
    }

    /// Delegates to [`StubDevice`] until `fail_after` runs have completed.
    struct FlakyDevice {
        inner: StubDevice,
        fail_after: usize,
    }

    impl AcquisitionDevice for FlakyDevice {
        fn run(
            &mut self,
            program: &CompiledProgram,
            progress: bool,
        ) -> anyhow::Result<RawBuffers> {
            if self.inner.runs >= self.fail_after {
                anyhow::bail!("link to device lost");
            }
            self.inner.run(program, progress)
        }
    }

    #[test]
    fn test_device_error_aborts_without_finalizing() {
        let (mut protocol, _, wait) = gain_wait_protocol();
        let sw = SoftwareSweep::from_values(
            protocol.arena(),
            vec![wait],
            vec![1e-9, 2e-9, 3e-9],
            Trim::NONE,
        )
        .unwrap();
        let mut device = FlakyDevice {
            inner: StubDevice::new(),
            fail_after: 1,
        };
        let mut sink = MemorySink::new();
        let config = AcquisitionConfig::new(AcquisitionMode::Accumulated, 1);
        let err = SweepRun::new(&mut protocol, &mut device, &mut sink, config)
            .sweep(SweepSpec::Software(sw))
            .execute()
            .unwrap_err();

        assert!(matches!(err, Error::Device(_)));
        // The first point's row survives the abort.
        assert_eq!(sink.rows().len(), 1);
        // The aborted run never finalized the sink, so the next finalize
        // still yields the first run id.
        assert_eq!(sink.finalize().unwrap(), "memory-run-1");
    }

    #[test]
    fn test_bulk_mode_rejects_hardware_sweeps() {
        let (mut protocol, gain, _) = gain_wait_protocol();
        let hw = HardwareSweep::new(protocol.arena(), gain, 0.0, 1.0, 11, Trim::NONE).unwrap();
        let mut device = StubDevice::new();
        let mut sink = MemorySink::new();
        let config = AcquisitionConfig::new(AcquisitionMode::Ddr4Bulk, 1);
        let err = SweepRun::new(&mut protocol, &mut device, &mut sink, config)
            .sweep(SweepSpec::Hardware(hw))
            .execute()
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        // Validation fails before any registration or device contact.
        assert_eq!(device.runs, 0);
        assert_eq!(sink.axes().count(), 0);
    }
}
