// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The instruction set of one shot timeline and the protocol owning it.
//!
//! Instructions form a closed set of variants. Each variant declares an
//! explicit table of fields a hardware sweep may drive, so an unsupported
//! binding is rejected when the program is compiled, never mid-acquisition.

use std::fmt;
use std::fmt::{Display, Formatter};

use indexmap::IndexSet;

use crate::parameter::{ParameterArena, QuantizedParameter, RegisterId};

/// Handle of a shared pulse envelope. Several instructions referencing the
/// same envelope declare it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvelopeId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub name: String,
    /// Envelope length in generator samples.
    pub samples: usize,
}

/// An instruction field: either a fixed value or a reference into the
/// register arena.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Const(f64),
    Param(RegisterId),
}

impl FieldValue {
    pub fn register(&self) -> Option<RegisterId> {
        match self {
            FieldValue::Const(_) => None,
            FieldValue::Param(id) => Some(*id),
        }
    }

    fn resolve(&self, arena: &ParameterArena) -> ResolvedField {
        match self {
            FieldValue::Const(v) => ResolvedField {
                value: *v,
                register: None,
            },
            FieldValue::Param(id) => ResolvedField {
                value: arena.get(*id).value(),
                register: Some(*id),
            },
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Const(value)
    }
}

impl From<RegisterId> for FieldValue {
    fn from(id: RegisterId) -> Self {
        FieldValue::Param(id)
    }
}

/// A field value snapshot taken at compile time. The register provenance is
/// kept so the device can substitute loop codes for swept fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedField {
    pub value: f64,
    pub register: Option<RegisterId>,
}

/// Name of a sweepable instruction field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepField {
    Gain,
    Frequency,
    Phase,
    Length,
    Time,
    WaitAfter,
}

impl Display for SweepField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepField::Gain => "gain",
            SweepField::Frequency => "frequency",
            SweepField::Phase => "phase",
            SweepField::Length => "length",
            SweepField::Time => "time",
            SweepField::WaitAfter => "wait_after",
        };
        write!(f, "{name}")
    }
}

/// Play one envelope on a generator channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Pulse {
    pub generator: usize,
    pub envelope: EnvelopeId,
    pub gain: FieldValue,
    pub frequency: FieldValue,
    pub phase: FieldValue,
    pub length: FieldValue,
}

/// Idle the timeline for a fixed or swept time.
#[derive(Debug, Clone, PartialEq)]
pub struct Delay {
    pub time: FieldValue,
}

/// Fire the digitizer capture trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub digitizers: Vec<usize>,
    pub width: FieldValue,
}

/// Open one readout window on a digitizer channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Readout {
    pub digitizer: usize,
    pub frequency: FieldValue,
    pub length: FieldValue,
    pub wait_after: FieldValue,
}

/// Set the absolute carrier phase of a generator channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPhase {
    pub generator: usize,
    pub phase: FieldValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Pulse(Pulse),
    Delay(Delay),
    Trigger(Trigger),
    Readout(Readout),
    SetPhase(SetPhase),
}

impl Instruction {
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Pulse(_) => "pulse",
            Instruction::Delay(_) => "delay",
            Instruction::Trigger(_) => "trigger",
            Instruction::Readout(_) => "readout",
            Instruction::SetPhase(_) => "set_phase",
        }
    }

    /// The fields of this variant a hardware sweep may drive.
    pub fn hardware_sweepable(&self) -> &'static [SweepField] {
        match self {
            Instruction::Pulse(_) => {
                &[SweepField::Gain, SweepField::Frequency, SweepField::Phase]
            }
            Instruction::Delay(_) => &[SweepField::Time],
            Instruction::Trigger(_) => &[],
            Instruction::Readout(_) => &[SweepField::Frequency],
            Instruction::SetPhase(_) => &[SweepField::Phase],
        }
    }

    /// All register-backed fields of this instruction.
    pub fn fields(&self) -> Vec<(SweepField, FieldValue)> {
        match self {
            Instruction::Pulse(p) => vec![
                (SweepField::Gain, p.gain),
                (SweepField::Frequency, p.frequency),
                (SweepField::Phase, p.phase),
                (SweepField::Length, p.length),
            ],
            Instruction::Delay(d) => vec![(SweepField::Time, d.time)],
            Instruction::Trigger(t) => vec![(SweepField::Length, t.width)],
            Instruction::Readout(r) => vec![
                (SweepField::Frequency, r.frequency),
                (SweepField::Length, r.length),
                (SweepField::WaitAfter, r.wait_after),
            ],
            Instruction::SetPhase(s) => vec![(SweepField::Phase, s.phase)],
        }
    }

    /// The field through which this instruction references `register`, if
    /// any.
    pub(crate) fn claims(&self, register: RegisterId) -> Option<SweepField> {
        self.fields()
            .into_iter()
            .find(|(_, value)| value.register() == Some(register))
            .map(|(field, _)| field)
    }

    /// Declare channel and envelope usage. Idempotent: repeated calls leave
    /// the layout unchanged.
    pub fn initialize(&self, layout: &mut ProgramLayout) {
        match self {
            Instruction::Pulse(p) => {
                layout.generators.insert(p.generator);
                layout.envelopes.insert(p.envelope);
            }
            Instruction::Delay(_) => {}
            Instruction::Trigger(t) => {
                layout.digitizers.extend(t.digitizers.iter().copied());
            }
            Instruction::Readout(r) => {
                layout.digitizers.insert(r.digitizer);
            }
            Instruction::SetPhase(s) => {
                layout.generators.insert(s.generator);
            }
        }
    }

    /// Emit this instruction's timed effect, with field values snapshotted
    /// from the arena.
    pub fn append_to(&self, timeline: &mut Timeline, arena: &ParameterArena) {
        let entry = match self {
            Instruction::Pulse(p) => TimelineEntry::Play {
                generator: p.generator,
                envelope: p.envelope,
                gain: p.gain.resolve(arena),
                frequency: p.frequency.resolve(arena),
                phase: p.phase.resolve(arena),
                length: p.length.resolve(arena),
            },
            Instruction::Delay(d) => TimelineEntry::Wait {
                time: d.time.resolve(arena),
            },
            Instruction::Trigger(t) => TimelineEntry::Capture {
                digitizers: t.digitizers.clone(),
                width: t.width.resolve(arena),
            },
            Instruction::Readout(r) => TimelineEntry::Acquire {
                digitizer: r.digitizer,
                frequency: r.frequency.resolve(arena),
                length: r.length.resolve(arena),
                wait_after: r.wait_after.resolve(arena),
            },
            Instruction::SetPhase(s) => TimelineEntry::PhaseUpdate {
                generator: s.generator,
                phase: s.phase.resolve(arena),
            },
        };
        timeline.entries.push(entry);
    }
}

/// Channel and envelope declarations of one compiled program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramLayout {
    pub generators: IndexSet<usize>,
    pub digitizers: IndexSet<usize>,
    pub envelopes: IndexSet<EnvelopeId>,
}

/// One shot timeline in declared order, with resolved field values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Play {
        generator: usize,
        envelope: EnvelopeId,
        gain: ResolvedField,
        frequency: ResolvedField,
        phase: ResolvedField,
        length: ResolvedField,
    },
    Wait {
        time: ResolvedField,
    },
    Capture {
        digitizers: Vec<usize>,
        width: ResolvedField,
    },
    Acquire {
        digitizer: usize,
        frequency: ResolvedField,
        length: ResolvedField,
        wait_after: ResolvedField,
    },
    PhaseUpdate {
        generator: usize,
        phase: ResolvedField,
    },
}

/// Lifecycle of a protocol across one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Declared,
    Compiled,
    Acquiring,
    Done,
    Failed,
}

/// An ordered instruction sequence plus the register arena and envelope
/// table the instructions reference.
#[derive(Debug, Clone)]
pub struct Protocol {
    instructions: Vec<Instruction>,
    arena: ParameterArena,
    envelopes: Vec<Envelope>,
}

impl Protocol {
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder::default()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn arena(&self) -> &ParameterArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ParameterArena {
        &mut self.arena
    }

    pub fn envelope(&self, id: EnvelopeId) -> &Envelope {
        &self.envelopes[id.0]
    }

    /// Number of readout windows in one shot.
    pub fn readouts_per_shot(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Readout(_)))
            .count()
    }

    /// Digitizer channels in order of first use. Raw buffers returned by the
    /// device align with this list.
    pub fn digitizer_channels(&self) -> Vec<usize> {
        let mut channels = IndexSet::new();
        for instruction in &self.instructions {
            if let Instruction::Readout(r) = instruction {
                channels.insert(r.digitizer);
            }
        }
        channels.into_iter().collect()
    }
}

#[derive(Debug, Default)]
pub struct ProtocolBuilder {
    instructions: Vec<Instruction>,
    arena: ParameterArena,
    envelopes: Vec<Envelope>,
}

impl ProtocolBuilder {
    pub fn add_register(&mut self, parameter: QuantizedParameter) -> RegisterId {
        self.arena.insert(parameter)
    }

    pub fn add_envelope(&mut self, envelope: Envelope) -> EnvelopeId {
        self.envelopes.push(envelope);
        EnvelopeId(self.envelopes.len() - 1)
    }

    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    pub fn arena(&self) -> &ParameterArena {
        &self.arena
    }

    pub fn build(self) -> Protocol {
        Protocol {
            instructions: self.instructions,
            arena: self.arena,
            envelopes: self.envelopes,
        }
    }
}
