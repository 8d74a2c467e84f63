// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The result-sink contract and an in-memory reference implementation.

use indexmap::IndexMap;
use num_complex::Complex64;
use pulseq_units::Unit;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultId(pub usize);

/// Whether a registered axis or result channel holds one number per row or
/// an array per row (e.g. a waveform over its time axis).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Numeric,
    Array,
}

/// A single cell of an emitted row.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Float(f64),
    Complex(Complex64),
    FloatArray(Vec<f64>),
    ComplexArray(Vec<Complex64>),
    Counts(Vec<u64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKey {
    Axis(AxisId),
    Result(ResultId),
}

/// External measurement-database writer.
///
/// Axes and result channels are registered up front, before the first
/// acquisition; rows are appended as coordinates complete. Rows already
/// appended survive a mid-run failure, there is no rollback.
pub trait ResultSink {
    fn register_axis(&mut self, name: &str, unit: Unit, kind: SinkKind) -> AxisId;

    fn register_result_channel(
        &mut self,
        name: &str,
        depends_on: &[AxisId],
        kind: SinkKind,
    ) -> ResultId;

    fn append_row(&mut self, row: &[(RowKey, SinkValue)]) -> Result<()>;

    /// Close the run and return its identifier.
    fn finalize(&mut self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct AxisInfo {
    pub name: String,
    pub unit: Unit,
    pub kind: SinkKind,
}

#[derive(Debug, Clone)]
pub struct ResultChannelInfo {
    pub name: String,
    pub depends_on: Vec<AxisId>,
    pub kind: SinkKind,
}

/// Sink retaining everything in memory, for tests and interactive use.
#[derive(Debug, Default)]
pub struct MemorySink {
    axes: IndexMap<String, AxisInfo>,
    channels: IndexMap<String, ResultChannelInfo>,
    rows: Vec<Vec<(RowKey, SinkValue)>>,
    runs: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axes(&self) -> impl Iterator<Item = &AxisInfo> {
        self.axes.values()
    }

    pub fn channels(&self) -> impl Iterator<Item = &ResultChannelInfo> {
        self.channels.values()
    }

    pub fn rows(&self) -> &[Vec<(RowKey, SinkValue)>] {
        &self.rows
    }

    /// Value of `key` in row `row`, if present.
    pub fn cell(&self, row: usize, key: RowKey) -> Option<&SinkValue> {
        self.rows[row]
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

impl ResultSink for MemorySink {
    fn register_axis(&mut self, name: &str, unit: Unit, kind: SinkKind) -> AxisId {
        let id = AxisId(self.axes.len());
        self.axes.insert(
            name.to_string(),
            AxisInfo {
                name: name.to_string(),
                unit,
                kind,
            },
        );
        id
    }

    fn register_result_channel(
        &mut self,
        name: &str,
        depends_on: &[AxisId],
        kind: SinkKind,
    ) -> ResultId {
        let id = ResultId(self.channels.len());
        self.channels.insert(
            name.to_string(),
            ResultChannelInfo {
                name: name.to_string(),
                depends_on: depends_on.to_vec(),
                kind,
            },
        );
        id
    }

    fn append_row(&mut self, row: &[(RowKey, SinkValue)]) -> Result<()> {
        self.rows.push(row.to_vec());
        Ok(())
    }

    fn finalize(&mut self) -> Result<String> {
        self.runs += 1;
        Ok(format!("memory-run-{}", self.runs))
    }
}
