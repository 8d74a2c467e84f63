// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Result assembly: reduces raw device buffers into coordinate-labeled rows.
//!
//! Raw buffers carry the hardware loop axes in device nesting order, which
//! is the reverse of the declared sweep order (see the program driver). The
//! assembler iterates coordinates in declared order and translates indices,
//! so emitted rows always enumerate software axes outermost and hardware
//! axes in forward declared order.

use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;

use crate::device::RawBuffers;
use crate::settings::{AcquisitionConfig, AcquisitionMode, StateClassifier};
use crate::sink::{AxisId, ResultId, ResultSink, RowKey, SinkKind, SinkValue};
use crate::sweep::{HardwareSweep, SoftwareSweep};
use crate::{Error, Result};

/// Fractional-improvement stopping tolerance of the geometric-median
/// iteration.
const MEDIAN_TOLERANCE: f64 = 1e-9;
const MEDIAN_MAX_ITERATIONS: usize = 200;

struct Output {
    primary: ResultId,
    secondary: Option<ResultId>,
}

/// Reduces each acquisition's buffers and emits rows to the sink.
///
/// Axis and result-channel registration happens once, at construction,
/// before any device call.
pub struct Assembler {
    mode: AcquisitionMode,
    repetitions: usize,
    readouts_per_shot: usize,
    classifier: Option<Arc<dyn StateClassifier>>,
    software_axes: Vec<AxisId>,
    hardware_axes: Vec<AxisId>,
    /// Physical values per hardware axis, declared order.
    hardware_values: Vec<Vec<f64>>,
    shot_axis: Option<AxisId>,
    time_axis: Option<AxisId>,
    state_axis: Option<AxisId>,
    /// Result ids per digitizer channel; inner vector per readout window
    /// for windowed per-readout modes, length one otherwise.
    outputs: Vec<Vec<Output>>,
}

impl Assembler {
    pub fn register(
        sink: &mut dyn ResultSink,
        config: &AcquisitionConfig,
        software: &[&SoftwareSweep],
        hardware: &[&HardwareSweep],
        digitizer_channels: &[usize],
        readouts_per_shot: usize,
    ) -> Result<Self> {
        let mode = config.mode();
        if matches!(mode, AcquisitionMode::Decimated) && readouts_per_shot != 1 {
            return Err(Error::Precondition(format!(
                "decimated capture supports exactly one readout window per shot, protocol has {readouts_per_shot}"
            )));
        }
        if digitizer_channels.is_empty() {
            return Err(Error::Precondition(
                "protocol declares no readout, nothing to acquire".to_string(),
            ));
        }

        let software_axes = software
            .iter()
            .map(|s| sink.register_axis(s.name(), s.unit(), SinkKind::Numeric))
            .collect::<Vec<_>>();
        let hardware_axes = hardware
            .iter()
            .map(|s| sink.register_axis(s.name(), s.unit(), SinkKind::Numeric))
            .collect::<Vec<_>>();
        let hardware_values = hardware.iter().map(|s| s.values()).collect::<Vec<_>>();

        let shot_axis = matches!(mode, AcquisitionMode::RawShots).then(|| {
            sink.register_axis("shot", pulseq_units::Unit::Dimensionless, SinkKind::Array)
        });
        let time_axis = matches!(
            mode,
            AcquisitionMode::Decimated | AcquisitionMode::Ddr4Bulk
        )
        .then(|| sink.register_axis("time", pulseq_units::Unit::Seconds, SinkKind::Array));
        let state_axis = matches!(mode, AcquisitionMode::PopulationCounted).then(|| {
            sink.register_axis("state", pulseq_units::Unit::Dimensionless, SinkKind::Array)
        });

        let mut base_deps: Vec<AxisId> = software_axes.clone();
        base_deps.extend(&hardware_axes);

        let mut outputs = Vec::with_capacity(digitizer_channels.len());
        for &channel in digitizer_channels {
            let per_readout = |readout: usize| {
                if readouts_per_shot > 1 {
                    format!("ch{channel}_ro{readout}")
                } else {
                    format!("ch{channel}")
                }
            };
            let channel_outputs = match mode {
                AcquisitionMode::Accumulated => (0..readouts_per_shot)
                    .map(|r| Output {
                        primary: sink.register_result_channel(
                            &format!("avg_{}", per_readout(r)),
                            &base_deps,
                            SinkKind::Numeric,
                        ),
                        secondary: None,
                    })
                    .collect(),
                AcquisitionMode::AccumulatedRobust => (0..readouts_per_shot)
                    .map(|r| Output {
                        primary: sink.register_result_channel(
                            &format!("med_{}", per_readout(r)),
                            &base_deps,
                            SinkKind::Numeric,
                        ),
                        secondary: Some(sink.register_result_channel(
                            &format!("mad_{}", per_readout(r)),
                            &base_deps,
                            SinkKind::Numeric,
                        )),
                    })
                    .collect(),
                AcquisitionMode::RawShots => {
                    let mut deps = base_deps.clone();
                    deps.extend(shot_axis);
                    (0..readouts_per_shot)
                        .map(|r| Output {
                            primary: sink.register_result_channel(
                                &format!("shots_{}", per_readout(r)),
                                &deps,
                                SinkKind::Array,
                            ),
                            secondary: None,
                        })
                        .collect()
                }
                AcquisitionMode::Decimated | AcquisitionMode::Ddr4Bulk => {
                    let mut deps = base_deps.clone();
                    deps.extend(time_axis);
                    let prefix = if matches!(mode, AcquisitionMode::Decimated) {
                        "wave"
                    } else {
                        "bulk"
                    };
                    vec![Output {
                        primary: sink.register_result_channel(
                            &format!("{prefix}_ch{channel}"),
                            &deps,
                            SinkKind::Array,
                        ),
                        secondary: None,
                    }]
                }
                AcquisitionMode::PopulationCounted => {
                    let mut deps = base_deps.clone();
                    deps.extend(state_axis);
                    vec![Output {
                        primary: sink.register_result_channel(
                            &format!("pop_ch{channel}"),
                            &deps,
                            SinkKind::Array,
                        ),
                        secondary: None,
                    }]
                }
            };
            outputs.push(channel_outputs);
        }

        Ok(Assembler {
            mode,
            repetitions: config.repetitions(),
            readouts_per_shot,
            classifier: config.classifier().cloned(),
            software_axes,
            hardware_axes,
            hardware_values,
            shot_axis,
            time_axis,
            state_axis,
            outputs,
        })
    }

    /// Reduce one acquisition and append its rows, tagged with the current
    /// software coordinate. Returns the number of rows appended.
    pub fn emit(
        &self,
        sink: &mut dyn ResultSink,
        software_coords: &[f64],
        buffers: &RawBuffers,
    ) -> Result<usize> {
        match self.mode {
            AcquisitionMode::Ddr4Bulk => self.emit_bulk(sink, software_coords, buffers),
            AcquisitionMode::Decimated => self.emit_decimated(sink, software_coords, buffers),
            _ => self.emit_windowed(sink, software_coords, buffers),
        }
    }

    fn hardware_extents(&self) -> Vec<usize> {
        self.hardware_values.iter().map(Vec::len).collect()
    }

    /// Translate a declared-order hardware multi-index into the device-order
    /// buffer index (hardware axes arrive reversed).
    fn device_index(declared: &[usize]) -> Vec<usize> {
        declared.iter().rev().copied().collect()
    }

    fn check_windowed_shape(&self, buffer: &ArrayD<f64>) -> Result<()> {
        let mut expected = vec![self.repetitions];
        let mut extents = self.hardware_extents();
        extents.reverse();
        expected.extend(extents);
        expected.push(self.readouts_per_shot);
        expected.push(2);
        if buffer.shape() != expected.as_slice() {
            return Err(Error::new(format!(
                "device buffer shape {:?} does not match expected {:?}",
                buffer.shape(),
                expected
            )));
        }
        Ok(())
    }

    /// Like [`Self::check_windowed_shape`] but with a free sample axis in
    /// place of the readout axis; the sample count is the device's to pick.
    fn check_decimated_shape(&self, buffer: &ArrayD<f64>) -> Result<()> {
        let mut expected = vec![self.repetitions];
        let mut extents = self.hardware_extents();
        extents.reverse();
        expected.extend(extents);
        let shape = buffer.shape();
        let matches = shape.len() == expected.len() + 2
            && shape[..expected.len()] == expected[..]
            && shape[shape.len() - 1] == 2;
        if !matches {
            return Err(Error::new(format!(
                "decimated buffer shape {shape:?} does not match expected {expected:?} + [samples, 2]"
            )));
        }
        Ok(())
    }

    /// Complex shot values for one hardware point and readout window.
    fn shots_at(
        &self,
        buffer: &ArrayD<f64>,
        declared_index: &[usize],
        readout: usize,
    ) -> Vec<Complex64> {
        let device = Self::device_index(declared_index);
        let mut index = Vec::with_capacity(device.len() + 3);
        (0..self.repetitions)
            .map(|rep| {
                index.clear();
                index.push(rep);
                index.extend(&device);
                index.push(readout);
                index.push(0);
                let i = buffer[IxDyn(&index)];
                let component = index.len() - 1;
                index[component] = 1;
                let q = buffer[IxDyn(&index)];
                Complex64::new(i, q)
            })
            .collect()
    }

    fn coordinate_cells(
        &self,
        software_coords: &[f64],
        declared_index: &[usize],
    ) -> Vec<(RowKey, SinkValue)> {
        let mut row = Vec::new();
        for (axis, value) in self.software_axes.iter().zip(software_coords) {
            row.push((RowKey::Axis(*axis), SinkValue::Float(*value)));
        }
        for (k, axis) in self.hardware_axes.iter().enumerate() {
            row.push((
                RowKey::Axis(*axis),
                SinkValue::Float(self.hardware_values[k][declared_index[k]]),
            ));
        }
        row
    }

    fn emit_windowed(
        &self,
        sink: &mut dyn ResultSink,
        software_coords: &[f64],
        buffers: &RawBuffers,
    ) -> Result<usize> {
        for buffer in &buffers.per_channel {
            self.check_windowed_shape(buffer)?;
        }
        let mut rows = 0;
        for declared_index in MultiIndex::new(self.hardware_extents()) {
            let mut row = self.coordinate_cells(software_coords, &declared_index);
            if let Some(shot_axis) = self.shot_axis {
                let shots: Vec<f64> = (0..self.repetitions).map(|s| s as f64).collect();
                row.push((RowKey::Axis(shot_axis), SinkValue::FloatArray(shots)));
            }
            if let (Some(state_axis), Some(classifier)) = (self.state_axis, &self.classifier) {
                let joint_states =
                    classifier.num_states().pow(self.readouts_per_shot as u32);
                let states: Vec<f64> = (0..joint_states).map(|s| s as f64).collect();
                row.push((RowKey::Axis(state_axis), SinkValue::FloatArray(states)));
            }
            for (channel, buffer) in self.outputs.iter().zip(&buffers.per_channel) {
                match self.mode {
                    AcquisitionMode::Accumulated => {
                        for (readout, output) in channel.iter().enumerate() {
                            let shots = self.shots_at(buffer, &declared_index, readout);
                            row.push((
                                RowKey::Result(output.primary),
                                SinkValue::Complex(mean(&shots)),
                            ));
                        }
                    }
                    AcquisitionMode::AccumulatedRobust => {
                        for (readout, output) in channel.iter().enumerate() {
                            let shots = self.shots_at(buffer, &declared_index, readout);
                            let center = geometric_median(&shots);
                            let spread = median_absolute_deviation(&shots, center);
                            row.push((
                                RowKey::Result(output.primary),
                                SinkValue::Complex(center),
                            ));
                            if let Some(mad) = output.secondary {
                                row.push((RowKey::Result(mad), SinkValue::Float(spread)));
                            }
                        }
                    }
                    AcquisitionMode::RawShots => {
                        for (readout, output) in channel.iter().enumerate() {
                            let shots = self.shots_at(buffer, &declared_index, readout);
                            row.push((
                                RowKey::Result(output.primary),
                                SinkValue::ComplexArray(shots),
                            ));
                        }
                    }
                    AcquisitionMode::PopulationCounted => {
                        let Some(classifier) = self.classifier.as_ref() else {
                            return Err(Error::Precondition(
                                "population counting needs a state classifier".to_string(),
                            ));
                        };
                        let counts = self.count_populations(
                            buffer,
                            &declared_index,
                            classifier.as_ref(),
                        );
                        row.push((
                            RowKey::Result(channel[0].primary),
                            SinkValue::Counts(counts),
                        ));
                    }
                    AcquisitionMode::Decimated | AcquisitionMode::Ddr4Bulk => {
                        unreachable!("handled by dedicated emitters")
                    }
                }
            }
            sink.append_row(&row)?;
            rows += 1;
        }
        Ok(rows)
    }

    /// Joint state histogram across the readouts of each shot. The first
    /// readout is the most significant digit of the joint index.
    fn count_populations(
        &self,
        buffer: &ArrayD<f64>,
        declared_index: &[usize],
        classifier: &dyn StateClassifier,
    ) -> Vec<u64> {
        let num_states = classifier.num_states();
        let mut counts = vec![0u64; num_states.pow(self.readouts_per_shot as u32)];
        let per_readout: Vec<Vec<Complex64>> = (0..self.readouts_per_shot)
            .map(|r| self.shots_at(buffer, declared_index, r))
            .collect();
        for rep in 0..self.repetitions {
            let mut joint = 0usize;
            for shots in &per_readout {
                let state = classifier.classify(shots[rep]).min(num_states - 1);
                joint = joint * num_states + state;
            }
            counts[joint] += 1;
        }
        counts
    }

    fn emit_decimated(
        &self,
        sink: &mut dyn ResultSink,
        software_coords: &[f64],
        buffers: &RawBuffers,
    ) -> Result<usize> {
        let sample_period = buffers.sample_period.ok_or_else(|| {
            Error::new("decimated capture requires the device to report its sample period")
        })?;
        for buffer in &buffers.per_channel {
            self.check_decimated_shape(buffer)?;
        }
        let hw_dims = self.hardware_axes.len();
        let mut rows = 0;
        for declared_index in MultiIndex::new(self.hardware_extents()) {
            let mut row = self.coordinate_cells(software_coords, &declared_index);
            let mut time_pushed = false;
            for (channel, buffer) in self.outputs.iter().zip(&buffers.per_channel) {
                let samples = buffer.shape()[buffer.ndim() - 2];
                if !time_pushed {
                    if let Some(time_axis) = self.time_axis {
                        let times: Vec<f64> =
                            (0..samples).map(|s| s as f64 * sample_period).collect();
                        row.push((RowKey::Axis(time_axis), SinkValue::FloatArray(times)));
                    }
                    time_pushed = true;
                }
                let device = Self::device_index(&declared_index);
                let mut wave = Vec::with_capacity(samples);
                let mut index = vec![0usize; buffer.ndim()];
                for sample in 0..samples {
                    let mut i_sum = 0.0;
                    let mut q_sum = 0.0;
                    for rep in 0..self.repetitions {
                        index[0] = rep;
                        index[1..=hw_dims].copy_from_slice(&device);
                        index[hw_dims + 1] = sample;
                        index[hw_dims + 2] = 0;
                        i_sum += buffer[IxDyn(&index)];
                        index[hw_dims + 2] = 1;
                        q_sum += buffer[IxDyn(&index)];
                    }
                    let n = self.repetitions as f64;
                    wave.push(Complex64::new(i_sum / n, q_sum / n));
                }
                row.push((
                    RowKey::Result(channel[0].primary),
                    SinkValue::ComplexArray(wave),
                ));
            }
            sink.append_row(&row)?;
            rows += 1;
        }
        Ok(rows)
    }

    fn emit_bulk(
        &self,
        sink: &mut dyn ResultSink,
        software_coords: &[f64],
        buffers: &RawBuffers,
    ) -> Result<usize> {
        let sample_period = buffers.sample_period.ok_or_else(|| {
            Error::new("bulk capture requires the device to report its sample period")
        })?;
        let mut row = self.coordinate_cells(software_coords, &[]);
        let mut time_pushed = false;
        for (channel, buffer) in self.outputs.iter().zip(&buffers.per_channel) {
            // [samples, 2]
            if buffer.ndim() != 2 || buffer.shape()[1] != 2 {
                return Err(Error::new(format!(
                    "bulk buffer has unexpected shape {:?}",
                    buffer.shape()
                )));
            }
            let samples = buffer.shape()[0];
            if !time_pushed {
                if let Some(time_axis) = self.time_axis {
                    let times: Vec<f64> =
                        (0..samples).map(|s| s as f64 * sample_period).collect();
                    row.push((RowKey::Axis(time_axis), SinkValue::FloatArray(times)));
                }
                time_pushed = true;
            }
            let wave: Vec<Complex64> = (0..samples)
                .map(|s| Complex64::new(buffer[[s, 0]], buffer[[s, 1]]))
                .collect();
            row.push((
                RowKey::Result(channel[0].primary),
                SinkValue::ComplexArray(wave),
            ));
        }
        sink.append_row(&row)?;
        Ok(1)
    }
}

/// Row-major iterator over a multi-dimensional index space; the last
/// dimension varies fastest. Yields one empty index when there are no
/// dimensions.
pub(crate) struct MultiIndex {
    extents: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl MultiIndex {
    pub(crate) fn new(extents: Vec<usize>) -> Self {
        let next = if extents.contains(&0) {
            None
        } else {
            Some(vec![0; extents.len()])
        };
        MultiIndex { extents, next }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.clone()?;
        let mut bumped = current.clone();
        let mut done = true;
        for axis in (0..self.extents.len()).rev() {
            bumped[axis] += 1;
            if bumped[axis] < self.extents[axis] {
                done = false;
                break;
            }
            bumped[axis] = 0;
        }
        self.next = if done { None } else { Some(bumped) };
        Some(current)
    }
}

fn mean(points: &[Complex64]) -> Complex64 {
    let sum: Complex64 = points.iter().sum();
    sum / points.len() as f64
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Geometric median of complex samples via Weiszfeld iteration, stopping on
/// fractional improvement of the summed distance.
pub fn geometric_median(points: &[Complex64]) -> Complex64 {
    let mut estimate = mean(points);
    let mut objective: f64 = points.iter().map(|p| (p - estimate).norm()).sum();
    if objective == 0.0 {
        return estimate;
    }
    for _ in 0..MEDIAN_MAX_ITERATIONS {
        let mut weight_sum = 0.0;
        let mut weighted = Complex64::new(0.0, 0.0);
        for p in points {
            // Clamp coincident points to keep the update finite.
            let distance = (p - estimate).norm().max(f64::EPSILON);
            let weight = 1.0 / distance;
            weighted += p * weight;
            weight_sum += weight;
        }
        let next = weighted / weight_sum;
        let next_objective: f64 = points.iter().map(|p| (p - next).norm()).sum();
        let improvement = (objective - next_objective) / objective;
        estimate = next;
        objective = next_objective;
        if improvement.abs() < MEDIAN_TOLERANCE {
            break;
        }
    }
    estimate
}

/// Median of the distances from `center`, the robust spread companion of
/// the geometric median.
pub fn median_absolute_deviation(points: &[Complex64], center: Complex64) -> f64 {
    let mut distances: Vec<f64> = points.iter().map(|p| (p - center).norm()).collect();
    median(&mut distances)
}
