// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Acquisition configuration, validated once before any device contact.

use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use num_complex::Complex64;

use crate::{Error, Result};

/// How raw buffers are reduced into emitted results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Mean over the repetition axis, one complex value per point.
    Accumulated,
    /// Geometric median plus median absolute deviation over the repetition
    /// axis, two result channels per acquisition channel.
    AccumulatedRobust,
    /// Repetition axis retained as an explicit shot axis.
    RawShots,
    /// Per-sample waveform with a time axis, averaged over repetitions.
    Decimated,
    /// One long contiguous decimated capture, no hardware loops.
    Ddr4Bulk,
    /// Discrete-state population histogram over repetitions.
    PopulationCounted,
}

/// Maps one shot's complex IQ value to a discrete state index.
///
/// Supplied externally for population-counted acquisitions; the engine only
/// requires the state count to size the joint histogram.
pub trait StateClassifier {
    fn num_states(&self) -> usize;
    fn classify(&self, iq: Complex64) -> usize;
}

/// Immutable per-run acquisition settings.
#[derive(Clone)]
pub struct AcquisitionConfig {
    mode: AcquisitionMode,
    repetitions: usize,
    soft_avgs: usize,
    progress: bool,
    classifier: Option<Arc<dyn StateClassifier>>,
}

impl Debug for AcquisitionConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionConfig")
            .field("mode", &self.mode)
            .field("repetitions", &self.repetitions)
            .field("soft_avgs", &self.soft_avgs)
            .field("progress", &self.progress)
            .field("classifier", &self.classifier.as_ref().map(|c| c.num_states()))
            .finish()
    }
}

impl AcquisitionConfig {
    pub fn new(mode: AcquisitionMode, repetitions: usize) -> Self {
        AcquisitionConfig {
            mode,
            repetitions,
            soft_avgs: 1,
            progress: false,
            classifier: None,
        }
    }

    /// Number of full acquisitions averaged on the host on top of the
    /// device-side repetition averaging.
    pub fn with_soft_avgs(mut self, soft_avgs: usize) -> Self {
        self.soft_avgs = soft_avgs;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn StateClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    pub fn soft_avgs(&self) -> usize {
        self.soft_avgs
    }

    pub fn progress(&self) -> bool {
        self.progress
    }

    pub fn classifier(&self) -> Option<&Arc<dyn StateClassifier>> {
        self.classifier.as_ref()
    }

    /// Check mode constraints against the declared sweeps. Runs before the
    /// first device call; a violation never surfaces mid-run.
    pub fn validate(&self, has_hardware_sweeps: bool) -> Result<()> {
        if self.repetitions == 0 {
            return Err(Error::Precondition(
                "repetitions must be at least 1".to_string(),
            ));
        }
        if self.soft_avgs == 0 {
            return Err(Error::Precondition(
                "soft_avgs must be at least 1".to_string(),
            ));
        }
        let needs_raw_shots = matches!(
            self.mode,
            AcquisitionMode::AccumulatedRobust
                | AcquisitionMode::RawShots
                | AcquisitionMode::PopulationCounted
        );
        if needs_raw_shots && self.soft_avgs > 1 {
            return Err(Error::Precondition(format!(
                "{:?} mode needs per-shot data and cannot be combined with host-side averaging (soft_avgs = {})",
                self.mode, self.soft_avgs
            )));
        }
        match self.mode {
            AcquisitionMode::PopulationCounted => {
                let Some(classifier) = &self.classifier else {
                    return Err(Error::Precondition(
                        "population-counted mode needs a state classifier".to_string(),
                    ));
                };
                if classifier.num_states() < 2 {
                    return Err(Error::Precondition(
                        "state classifier must distinguish at least 2 states".to_string(),
                    ));
                }
            }
            AcquisitionMode::Ddr4Bulk => {
                if has_hardware_sweeps {
                    return Err(Error::Precondition(
                        "bulk capture cannot be combined with hardware sweeps".to_string(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TwoState;

    impl StateClassifier for TwoState {
        fn num_states(&self) -> usize {
            2
        }

        fn classify(&self, iq: Complex64) -> usize {
            usize::from(iq.re > 0.0)
        }
    }

    #[test]
    fn test_robust_rejects_soft_avgs() {
        let config = AcquisitionConfig::new(AcquisitionMode::AccumulatedRobust, 100)
            .with_soft_avgs(4);
        assert!(matches!(config.validate(false), Err(Error::Precondition(_))));
        let config = AcquisitionConfig::new(AcquisitionMode::AccumulatedRobust, 100);
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_population_needs_classifier() {
        let config = AcquisitionConfig::new(AcquisitionMode::PopulationCounted, 100);
        assert!(config.validate(false).is_err());
        let config = config.with_classifier(Arc::new(TwoState));
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_bulk_rejects_hardware_sweeps() {
        let config = AcquisitionConfig::new(AcquisitionMode::Ddr4Bulk, 1);
        assert!(config.validate(true).is_err());
        assert!(config.validate(false).is_ok());
    }
}
