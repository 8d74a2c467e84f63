// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;

use crate::instruction::SweepField;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "value {value} for register '{register}' is outside the representable range [{min}, {max}]"
    )]
    Quantization {
        register: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("swept parameter '{parameter}' is not referenced by any instruction")]
    UnboundSweep { parameter: String },
    #[error("the {instruction} instruction cannot hardware-sweep its {field} field")]
    UnsupportedSweep {
        instruction: &'static str,
        field: SweepField,
    },
    #[error("{0}")]
    Precondition(String),
    #[error("device error: {0}")]
    Device(anyhow::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new<T: Display>(msg: T) -> Self {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
