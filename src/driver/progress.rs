// SPDX-License-Identifier: Apache-2.0

//! The one-way progress channel between the spawned updater program and the
//! driver: line-framed `<tag>:<payload>` records, plus the weighting that
//! folds per-package progress into a single 0..1 curve.

use crate::constants::VERIFY_PROGRESS_FRACTION;
use crate::error::{Result, UpdateError};
use std::io::Write;

/// One record on the pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressMsg {
    /// Absolute progress of the current sub-phase, 0..1.
    SetProgress(f32),
    /// Declares the weight of the next sub-phase as a fraction of the
    /// package.
    ShowProgress(f32),
    WriteLog(String),
    UiLog(String),
    RetryUpdate,
}

impl ProgressMsg {
    pub fn parse(line: &str) -> Result<Self> {
        let (tag, payload) = line.split_once(':').unwrap_or((line, ""));
        match tag {
            "set_progress" => {
                let value: f32 = payload.trim().parse().map_err(|_| {
                    UpdateError::ProgramInvalid(format!("bad set_progress payload {:?}", payload))
                })?;
                Ok(ProgressMsg::SetProgress(value.clamp(0.0, 1.0)))
            }
            "show_progress" => {
                // payload is `<frac>,<dummy>`; only the fraction matters
                let frac = payload.split(',').next().unwrap_or("").trim();
                let value: f32 = frac.parse().map_err(|_| {
                    UpdateError::ProgramInvalid(format!("bad show_progress payload {:?}", payload))
                })?;
                Ok(ProgressMsg::ShowProgress(value.clamp(0.0, 1.0)))
            }
            "write_log" => Ok(ProgressMsg::WriteLog(payload.to_string())),
            "ui_log" => Ok(ProgressMsg::UiLog(payload.to_string())),
            "retry_update" => Ok(ProgressMsg::RetryUpdate),
            other => Err(UpdateError::ProgramInvalid(format!(
                "unknown progress tag {:?}",
                other
            ))),
        }
    }
}

/// Child-side writer: frames records onto the inherited pipe fd.
pub struct ProgressWriter<W: Write> {
    out: W,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn set_progress(&mut self, value: f32) -> Result<()> {
        writeln!(self.out, "set_progress:{}", value.clamp(0.0, 1.0))?;
        self.out.flush()?;
        Ok(())
    }

    pub fn show_progress(&mut self, frac: f32) -> Result<()> {
        writeln!(self.out, "show_progress:{},0", frac.clamp(0.0, 1.0))?;
        self.out.flush()?;
        Ok(())
    }

    pub fn write_log(&mut self, msg: &str) -> Result<()> {
        writeln!(self.out, "write_log:{}", msg)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn ui_log(&mut self, msg: &str) -> Result<()> {
        writeln!(self.out, "ui_log:{}", msg)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn retry_update(&mut self) -> Result<()> {
        writeln!(self.out, "retry_update:")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Folds per-package progress into the overall 0..1 curve: a fixed slice up
/// front for verification, then per-package slices proportional to packed
/// size.
pub struct ProgressPlan {
    weights: Vec<f32>,
    verify_done: bool,
}

impl ProgressPlan {
    pub fn new(packed_sizes: &[u64]) -> Self {
        let total: u64 = packed_sizes.iter().sum();
        let weights = if total == 0 {
            vec![1.0 / packed_sizes.len().max(1) as f32; packed_sizes.len()]
        } else {
            packed_sizes
                .iter()
                .map(|&s| s as f32 / total as f32)
                .collect()
        };
        Self {
            weights,
            verify_done: false,
        }
    }

    pub fn verify_complete(&mut self) {
        self.verify_done = true;
    }

    /// Overall progress given the running package index and its inner 0..1
    /// progress.
    pub fn overall(&self, package: usize, inner: f32) -> f32 {
        let verify = if self.verify_done {
            VERIFY_PROGRESS_FRACTION
        } else {
            0.0
        };
        let done: f32 = self.weights[..package.min(self.weights.len())].iter().sum();
        let current = self
            .weights
            .get(package)
            .map(|w| w * inner.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        (verify + (1.0 - VERIFY_PROGRESS_FRACTION) * (done + current)).min(1.0)
    }
}
