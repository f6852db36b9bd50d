//! Epsilon ramp curves over a batch clock.
//!
//! A [`Ramp`] maps a global batch index to a radius. Lengths configured in
//! epochs are converted to batches up front, so the curve advances smoothly
//! inside an epoch instead of jumping at epoch boundaries.
//!
//! # Smoothed shape
//!
//! ```text
//! eps(s) = start                                         s <= init
//!          start + alpha * (s - init)^k                  init < s < mid
//!          min(mid_value + (end - mid_value)
//!              * (s - mid) / (final - mid), end)         s >= mid
//! ```
//!
//! `alpha` is chosen so both pieces meet at `mid` with the same slope, which
//! avoids the loss spike a sudden jump in epsilon causes early in the ramp.

use ctrain_common::{EpsScheduleConfig, RampShape};

use crate::error::{Result, ScheduleError};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Curve {
    Linear,
    Smoothed {
        mid_step: usize,
        alpha: f64,
        mid_value: f64,
        exponent: f64,
    },
}

/// A resolved epsilon curve from `start` to `end` between two batch indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Ramp {
    start: f64,
    end: f64,
    init_step: usize,
    final_step: usize,
    curve: Curve,
}

impl Ramp {
    /// Resolve `schedule` towards `target_eps` for a loader with
    /// `batches_per_epoch` batches. Fails on any invalid knob.
    pub fn new(
        schedule: &EpsScheduleConfig,
        target_eps: f64,
        batches_per_epoch: usize,
    ) -> Result<Self> {
        if batches_per_epoch == 0 {
            return Err(ScheduleError::ZeroBatchesPerEpoch);
        }
        schedule.validate(target_eps)?;

        let init_step = schedule.unit.to_batches(schedule.warm_up, batches_per_epoch);
        let ramp_steps = schedule.unit.to_batches(schedule.ramp_up, batches_per_epoch);
        let final_step = init_step + ramp_steps;
        let start = schedule.start_eps;
        let end = target_eps;

        let curve = match schedule.shape {
            RampShape::Linear => Curve::Linear,
            RampShape::Smoothed => {
                let mid_step = init_step + (ramp_steps as f64 * schedule.mid_point) as usize;
                if mid_step == init_step {
                    // Too short for a polynomial head.
                    Curve::Linear
                } else {
                    let k = schedule.exponent;
                    let head = (mid_step - init_step) as f64;
                    let tail = (final_step - mid_step) as f64;
                    let t = head.powf(k - 1.0);
                    let alpha = (end - start) / (tail * k * t + head * t);
                    let mid_value = start + alpha * head.powf(k);
                    Curve::Smoothed {
                        mid_step,
                        alpha,
                        mid_value,
                        exponent: k,
                    }
                }
            }
        };

        Ok(Self {
            start,
            end,
            init_step,
            final_step,
            curve,
        })
    }

    /// Epsilon at global batch `step`.
    pub fn value(&self, step: usize) -> f64 {
        if step <= self.init_step {
            return self.start;
        }
        if step >= self.final_step {
            return self.end;
        }
        match self.curve {
            Curve::Linear => self.start + (self.end - self.start) * self.progress(step),
            Curve::Smoothed {
                mid_step,
                alpha,
                mid_value,
                exponent,
            } => {
                if step < mid_step {
                    self.start + alpha * ((step - self.init_step) as f64).powf(exponent)
                } else {
                    let frac = (step - mid_step) as f64 / (self.final_step - mid_step) as f64;
                    (mid_value + (self.end - mid_value) * frac).min(self.end)
                }
            }
        }
    }

    /// Linear progress through the ramp window, clamped to `[0, 1]`.
    pub fn progress(&self, step: usize) -> f64 {
        if step <= self.init_step {
            0.0
        } else if step >= self.final_step {
            1.0
        } else {
            (step - self.init_step) as f64 / (self.final_step - self.init_step) as f64
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    /// First batch at which epsilon may exceed `start`.
    pub fn init_step(&self) -> usize {
        self.init_step
    }

    /// First batch at which epsilon equals `end`.
    pub fn final_step(&self) -> usize {
        self.final_step
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
