//! The epsilon scheduler.
//!
//! [`EpsScheduler`] owns a batch clock and answers, for the current batch,
//! which radius to certify against (raw and per channel), how to weight the
//! clean loss (`kappa`) and the IBP bound (`beta`), and which
//! [`SchedulePhase`] training is in.
//!
//! The clock starts at `start_epoch * batches_per_epoch` when resuming, so a
//! run restarted from a checkpoint sees the same epsilon it would have seen
//! had it never stopped.

use ctrain_common::{CertifiedTrainingConfig, CoefficientRange, DatasetStats, EpsScheduleConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};
use crate::ramp::Ramp;

/// What a certified-training step should do with the current epsilon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    /// Epsilon is zero: clean loss only.
    Clean,
    /// Epsilon is between zero and the target.
    RampUp,
    /// Epsilon has reached the target.
    Full,
}

impl std::fmt::Display for SchedulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Clean => "clean",
            Self::RampUp => "ramp-up",
            Self::Full => "full",
        };
        f.write_str(s)
    }
}

/// Serialisable position of the scheduler, stored in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Global batch index of the next batch to train on.
    pub step: usize,
    pub batches_per_epoch: usize,
}

impl SchedulerState {
    /// Number of fully completed epochs this state represents.
    pub fn completed_epochs(&self) -> usize {
        self.step / self.batches_per_epoch.max(1)
    }
}

/// Epsilon, kappa and beta schedule driven by a monotone batch clock.
#[derive(Debug, Clone)]
pub struct EpsScheduler {
    ramp: Ramp,
    kappa: CoefficientRange,
    beta: CoefficientRange,
    stats: DatasetStats,
    batches_per_epoch: usize,
    step: usize,
}

impl EpsScheduler {
    /// Scheduler ramping to `target_eps` with default coefficients and
    /// single-channel raw inputs.
    pub fn new(
        schedule: &EpsScheduleConfig,
        target_eps: f64,
        batches_per_epoch: usize,
    ) -> Result<Self> {
        let ramp = Ramp::new(schedule, target_eps, batches_per_epoch)?;
        Ok(Self {
            ramp,
            kappa: CoefficientRange::default(),
            beta: CoefficientRange::default(),
            stats: DatasetStats::default(),
            batches_per_epoch,
            step: 0,
        })
    }

    /// Scheduler for a full training config, ramping to its training epsilon.
    pub fn from_config(config: &CertifiedTrainingConfig, batches_per_epoch: usize) -> Result<Self> {
        Self::new(&config.eps_schedule, config.train_eps(), batches_per_epoch)?
            .with_coefficients(config.kappa, config.beta)?
            .with_stats(config.dataset.clone())
    }

    /// Scheduler positioned at the start of `start_epoch`.
    pub fn resume(
        config: &CertifiedTrainingConfig,
        batches_per_epoch: usize,
        start_epoch: usize,
    ) -> Result<Self> {
        let mut scheduler = Self::from_config(config, batches_per_epoch)?;
        scheduler.fast_forward(start_epoch * batches_per_epoch)?;
        Ok(scheduler)
    }

    /// Scheduler restored from a checkpointed [`SchedulerState`]. The loader
    /// must still yield the same number of batches per epoch, otherwise the
    /// epoch-to-step mapping of the saved run no longer holds.
    pub fn from_state(
        config: &CertifiedTrainingConfig,
        state: &SchedulerState,
        batches_per_epoch: usize,
    ) -> Result<Self> {
        if state.batches_per_epoch != batches_per_epoch {
            return Err(ScheduleError::BatchesPerEpochMismatch {
                recorded: state.batches_per_epoch,
                actual: batches_per_epoch,
            });
        }
        let mut scheduler = Self::from_config(config, batches_per_epoch)?;
        scheduler.fast_forward(state.step)?;
        Ok(scheduler)
    }

    pub fn with_coefficients(
        mut self,
        kappa: CoefficientRange,
        beta: CoefficientRange,
    ) -> Result<Self> {
        kappa.validate("kappa")?;
        beta.validate("beta")?;
        self.kappa = kappa;
        self.beta = beta;
        Ok(self)
    }

    pub fn with_stats(mut self, stats: DatasetStats) -> Result<Self> {
        stats.validate()?;
        self.stats = stats;
        Ok(self)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Raw epsilon at an arbitrary global batch index.
    pub fn eps_at_step(&self, step: usize) -> f64 {
        self.ramp.value(step)
    }

    /// Raw epsilon at the first batch of `epoch`.
    pub fn eps_at_epoch(&self, epoch: usize) -> f64 {
        self.ramp.value(epoch * self.batches_per_epoch)
    }

    /// Raw epsilon for the current batch.
    pub fn current_eps(&self) -> f64 {
        self.ramp.value(self.step)
    }

    /// Current epsilon per input channel, in network-input space.
    pub fn current_eps_per_channel(&self) -> Vec<f64> {
        self.stats.normalise_eps(self.current_eps())
    }

    /// The raw target epsilon.
    pub fn max_eps(&self) -> f64 {
        self.ramp.end()
    }

    pub fn max_eps_per_channel(&self) -> Vec<f64> {
        self.stats.normalise_eps(self.max_eps())
    }

    pub fn kappa_at_step(&self, step: usize) -> f64 {
        interpolate(self.kappa, self.ramp.progress(step))
    }

    pub fn beta_at_step(&self, step: usize) -> f64 {
        interpolate(self.beta, self.ramp.progress(step))
    }

    /// Current weight of the clean loss.
    pub fn kappa(&self) -> f64 {
        self.kappa_at_step(self.step)
    }

    /// Current weight of the IBP bound against CROWN-IBP.
    pub fn beta(&self) -> f64 {
        self.beta_at_step(self.step)
    }

    pub fn phase_at_step(&self, step: usize) -> SchedulePhase {
        let eps = self.eps_at_step(step);
        if eps == 0.0 {
            SchedulePhase::Clean
        } else if eps >= self.max_eps() {
            SchedulePhase::Full
        } else {
            SchedulePhase::RampUp
        }
    }

    pub fn phase(&self) -> SchedulePhase {
        self.phase_at_step(self.step)
    }

    /// Whether epsilon has reached `fraction` of its target.
    pub fn reached_fraction(&self, fraction: f64) -> bool {
        self.current_eps() >= fraction * self.max_eps()
    }

    /// Whether the ramp is complete. From here on every query is constant.
    pub fn is_fully_ramped(&self) -> bool {
        self.step >= self.ramp.final_step()
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Epoch the current batch belongs to.
    pub fn epoch(&self) -> usize {
        self.step / self.batches_per_epoch
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    pub fn stats(&self) -> &DatasetStats {
        &self.stats
    }

    pub fn ramp(&self) -> &Ramp {
        &self.ramp
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            batches_per_epoch: self.batches_per_epoch,
        }
    }

    // ── Advance ─────────────────────────────────────────────────────────────

    /// Advance the clock by one batch.
    pub fn batch_step(&mut self) {
        self.step += 1;
    }

    /// Move the clock forward to `step`. Moving backwards is an error: it
    /// would hand out a smaller epsilon than training has already seen.
    pub fn fast_forward(&mut self, step: usize) -> Result<()> {
        if step < self.step {
            return Err(ScheduleError::Rewind {
                current: self.step,
                requested: step,
            });
        }
        if step != self.step {
            tracing::debug!(
                from = self.step,
                to = step,
                eps = self.ramp.value(step),
                "Fast-forwarding eps schedule"
            );
        }
        self.step = step;
        Ok(())
    }
}

fn interpolate(range: CoefficientRange, progress: f64) -> f64 {
    range.start + (range.end - range.start) * progress
}

// ── Tests ───────────────────────────────────────────────────────────────────
