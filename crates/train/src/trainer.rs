//! Trainer: drives epochs and batches on a single schedule clock.
//!
//! The trainer is model-agnostic. It owns the epsilon and learning-rate
//! schedules and the checkpoint cadence; the forward pass, bound computation
//! and optimiser step live behind [`CertifiedStep`].

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;

use ctrain_common::{CertifiedTrainingConfig, DatasetStats};
use ctrain_core::{EpsScheduler, PerturbationBox, SchedulePhase};

use crate::checkpoint::TrainingCheckpoint;
use crate::scheduler::LrScheduler;

// ── Step interface ──────────────────────────────────────────────────────────

/// Schedule values handed to a training step.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub epoch: usize,
    /// Batch index within the epoch.
    pub batch: usize,
    pub global_step: usize,
    /// Raw epsilon for this batch.
    pub eps: f64,
    /// Epsilon per input channel, in network-input space.
    pub eps_per_channel: &'a [f64],
    pub max_eps: f64,
    pub kappa: f64,
    pub beta: f64,
    pub lr: f64,
    pub phase: SchedulePhase,
    /// Clamp range of the inputs.
    pub stats: &'a DatasetStats,
}

impl StepContext<'_> {
    /// Input box of this batch's per-channel epsilon around `data`.
    pub fn perturbation(&self, data: &Tensor) -> ctrain_core::error::Result<PerturbationBox> {
        PerturbationBox::linf(data, self.eps_per_channel, self.stats)
    }
}

/// What a training step reports back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f64,
    /// Fraction of the batch misclassified on clean inputs.
    pub natural_error: f64,
    /// Fraction of the batch that could not be certified, when bounds were computed.
    pub robust_error: Option<f64>,
}

impl StepOutcome {
    pub fn clean(loss: f64, natural_error: f64) -> Self {
        Self {
            loss,
            natural_error,
            robust_error: None,
        }
    }

    pub fn with_robust_error(mut self, robust_error: f64) -> Self {
        self.robust_error = Some(robust_error);
        self
    }
}

/// One optimisation step of a certified-training method.
pub trait CertifiedStep {
    fn step(&mut self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome>;
}

impl<F> CertifiedStep for F
where
    F: FnMut(&StepContext<'_>) -> anyhow::Result<StepOutcome>,
{
    fn step(&mut self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        self(ctx)
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub mean_loss: f64,
    pub natural_accuracy: f64,
    /// `None` when no batch of the epoch computed bounds.
    pub certified_accuracy: Option<f64>,
    /// Epsilon at the first batch of the epoch.
    pub eps: f64,
    pub lr: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    pub start_epoch: usize,
    /// Epochs completed when `fit` returned.
    pub end_epoch: usize,
    /// Stopped by the multi-fidelity epsilon threshold.
    pub stopped_early: bool,
    pub epochs: Vec<EpochMetrics>,
    pub checkpoints: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct EpochTotals {
    loss: f64,
    natural_err: f64,
    robust_err: f64,
    robust_batches: usize,
    last_lr: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training driver. Owns the schedules, the checkpoint cadence, and
/// optionally the parameters to persist with each checkpoint.
pub struct Trainer {
    pub config: CertifiedTrainingConfig,
    eps_scheduler: EpsScheduler,
    lr_scheduler: LrScheduler,
    varmap: Option<VarMap>,
}

impl Trainer {
    /// Fresh run starting at epoch 0.
    pub fn new(config: CertifiedTrainingConfig, batches_per_epoch: usize) -> anyhow::Result<Self> {
        Self::starting_at(config, batches_per_epoch, 0)
    }

    /// Run starting at `start_epoch` without a checkpoint, e.g. when the
    /// caller restored the model itself. The schedules are positioned exactly
    /// where an uninterrupted run would be.
    pub fn starting_at(
        config: CertifiedTrainingConfig,
        batches_per_epoch: usize,
        start_epoch: usize,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let eps_scheduler = EpsScheduler::resume(&config, batches_per_epoch, start_epoch)?;
        let lr_scheduler = LrScheduler::new(config.lr, &config.lr_decay, batches_per_epoch)?;

        tracing::info!(
            eps = config.train_eps(),
            num_epochs = config.num_epochs,
            batches_per_epoch,
            start_epoch,
            warm_up = config.eps_schedule.warm_up,
            ramp_up = config.eps_schedule.ramp_up,
            shape = ?config.eps_schedule.shape,
            "Trainer ready"
        );

        Ok(Self {
            config,
            eps_scheduler,
            lr_scheduler,
            varmap: None,
        })
    }

    /// Continue from a loaded checkpoint, using the config it was saved with.
    pub fn from_checkpoint(
        checkpoint: &TrainingCheckpoint,
        batches_per_epoch: usize,
    ) -> anyhow::Result<Self> {
        let config = checkpoint.config.clone();
        config.validate()?;
        let eps_scheduler =
            EpsScheduler::from_state(&config, &checkpoint.scheduler, batches_per_epoch)?;
        let lr_scheduler = LrScheduler::new(config.lr, &config.lr_decay, batches_per_epoch)?;

        tracing::info!(
            epoch = checkpoint.epoch,
            eps = eps_scheduler.current_eps(),
            kappa = eps_scheduler.kappa(),
            "Resuming from checkpoint"
        );

        Ok(Self {
            config,
            eps_scheduler,
            lr_scheduler,
            varmap: None,
        })
    }

    /// Continue from the latest checkpoint in `dir`. New checkpoints go to
    /// `dir` as well, whatever output directory the run was started with.
    pub fn resume(dir: &Path, batches_per_epoch: usize) -> anyhow::Result<Self> {
        let mut checkpoint = TrainingCheckpoint::load_latest(dir)?;
        checkpoint.config.output_dir = dir.to_path_buf();
        Self::from_checkpoint(&checkpoint, batches_per_epoch)
    }

    /// Persist these parameters with every checkpoint.
    pub fn with_varmap(mut self, varmap: VarMap) -> Self {
        self.varmap = Some(varmap);
        self
    }

    pub fn varmap(&self) -> Option<&VarMap> {
        self.varmap.as_ref()
    }

    /// Load the parameters saved with the checkpoint at the current epoch from
    /// `dir` into the attached var map. Returns `false` if none were saved.
    pub fn restore_weights(&mut self, dir: &Path) -> anyhow::Result<bool> {
        let Some(varmap) = self.varmap.as_mut() else {
            anyhow::bail!("no var map attached; call with_varmap first");
        };
        let checkpoint = TrainingCheckpoint::load(&TrainingCheckpoint::json_path(
            dir,
            self.eps_scheduler.epoch(),
        ))?;
        Ok(checkpoint.restore_weights(dir, varmap)?)
    }

    /// Next epoch to train.
    pub fn epoch(&self) -> usize {
        self.eps_scheduler.epoch()
    }

    pub fn eps_scheduler(&self) -> &EpsScheduler {
        &self.eps_scheduler
    }

    pub fn lr_scheduler(&self) -> &LrScheduler {
        &self.lr_scheduler
    }

    /// Train from the current epoch up to `end_epoch` (default: `num_epochs`).
    pub fn fit<S: CertifiedStep>(
        &mut self,
        step_fn: &mut S,
        end_epoch: Option<usize>,
    ) -> anyhow::Result<TrainingSummary> {
        let num_epochs = self.config.num_epochs;
        let end_epoch = end_epoch.unwrap_or(num_epochs).min(num_epochs);
        let start_epoch = self.epoch();
        let batches_per_epoch = self.eps_scheduler.batches_per_epoch();

        let mut summary = TrainingSummary {
            start_epoch,
            end_epoch: start_epoch,
            ..Default::default()
        };
        if start_epoch >= end_epoch {
            tracing::info!(start_epoch, end_epoch, "Nothing to train");
            return Ok(summary);
        }

        for epoch in start_epoch..end_epoch {
            if self.reached_multi_fidelity() {
                tracing::info!(
                    epoch,
                    eps = self.eps_scheduler.current_eps(),
                    "Epsilon already at multi-fidelity threshold, stopping"
                );
                summary.stopped_early = true;
                break;
            }

            let epoch_eps = self.eps_scheduler.current_eps();
            let epoch_lr = self.lr_scheduler.lr_at_step(self.eps_scheduler.step());
            tracing::info!(
                epoch = epoch + 1,
                num_epochs,
                eps = epoch_eps,
                kappa = format!("{:.2}", self.eps_scheduler.kappa()),
                lr = format!("{epoch_lr:.2e}"),
                phase = %self.eps_scheduler.phase(),
                "Starting epoch"
            );

            let totals = match self.run_epoch(step_fn, epoch) {
                Ok(totals) => totals,
                Err(e) => {
                    // Put the clock back on the epoch boundary so a retry or a
                    // later checkpoint stays consistent.
                    self.eps_scheduler =
                        EpsScheduler::resume(&self.config, batches_per_epoch, epoch)?;
                    return Err(e);
                }
            };

            let n = batches_per_epoch as f64;
            let metrics = EpochMetrics {
                epoch,
                mean_loss: totals.loss / n,
                natural_accuracy: 1.0 - totals.natural_err / n,
                certified_accuracy: (totals.robust_batches > 0)
                    .then(|| 1.0 - totals.robust_err / n),
                eps: epoch_eps,
                lr: epoch_lr,
            };
            tracing::info!(
                epoch = epoch + 1,
                num_epochs,
                loss = format!("{:.4}", metrics.mean_loss),
                natural_acc = format!("{:.4}", metrics.natural_accuracy),
                certified_acc = ?metrics.certified_accuracy,
                "Epoch done"
            );
            summary.epochs.push(metrics);
            summary.end_epoch = epoch + 1;

            let stop = self.reached_multi_fidelity();
            if stop || self.should_save(epoch + 1, end_epoch) {
                let path = self.save_checkpoint(totals.loss, totals.last_lr)?;
                tracing::info!(path = %path.display(), "Saved checkpoint");
                summary.checkpoints.push(path);
            }
            if stop {
                tracing::info!(
                    epoch = epoch + 1,
                    eps = self.eps_scheduler.current_eps(),
                    "Epsilon reached multi-fidelity threshold, stopping"
                );
                summary.stopped_early = true;
                break;
            }
        }

        Ok(summary)
    }

    /// One pass over the loader. Advances the clock once per batch.
    fn run_epoch<S: CertifiedStep>(
        &mut self,
        step_fn: &mut S,
        epoch: usize,
    ) -> anyhow::Result<EpochTotals> {
        let mut totals = EpochTotals::default();
        for batch in 0..self.eps_scheduler.batches_per_epoch() {
            let global_step = self.eps_scheduler.step();
            let lr = self.lr_scheduler.lr_at_step(global_step);
            if self.lr_scheduler.decays_at_step(global_step) {
                tracing::info!(global_step, lr, "Learning rate decayed");
            }

            let eps_per_channel = self.eps_scheduler.current_eps_per_channel();
            let ctx = StepContext {
                epoch,
                batch,
                global_step,
                eps: self.eps_scheduler.current_eps(),
                eps_per_channel: &eps_per_channel,
                max_eps: self.eps_scheduler.max_eps(),
                kappa: self.eps_scheduler.kappa(),
                beta: self.eps_scheduler.beta(),
                lr,
                phase: self.eps_scheduler.phase(),
                stats: self.eps_scheduler.stats(),
            };
            let outcome = step_fn.step(&ctx)?;
            if !outcome.loss.is_finite() {
                anyhow::bail!(
                    "non-finite loss {} at epoch {} batch {batch} (eps {})",
                    outcome.loss,
                    epoch + 1,
                    ctx.eps
                );
            }

            totals.loss += outcome.loss;
            totals.natural_err += outcome.natural_error;
            if let Some(e) = outcome.robust_error {
                totals.robust_err += e;
                totals.robust_batches += 1;
            }
            totals.last_lr = lr;
            self.eps_scheduler.batch_step();
        }
        Ok(totals)
    }

    fn reached_multi_fidelity(&self) -> bool {
        match self.config.multi_fidelity_train_eps {
            Some(fraction) if fraction < 1.0 => self.eps_scheduler.reached_fraction(fraction),
            _ => false,
        }
    }

    fn should_save(&self, completed: usize, end_epoch: usize) -> bool {
        let every = self.config.save_every;
        completed == end_epoch || (every > 0 && completed % every == 0)
    }

    /// Write a checkpoint for the current epoch boundary into `output_dir`.
    pub fn save_checkpoint(&self, running_loss: f64, lr: f64) -> anyhow::Result<PathBuf> {
        let checkpoint = TrainingCheckpoint {
            epoch: self.epoch(),
            running_loss,
            lr,
            eps: self.eps_scheduler.current_eps(),
            scheduler: self.eps_scheduler.state(),
            config: self.config.clone(),
        };
        Ok(checkpoint.save(&self.config.output_dir, self.varmap.as_ref())?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ctrain_common::{EpsScheduleConfig, RampShape};

    fn noop(_: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        Ok(StepOutcome::clean(0.0, 0.0))
    }

    fn config(dir: &Path) -> CertifiedTrainingConfig {
        CertifiedTrainingConfig {
            num_epochs: 6,
            eps: 0.3,
            eps_schedule: EpsScheduleConfig {
                warm_up: 1,
                ramp_up: 4,
                shape: RampShape::Linear,
                ..Default::default()
            },
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn context_follows_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path()), 2).unwrap();
        let mut seen = Vec::new();
        let mut step = |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            seen.push((ctx.epoch, ctx.batch, ctx.global_step, ctx.eps, ctx.phase));
            Ok(StepOutcome::clean(1.0, 0.5))
        };
        let summary = trainer.fit(&mut step, None).unwrap();

        assert_eq!(seen.len(), 12);
        assert_eq!(seen[0], (0, 0, 0, 0.0, SchedulePhase::Clean));
        assert_eq!(seen[2].3, 0.0);
        assert!((seen[3].3 - 0.0375).abs() < 1e-12);
        assert_eq!(seen[3].4, SchedulePhase::RampUp);
        assert_eq!(seen[10].3, 0.3);
        assert_eq!(seen[10].4, SchedulePhase::Full);

        assert_eq!(summary.end_epoch, 6);
        assert_eq!(summary.epochs[0].natural_accuracy, 0.5);
        assert_eq!(summary.epochs[0].certified_accuracy, None);
        assert_eq!(summary.checkpoints.len(), 6);
    }

    #[test]
    fn robust_error_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path()), 4).unwrap();
        let mut step = |_: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::clean(0.5, 0.0).with_robust_error(0.25))
        };
        let summary = trainer.fit(&mut step, Some(1)).unwrap();
        assert_eq!(summary.epochs[0].certified_accuracy, Some(0.75));
        assert_eq!(trainer.epoch(), 1);
    }

    #[test]
    fn step_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path()), 2).unwrap();
        let mut step = |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            if ctx.global_step == 3 {
                anyhow::bail!("out of memory");
            }
            Ok(StepOutcome::clean(1.0, 0.0))
        };
        assert!(trainer.fit(&mut step, None).is_err());

        let mut nan = |_: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::clean(f64::NAN, 0.0))
        };
        assert!(trainer.fit(&mut nan, None).is_err());
    }

    #[test]
    fn invalid_config_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(dir.path());
        c.eps_schedule.ramp_up = 0;
        assert!(Trainer::new(c, 2).is_err());
        assert!(Trainer::new(config(dir.path()), 0).is_err());
    }

    #[test]
    fn save_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(dir.path());
        c.num_epochs = 7;
        c.save_every = 3;
        let mut trainer = Trainer::new(c, 1).unwrap();
        let summary = trainer.fit(&mut noop, None).unwrap();
        let names: Vec<_> = summary
            .checkpoints
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["checkpoint-3.json", "checkpoint-6.json", "checkpoint-7.json"]);
    }

    #[test]
    fn multi_fidelity_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(dir.path());
        c.eps_schedule.warm_up = 0;
        c.eps_schedule.ramp_up = 10;
        c.num_epochs = 20;
        c.multi_fidelity_train_eps = Some(0.5);
        let mut trainer = Trainer::new(c, 2).unwrap();
        let summary = trainer.fit(&mut noop, None).unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.end_epoch, 5);
    }

    #[test]
    fn failed_step_rewinds_to_epoch_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path()), 2).unwrap();
        let mut flaky = |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            if ctx.global_step == 3 {
                anyhow::bail!("out of memory");
            }
            Ok(StepOutcome::clean(1.0, 0.0))
        };
        assert!(trainer.fit(&mut flaky, None).is_err());
        assert_eq!(trainer.eps_scheduler().step(), 2);
        assert_eq!(trainer.epoch(), 1);

        let summary = trainer.fit(&mut noop, Some(3)).unwrap();
        assert_eq!(summary.start_epoch, 1);
        assert_eq!(trainer.eps_scheduler().step(), 6);

        let resumed = Trainer::resume(dir.path(), 2).unwrap();
        assert_eq!(resumed.epoch(), 3);
        assert_eq!(resumed.eps_scheduler().step(), 6);
    }

    #[test]
    fn non_finite_loss_rewinds_to_epoch_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path()), 4).unwrap();
        let mut nan = |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            let loss = if ctx.batch == 2 { f64::NAN } else { 0.0 };
            Ok(StepOutcome::clean(loss, 0.0))
        };
        assert!(trainer.fit(&mut nan, None).is_err());
        assert_eq!(trainer.eps_scheduler().step(), 0);
        assert!(TrainingCheckpoint::latest(dir.path()).is_err());
    }

    #[test]
    fn multi_fidelity_stop_is_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(dir.path());
        c.eps_schedule.warm_up = 0;
        c.eps_schedule.ramp_up = 10;
        c.num_epochs = 20;
        c.save_every = 0;
        c.multi_fidelity_train_eps = Some(0.5);
        let mut trainer = Trainer::new(c, 2).unwrap();
        let summary = trainer.fit(&mut noop, None).unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.end_epoch, 5);
        assert_eq!(summary.checkpoints, vec![dir.path().join("checkpoint-5.json")]);

        // Already past the threshold: nothing more to train.
        let mut resumed = Trainer::resume(dir.path(), 2).unwrap();
        assert_eq!(resumed.epoch(), 5);
        let again = resumed.fit(&mut noop, None).unwrap();
        assert!(again.stopped_early);
        assert!(again.epochs.is_empty());
    }

    #[test]
    fn step_context_builds_clamped_box() {
        use candle_core::Device;

        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path()), 1).unwrap();
        let data = Tensor::new(&[[0.95f32]], &Device::Cpu).unwrap();
        let mut widths = Vec::new();
        let mut step = |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            let b = ctx.perturbation(&data)?;
            let upper = b.upper.flatten_all()?.to_vec1::<f32>()?[0];
            assert!(upper <= 1.0);
            widths.push(b.mean_width()?);
            Ok(StepOutcome::clean(0.0, 0.0))
        };
        trainer.fit(&mut step, None).unwrap();

        assert_eq!(widths[0], 0.0);
        // Full eps 0.3 around 0.95, clamped at 1.0 from above.
        assert!((widths[5] - 0.35).abs() < 1e-6);
    }

    #[test]
    fn lr_decays_at_milestone() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(dir.path());
        c.lr = 1.0;
        c.lr_decay.milestones = vec![3];
        c.lr_decay.factor = 0.5;
        let mut trainer = Trainer::new(c, 1).unwrap();
        let mut lrs = Vec::new();
        let mut step = |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
            lrs.push(ctx.lr);
            Ok(StepOutcome::clean(0.0, 0.0))
        };
        trainer.fit(&mut step, Some(4)).unwrap();
        assert_eq!(lrs, vec![1.0, 1.0, 0.5, 0.5]);
    }
}
