//! Learning-rate schedule used alongside the epsilon ramp.

use ctrain_common::{ConfigError, LrDecayConfig, ScheduleUnit};

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Multi-step decay: multiply the rate by `factor` at every milestone.
///
/// Milestones are 1-based: with milestones `[15, 25]` counted in epochs, the
/// rate drops when the 15th epoch starts and again when the 25th does. The
/// rate is a pure function of the batch clock, so a resumed run gets the
/// decays it already went through without replaying them.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    base_lr: f64,
    milestones: Vec<usize>,
    factor: f64,
    unit: ScheduleUnit,
    batches_per_epoch: usize,
}

impl LrScheduler {
    pub fn new(
        base_lr: f64,
        decay: &LrDecayConfig,
        batches_per_epoch: usize,
    ) -> Result<Self, ConfigError> {
        decay.validate()?;
        if batches_per_epoch == 0 {
            return Err(ConfigError::LrDecay("batches_per_epoch must be > 0".into()));
        }
        Ok(Self {
            base_lr,
            milestones: decay.milestones.clone(),
            factor: decay.factor,
            unit: decay.unit,
            batches_per_epoch,
        })
    }

    /// 1-based position of global batch `step` in the milestone unit.
    fn position(&self, step: usize) -> usize {
        match self.unit {
            ScheduleUnit::Epoch => step / self.batches_per_epoch + 1,
            ScheduleUnit::Batch => step + 1,
        }
    }

    /// Learning rate in effect for global batch `step`.
    pub fn lr_at_step(&self, step: usize) -> f64 {
        let pos = self.position(step);
        let decays = self.milestones.iter().take_while(|&&m| m <= pos).count();
        self.base_lr * self.factor.powi(decays as i32)
    }

    /// Learning rate in effect at the start of `epoch` (0-based).
    pub fn lr_for_epoch(&self, epoch: usize) -> f64 {
        self.lr_at_step(epoch * self.batches_per_epoch)
    }

    /// Whether a decay takes effect exactly at global batch `step`.
    pub fn decays_at_step(&self, step: usize) -> bool {
        let on_boundary = match self.unit {
            ScheduleUnit::Epoch => step % self.batches_per_epoch == 0,
            ScheduleUnit::Batch => true,
        };
        on_boundary && self.milestones.contains(&self.position(step))
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
