//! Training configuration for certified training.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a working config (epsilon 0.3 over 50 epochs, MNIST-style).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::stats::DatasetStats;

// ── Enums ───────────────────────────────────────────────────────────────────

/// Unit in which schedule lengths and milestones are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleUnit {
    #[default]
    Epoch,
    Batch,
}

impl ScheduleUnit {
    /// Converts a length in this unit into a number of batches.
    pub fn to_batches(self, length: usize, batches_per_epoch: usize) -> usize {
        match self {
            Self::Epoch => length * batches_per_epoch,
            Self::Batch => length,
        }
    }
}

impl FromStr for ScheduleUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epoch" => Ok(Self::Epoch),
            "batch" => Ok(Self::Batch),
            other => Err(ConfigError::UnknownVariant {
                kind: "schedule unit",
                value: other.to_string(),
                expected: "epoch, batch",
            }),
        }
    }
}

/// Curve followed by epsilon during ramp-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampShape {
    /// Straight line from start to target.
    Linear,
    /// Polynomial growth up to `mid_point` of the ramp, then linear.
    #[default]
    Smoothed,
}

impl FromStr for RampShape {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "smoothed" => Ok(Self::Smoothed),
            other => Err(ConfigError::UnknownVariant {
                kind: "ramp shape",
                value: other.to_string(),
                expected: "linear, smoothed",
            }),
        }
    }
}

// ── Epsilon schedule ────────────────────────────────────────────────────────

/// Shape of the epsilon ramp. The target value lives on
/// [`CertifiedTrainingConfig::eps`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsScheduleConfig {
    /// Epsilon used during warm-up and at the start of the ramp.
    #[serde(default)]
    pub start_eps: f64,
    /// Length of the clean warm-up phase (in `unit`).
    #[serde(default)]
    pub warm_up: usize,
    /// Length of the ramp from `start_eps` to the target (in `unit`). Must be > 0.
    #[serde(default = "default_ramp_up")]
    pub ramp_up: usize,
    #[serde(default)]
    pub unit: ScheduleUnit,
    #[serde(default)]
    pub shape: RampShape,
    /// Fraction of the ramp spent in the polynomial part (smoothed shape only).
    #[serde(default = "default_mid_point")]
    pub mid_point: f64,
    /// Polynomial exponent of the smoothed shape.
    #[serde(default = "default_exponent")]
    pub exponent: f64,
}

impl Default for EpsScheduleConfig {
    fn default() -> Self {
        Self {
            start_eps: 0.0,
            warm_up: 0,
            ramp_up: default_ramp_up(),
            unit: ScheduleUnit::Epoch,
            shape: RampShape::Smoothed,
            mid_point: default_mid_point(),
            exponent: default_exponent(),
        }
    }
}

impl EpsScheduleConfig {
    /// Checks the schedule against the target epsilon it will ramp to.
    pub fn validate(&self, target_eps: f64) -> Result<()> {
        if self.ramp_up == 0 {
            return Err(ConfigError::Schedule("ramp_up must be > 0".into()));
        }
        if !self.start_eps.is_finite() || self.start_eps < 0.0 {
            return Err(ConfigError::Schedule(format!(
                "start_eps must be finite and >= 0, got {}",
                self.start_eps
            )));
        }
        if !target_eps.is_finite() {
            return Err(ConfigError::Schedule(format!(
                "target eps must be finite, got {target_eps}"
            )));
        }
        if target_eps < self.start_eps {
            return Err(ConfigError::Schedule(format!(
                "target eps {target_eps} is below start_eps {}",
                self.start_eps
            )));
        }
        if self.shape == RampShape::Smoothed {
            if !(self.mid_point > 0.0 && self.mid_point < 1.0) {
                return Err(ConfigError::Schedule(format!(
                    "mid_point must lie in (0, 1), got {}",
                    self.mid_point
                )));
            }
            if !(self.exponent >= 1.0) {
                return Err(ConfigError::Schedule(format!(
                    "exponent must be >= 1, got {}",
                    self.exponent
                )));
            }
        }
        Ok(())
    }
}

// ── Coefficients ────────────────────────────────────────────────────────────

/// Start and end of a loss-mixing coefficient that moves with the epsilon ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRange {
    pub start: f64,
    pub end: f64,
}

impl Default for CoefficientRange {
    fn default() -> Self {
        Self {
            start: 1.0,
            end: 0.0,
        }
    }
}

impl CoefficientRange {
    pub fn validate(&self, name: &'static str) -> Result<()> {
        for v in [self.start, self.end] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Coefficient {
                    name,
                    reason: format!("{v} is outside [0, 1]"),
                });
            }
        }
        Ok(())
    }
}

// ── LR decay ────────────────────────────────────────────────────────────────

/// Multi-step learning-rate decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrDecayConfig {
    /// 1-based epochs (or batches) at whose start the rate is multiplied by `factor`.
    #[serde(default = "default_lr_milestones")]
    pub milestones: Vec<usize>,
    #[serde(default = "default_lr_decay_factor")]
    pub factor: f64,
    #[serde(default)]
    pub unit: ScheduleUnit,
}

impl Default for LrDecayConfig {
    fn default() -> Self {
        Self {
            milestones: default_lr_milestones(),
            factor: default_lr_decay_factor(),
            unit: ScheduleUnit::Epoch,
        }
    }
}

impl LrDecayConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0 && self.factor <= 1.0) {
            return Err(ConfigError::LrDecay(format!(
                "factor must lie in (0, 1], got {}",
                self.factor
            )));
        }
        if self.milestones.first() == Some(&0) {
            return Err(ConfigError::LrDecay("milestones are 1-based".into()));
        }
        if self.milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::LrDecay(format!(
                "milestones must be strictly increasing, got {:?}",
                self.milestones
            )));
        }
        Ok(())
    }
}

// ── Training config ─────────────────────────────────────────────────────────

/// Everything the training driver needs apart from the model itself.
///
/// Stored next to checkpoints so a resumed run uses the schedule it was
/// started with. Backwards-compatible: missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertifiedTrainingConfig {
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    /// Target robustness radius in raw input units.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Trains against `eps * train_eps_factor`.
    #[serde(default = "default_one")]
    pub train_eps_factor: f64,
    #[serde(default)]
    pub eps_schedule: EpsScheduleConfig,
    /// Weight of the clean loss against the robust loss.
    #[serde(default)]
    pub kappa: CoefficientRange,
    /// Weight of the IBP bound against the CROWN-IBP bound.
    #[serde(default)]
    pub beta: CoefficientRange,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default)]
    pub lr_decay: LrDecayConfig,
    /// Checkpoint every `save_every` epochs (0 = only at the end).
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    /// Stop once epsilon reaches this fraction of the training target.
    #[serde(default)]
    pub multi_fidelity_train_eps: Option<f64>,
    #[serde(default)]
    pub dataset: DatasetStats,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_ramp_up() -> usize {
    20
}
fn default_mid_point() -> f64 {
    0.25
}
fn default_exponent() -> f64 {
    4.0
}
fn default_lr_milestones() -> Vec<usize> {
    vec![15, 25]
}
fn default_lr_decay_factor() -> f64 {
    0.2
}
fn default_num_epochs() -> usize {
    50
}
fn default_eps() -> f64 {
    0.3
}
fn default_one() -> f64 {
    1.0
}
fn default_lr() -> f64 {
    5e-4
}
fn default_save_every() -> usize {
    1
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for CertifiedTrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            eps: default_eps(),
            train_eps_factor: 1.0,
            eps_schedule: EpsScheduleConfig::default(),
            kappa: CoefficientRange::default(),
            beta: CoefficientRange::default(),
            lr: default_lr(),
            lr_decay: LrDecayConfig::default(),
            save_every: default_save_every(),
            multi_fidelity_train_eps: None,
            dataset: DatasetStats::default(),
            output_dir: default_output_dir(),
        }
    }
}

impl CertifiedTrainingConfig {
    /// The radius training ramps to.
    pub fn train_eps(&self) -> f64 {
        self.eps * self.train_eps_factor
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(ConfigError::Training("num_epochs must be > 0".into()));
        }
        if !(self.train_eps_factor.is_finite() && self.train_eps_factor > 0.0) {
            return Err(ConfigError::Training(format!(
                "train_eps_factor must be > 0, got {}",
                self.train_eps_factor
            )));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::Training(format!("lr must be > 0, got {}", self.lr)));
        }
        if let Some(f) = self.multi_fidelity_train_eps {
            if !(f > 0.0 && f <= 1.0) {
                return Err(ConfigError::Training(format!(
                    "multi_fidelity_train_eps must lie in (0, 1], got {f}"
                )));
            }
        }
        self.eps_schedule.validate(self.train_eps())?;
        self.kappa.validate("kappa")?;
        self.beta.validate("beta")?;
        self.lr_decay.validate()?;
        self.dataset.validate()?;
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
