//! Per-channel dataset statistics.
//!
//! Epsilon is always configured in raw input units (e.g. `8/255` for pixel
//! values in `[0, 1]`). When the training data is normalised, the radius that
//! applies to channel `c` of the network input is `eps / std[c]`, and the
//! valid input range becomes `[(0 - mean) / std, (1 - mean) / std]`.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Normalisation statistics and clamp range of a dataset, one entry per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    /// Lower clamp bound per channel, in network-input space.
    pub min: Vec<f64>,
    /// Upper clamp bound per channel, in network-input space.
    pub max: Vec<f64>,
    /// Whether inputs are normalised with `mean`/`std` before the network sees them.
    #[serde(default)]
    pub normalised: bool,
}

impl Default for DatasetStats {
    /// Single channel, raw inputs in `[0, 1]`.
    fn default() -> Self {
        Self::unnormalised(1)
    }
}

impl DatasetStats {
    /// Raw `[0, 1]` inputs with `channels` channels.
    pub fn unnormalised(channels: usize) -> Self {
        Self {
            mean: vec![0.0; channels],
            std: vec![1.0; channels],
            min: vec![0.0; channels],
            max: vec![1.0; channels],
            normalised: false,
        }
    }

    /// `[0, 1]` inputs normalised with the given per-channel mean and std.
    pub fn normalised(mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(ConfigError::Stats(format!(
                "mean has {} channels but std has {}",
                mean.len(),
                std.len()
            )));
        }
        let min = mean.iter().zip(&std).map(|(m, s)| (0.0 - m) / s).collect();
        let max = mean.iter().zip(&std).map(|(m, s)| (1.0 - m) / s).collect();
        let stats = Self {
            mean,
            std,
            min,
            max,
            normalised: true,
        };
        stats.validate()?;
        Ok(stats)
    }

    pub fn channels(&self) -> usize {
        self.std.len()
    }

    pub fn validate(&self) -> Result<()> {
        let c = self.channels();
        if c == 0 {
            return Err(ConfigError::Stats("at least one channel is required".into()));
        }
        if self.mean.len() != c || self.min.len() != c || self.max.len() != c {
            return Err(ConfigError::Stats(format!(
                "channel count mismatch: mean={}, std={}, min={}, max={}",
                self.mean.len(),
                c,
                self.min.len(),
                self.max.len()
            )));
        }
        if let Some(s) = self.std.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(ConfigError::Stats(format!("std must be finite and > 0, got {s}")));
        }
        for (ch, (lo, hi)) in self.min.iter().zip(&self.max).enumerate() {
            if !(lo <= hi) {
                return Err(ConfigError::Stats(format!(
                    "channel {ch}: min {lo} exceeds max {hi}"
                )));
            }
        }
        Ok(())
    }

    /// Expresses a raw-unit radius per channel in network-input space.
    pub fn normalise_eps(&self, eps: f64) -> Vec<f64> {
        if self.normalised {
            self.std.iter().map(|s| eps / s).collect()
        } else {
            vec![eps; self.channels()]
        }
    }
}
