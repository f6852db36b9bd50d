//! L∞ perturbation box around an input batch.
//!
//! Builds `lower = max(x - eps, min)` and `upper = min(x + eps, max)` per
//! channel, so the region handed to a bound-propagation backend never leaves
//! the valid input range of the dataset.

use candle_core::{DType, Device, Tensor};
use ctrain_common::DatasetStats;

use crate::error::{Result, ScheduleError};

/// Per-channel values shaped `(C, 1, ..., 1)` so they broadcast against an
/// input of the given `rank` laid out as `(N, C, ...)`.
pub fn eps_tensor(values: &[f64], rank: usize, device: &Device) -> Result<Tensor> {
    let mut shape = vec![values.len()];
    shape.extend(std::iter::repeat(1).take(rank.saturating_sub(2)));
    Ok(Tensor::from_vec(values.to_vec(), shape, device)?)
}

/// Clamped input box for one batch.
#[derive(Debug, Clone)]
pub struct PerturbationBox {
    pub lower: Tensor,
    pub upper: Tensor,
    /// Per-channel radius, broadcastable against the input.
    pub eps: Tensor,
}

impl PerturbationBox {
    /// Box of per-channel radius `eps` around `data`, clamped to the range in `stats`.
    pub fn linf(data: &Tensor, eps: &[f64], stats: &DatasetStats) -> Result<Self> {
        let dims = data.dims();
        if dims.len() < 2 {
            return Err(ScheduleError::InputRank(dims.to_vec()));
        }
        let channels = dims[1];
        if eps.len() != channels {
            return Err(ScheduleError::ChannelMismatch {
                expected: eps.len(),
                actual: channels,
            });
        }
        if stats.channels() != channels {
            return Err(ScheduleError::ChannelMismatch {
                expected: stats.channels(),
                actual: channels,
            });
        }

        let rank = dims.len();
        let device = data.device();
        let dtype = data.dtype();
        let eps = eps_tensor(eps, rank, device)?.to_dtype(dtype)?;
        let min = eps_tensor(&stats.min, rank, device)?.to_dtype(dtype)?;
        let max = eps_tensor(&stats.max, rank, device)?.to_dtype(dtype)?;

        let lower = data.broadcast_sub(&eps)?.broadcast_maximum(&min)?;
        let upper = data.broadcast_add(&eps)?.broadcast_minimum(&max)?;
        Ok(Self { lower, upper, eps })
    }

    /// Mean width of the box, useful for logging how much of the radius
    /// survives clamping.
    pub fn mean_width(&self) -> Result<f64> {
        let width = (&self.upper - &self.lower)?;
        Ok(width.to_dtype(DType::F64)?.mean_all()?.to_scalar::<f64>()?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
