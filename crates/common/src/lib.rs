//! # ctrain-common — Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`CertifiedTrainingConfig`]** — training, schedule and checkpoint knobs (serialised as JSON).
//! * **[`DatasetStats`]** — per-channel normalisation and clamp range of the inputs.
//! * **[`ConfigError`]** — what `validate()` reports when a knob is out of range.

pub mod config;
pub mod error;
pub mod stats;

pub use config::{
    CertifiedTrainingConfig, CoefficientRange, EpsScheduleConfig, LrDecayConfig, RampShape,
    ScheduleUnit,
};
pub use error::ConfigError;
pub use stats::DatasetStats;
