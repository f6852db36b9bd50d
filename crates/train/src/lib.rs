//! # ctrain-train — The Training Driver
//!
//! Epoch/batch loop, learning-rate decay and checkpointing for certified
//! training:
//!
//! * **[`Trainer`]** — owns the epsilon and LR schedules. [`Trainer::fit`]
//!   calls a [`CertifiedStep`] once per batch with the current epsilon,
//!   kappa, beta and learning rate, and checkpoints every `save_every` epochs.
//! * **[`LrScheduler`]** — multi-step decay at 1-based epoch or batch milestones.
//! * **[`TrainingCheckpoint`]** — JSON schedule state plus optional safetensors
//!   parameters; resuming at epoch N reproduces the schedule of an
//!   uninterrupted run at epoch N.

pub mod checkpoint;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{ResumeError, TrainingCheckpoint};
pub use scheduler::LrScheduler;
pub use trainer::{CertifiedStep, EpochMetrics, StepContext, StepOutcome, Trainer, TrainingSummary};
