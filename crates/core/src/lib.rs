//! # ctrain-core — The Schedule Engine
//!
//! Everything that decides *how hard* a certified-training step is lives here:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ramp`] | Linear and smoothed epsilon curves over a batch clock |
//! | [`eps`] | `EpsScheduler`: warm-up, ramp, kappa/beta, phase, resume |
//! | [`perturbation`] | L∞ input box `[x - eps, x + eps]` clamped to the data range |
//!
//! ## Invariants
//!
//! 1. **Monotone.** Epsilon never decreases as the clock advances, and the
//!    clock itself only moves forward.
//! 2. **Stateless in the clock.** Every value is a pure function of the batch
//!    index, so a run resumed at epoch N sees exactly what an uninterrupted
//!    run saw at epoch N.

pub mod eps;
pub mod error;
pub mod perturbation;
pub mod ramp;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use eps::{EpsScheduler, SchedulePhase, SchedulerState};
pub use error::ScheduleError;
pub use perturbation::{eps_tensor, PerturbationBox};
pub use ramp::Ramp;
