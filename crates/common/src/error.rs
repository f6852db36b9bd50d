//! Typed configuration errors.

/// Raised when a configuration is rejected. Construction of any schedule
/// fails with one of these instead of producing a decreasing epsilon.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid epsilon schedule: {0}")]
    Schedule(String),

    #[error("invalid coefficient range for {name}: {reason}")]
    Coefficient { name: &'static str, reason: String },

    #[error("invalid learning-rate decay: {0}")]
    LrDecay(String),

    #[error("invalid dataset statistics: {0}")]
    Stats(String),

    #[error("invalid training config: {0}")]
    Training(String),

    #[error("unknown {kind} `{value}` (expected one of: {expected})")]
    UnknownVariant {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
