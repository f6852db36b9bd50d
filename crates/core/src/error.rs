use ctrain_common::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("batches_per_epoch must be > 0")]
    ZeroBatchesPerEpoch,

    #[error("cannot rewind the epsilon schedule from step {current} to step {requested}")]
    Rewind { current: usize, requested: usize },

    #[error(
        "scheduler state was recorded with {recorded} batches per epoch but the loader has {actual}"
    )]
    BatchesPerEpochMismatch { recorded: usize, actual: usize },

    #[error("input has {actual} channels, schedule expects {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("input must have at least 2 dimensions (batch, channel), got shape {0:?}")]
    InputRank(Vec<usize>),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
