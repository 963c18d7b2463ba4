// THEORY:
// Every failure the decision core can surface, grouped by where it originates.
// Configuration problems are caught once at load time; the per-pixel and
// per-line paths never produce errors of their own. Hardware trouble is kept
// apart from perception so that a lost fieldbus never stops the tracker.

use thiserror::Error;

/// Raised while loading or validating configuration and classifier models.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid classifier model: {0}")]
    Model(#[from] serde_json::Error),

    #[error("Band index {index} is outside the raw band range 0..{band_count}")]
    BandOutOfRange { index: usize, band_count: usize },

    #[error("Class {class} has {actual} weights, expected {expected} (one per feature)")]
    WeightLengthMismatch {
        class: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Model declares {weights} weight rows but {bias} bias terms")]
    BiasLengthMismatch { weights: usize, bias: usize },

    #[error("Raw sample has {actual} bands, pipeline was configured for {expected}")]
    BandCountMismatch { expected: usize, actual: usize },

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Raised by upstream line sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to decode line source image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Line buffer holds {actual} values, source produces {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Line source is empty")]
    Empty,
}

/// Raised by the downstream fieldbus master.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("Process data exchange failed: {0}")]
    Exchange(String),

    #[error("Module {module} channel {channel} does not exist")]
    UnknownOutput { module: usize, channel: usize },
}

/// Raised by the actuation scheduler when a request cannot be honoured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Channel {channel} is outside 1..={channel_count}")]
    ChannelOutOfRange { channel: u16, channel_count: u16 },

    #[error("Hardware is disconnected, firing is disabled")]
    Disconnected,

    #[error("Actuation scheduler has been shut down")]
    ShutDown,

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Raised when the live runner cannot bring a run to completion.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("{task} task failed: {reason}")]
    Task { task: &'static str, reason: String },
}
