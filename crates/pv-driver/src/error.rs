//! Driver error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no audio output device found")]
    NoDevice,

    #[error("failed to get device config: {0}")]
    ConfigError(String),

    #[error("failed to build stream: {0}")]
    StreamBuildError(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("playback already started")]
    AlreadyStarted,

    #[error("driver not initialized")]
    NotInitialized,
}

pub type DriverResult<T> = Result<T, DriverError>;
