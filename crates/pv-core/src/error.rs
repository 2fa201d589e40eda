//! Mixer error taxonomy

use thiserror::Error;

/// Errors surfaced by the control API and lifecycle operations.
///
/// Detailed codes are the variants themselves; their `Display` strings are
/// the user-visible error table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MixerError {
    #[error("mixer not installed")]
    NotInstalled,

    #[error("sound driver failure: {0}")]
    Driver(String),

    #[error("no free voices available")]
    NoVoices,

    #[error("no voice with matching handle found")]
    VoiceNotFound,

    #[error("invalid or unreadable sound data")]
    InvalidFile,
}

pub type MixerResult<T> = Result<T, MixerError>;
