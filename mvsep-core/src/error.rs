use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Top-level error type for the mvsep-core public API.
#[derive(Debug, Error)]
pub enum SeparationError {
    /// Audio input did not have exactly two channels.
    #[error("{}: expected 2 audio channels, found {found}", path.display())]
    ChannelCount { path: PathBuf, found: usize },

    /// Internal tensor or array shape invariant violated.
    #[error("shape error: {0}")]
    Shape(String),

    /// Invalid configuration, rejected before any work starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// FFT / STFT failure.
    #[error("DSP error: {0}")]
    Dsp(String),

    /// Tensor data conversion failure.
    #[error("tensor error: {0}")]
    Tensor(String),

    /// WAV decode or encode failure.
    #[error("audio error in {}: {reason}", path.display())]
    Audio { path: PathBuf, reason: String },

    /// Checkpoint format or load failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Malformed training data directory.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A data loader worker exited without delivering its sample.
    #[error("data loader worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeparationError {
    pub(crate) fn audio(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SeparationError::Audio {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias so callers can write `Result<T>` instead of `Result<T, SeparationError>`.
pub type Result<T> = std::result::Result<T, SeparationError>;
