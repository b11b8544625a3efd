use thiserror::Error;

use crate::data_io::{ReaderError, WriteError};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DincaeError>;

#[derive(Error, Debug)]
pub enum DincaeError {
    /// Grid dimensions of coordinates, data and masks disagree
    #[error("shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// No pixel of the batch carries a true observation
    #[error("loss undefined: batch has no observed target pixel")]
    UndefinedLoss,

    /// Training diverged: the loss of a batch is NaN or infinite
    #[error("non-finite loss {loss}: training diverged")]
    NonFiniteLoss { loss: f32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sample index {index} out of range for {len} timesteps")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("writer error: {0}")]
    Writer(#[from] WriteError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialisation error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DincaeError {
    pub(crate) fn shape(what: impl Into<String>, expected: &[usize], found: &[usize]) -> Self {
        DincaeError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}
