use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by training, attacks and evaluation. None of them are retried.
#[derive(Debug, Error)]
pub enum StarganError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("missing checkpoint {}", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("non-finite value for {tag} at iteration {iteration}: {value}")]
    NumericDivergence {
        tag: String,
        iteration: usize,
        value: f64,
    },

    #[error("data source yielded no batch after restart")]
    EmptyDataSource,

    #[error("failed to read tensor data: {0}")]
    TensorData(String),

    #[error("failed to decode dataset entry {}: {reason}", path.display())]
    Dataset { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("checkpoint recorder failed: {0}")]
    Recorder(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = StarganError> = std::result::Result<T, E>;

impl StarganError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::ShapeMismatch(message.into())
    }
}

impl From<burn::tensor::DataError> for StarganError {
    fn from(err: burn::tensor::DataError) -> Self {
        Self::TensorData(format!("{err:?}"))
    }
}

impl From<burn::record::RecorderError> for StarganError {
    fn from(err: burn::record::RecorderError) -> Self {
        Self::Recorder(format!("{err:?}"))
    }
}
