//! Error taxonomy shared across the crate.
//!
//! Missing cache artifacts are not errors: they only trigger recomputation of the
//! stage that owns them. Everything below is fatal and never retried.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NNIFError {
    /// Unknown attack identifier, malformed config file, impossible parameters.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkpoint not found: {0}")]
    MissingCheckpoint(String),

    /// A persisted record disagrees with a recomputed one, or an invariant over
    /// cached data is broken.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Non-finite values where a finite quantity is required.
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("model evaluation failed: {0}")]
    Model(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NNIFError>;

impl NNIFError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }
}
