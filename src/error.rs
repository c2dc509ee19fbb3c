//! Error types for bert-adapters.

use thiserror::Error;

/// Result type alias for bert-adapters operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors that can occur while setting up or running adapters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdapterError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Adapter not found.
    #[error("adapter not found: {name}")]
    AdapterNotFound {
        /// Name of the missing adapter
        name: String,
    },

    /// Adapter already exists.
    #[error("adapter already exists: {name}")]
    AdapterExists {
        /// Name of the duplicate adapter
        name: String,
    },

    /// A sub-module required by the layer configuration is absent.
    #[error("missing module: {0}")]
    MissingModule(String),

    /// The active composition cannot be applied at this location.
    #[error("unsupported composition at {location}: {message}")]
    UnsupportedComposition {
        /// Where the composition was rejected
        location: String,
        /// Descriptive message
        message: String,
    },

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Filesystem or serialization error.
    #[error("io error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
