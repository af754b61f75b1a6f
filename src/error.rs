//! Error types for edge-lora.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for edge-lora operations.
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Errors that can occur in edge-lora operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EdgeError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backbone identifier is neither built in nor a readable model directory.
    #[error("unknown backbone: {model_id}")]
    UnknownBackbone {
        /// Identifier that failed to resolve
        model_id: String,
    },

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// Adapter not found.
    #[error("adapter not found: {name}")]
    AdapterNotFound {
        /// Name of the missing adapter
        name: String,
    },

    /// Adapter already exists.
    #[error("adapter already exists: {name}")]
    AdapterAlreadyExists {
        /// Name of the duplicate adapter
        name: String,
    },

    /// Operation is not allowed on the active adapter.
    #[error("adapter is active: {name}")]
    AdapterActive {
        /// Name of the active adapter
        name: String,
    },

    /// None of the target patterns matched a backbone layer.
    #[error("target modules {patterns:?} match no backbone layer")]
    NoMatchingLayers {
        /// Patterns that were tried
        patterns: Vec<String>,
    },

    /// `end_frame` was called without a preceding `start_frame`.
    #[error("end_frame called without a preceding start_frame")]
    FrameNotStarted,

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Image could not be read or decoded.
    #[error("failed to read image {}: {source}", path.display())]
    Image {
        /// Offending file
        path: PathBuf,
        /// Decoder error
        source: image::ImageError,
    },

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writer error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration source error.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
