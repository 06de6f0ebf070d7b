//! Typed failures for model assembly and pooling
//!
//! These are raised through `anyhow`, so callers that care about the kind of
//! failure can `downcast_ref::<ModelError>()`.

use thiserror::Error;

/// Model assembly errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("Unknown architecture '{0}' (not in model registry)")]
    UnknownArchitecture(String),

    #[error("Number of layers and dropout values do not match: {layers} layer widths need {expected} dropout values, got {dropouts}")]
    LayerMismatch {
        layers: usize,
        expected: usize,
        dropouts: usize,
    },

    #[error("Missing config key '{0}'")]
    MissingKey(String),

    #[error("Invalid value for config key '{key}': expected {expected}")]
    InvalidValue { key: String, expected: &'static str },

    #[error("Row {row} is entirely padding; pooling needs at least one token per row")]
    EmptySequence { row: usize },
}
