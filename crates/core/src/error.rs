//! Error types for the core domain

use thiserror::Error;

/// Core domain errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown search mode: {0} (expected vector, graph, hybrid or global)")]
    UnknownSearchMode(String),

    #[error("Unknown community algorithm: {0} (expected leiden or louvain)")]
    UnknownAlgorithm(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
