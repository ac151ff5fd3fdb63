//! Engine error types

use graphkb_core::CoreError;
use graphkb_db::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid setup or request; never retried
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Gateway answered, but not with something usable
    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Graph query error: {0}")]
    GraphQuery(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }

    /// Store or gateway could not be reached
    pub fn is_connectivity(&self) -> bool {
        match self {
            EngineError::Http(_) => true,
            EngineError::Database(e) => e.is_connectivity(),
            _ => false,
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownSearchMode(_) | CoreError::UnknownAlgorithm(_) => {
                EngineError::Configuration(err.to_string())
            }
            other => EngineError::Parse(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
