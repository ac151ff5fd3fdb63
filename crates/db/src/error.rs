//! Database error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Record not found: {0} with id {1}")]
    NotFound(String, String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Schema initialization failed: {0}")]
    SchemaInit(String),

    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),
}

impl DbError {
    /// Whether the backend could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(self, DbError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
