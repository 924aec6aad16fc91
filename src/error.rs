//! Error types for the Hypnos memory lifecycle engine
//!
//! This module provides structured error definitions using thiserror. Oracle
//! failures live in [`crate::services::OracleError`] and are wrapped here so
//! callers can tell a transient oracle outage from a storage failure.

use crate::services::OracleError;
use thiserror::Error;

/// Main error type for Hypnos operations
#[derive(Error, Debug)]
pub enum HypnosError {
    /// Database operation failed (storage unavailable, constraint violation, ...)
    #[error("Database error: {0}")]
    Database(String),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Reasoning oracle failed or is not configured
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// Invalid memory ID format
    #[error("Invalid memory ID: {0}")]
    InvalidMemoryId(#[from] uuid::Error),

    /// Memory not found
    #[error("Memory not found: {0}")]
    MemoryNotFound(String),

    /// Think task not found
    #[error("Think task not found: {0}")]
    TaskNotFound(String),

    /// A conditional write lost against a concurrent writer
    #[error("Concurrency conflict on {id}: expected {expected}")]
    ConcurrencyConflict { id: String, expected: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid operation (e.g. overriding a deleted memory)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl HypnosError {
    /// True for the benign optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, HypnosError::ConcurrencyConflict { .. })
    }
}

/// Result type alias for Hypnos operations
pub type Result<T> = std::result::Result<T, HypnosError>;

impl From<libsql::Error> for HypnosError {
    fn from(err: libsql::Error) -> Self {
        HypnosError::Database(err.to_string())
    }
}

/// Convert anyhow::Error to HypnosError
impl From<anyhow::Error> for HypnosError {
    fn from(err: anyhow::Error) -> Self {
        HypnosError::Other(err.to_string())
    }
}
