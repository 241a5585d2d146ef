//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be read as a record.
    #[error("invalid record: {0}")]
    Model(#[from] tillsync_model::ModelError),

    /// Table is not part of the registry.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}
