//! Error types for the sync layer.

use thiserror::Error;
use tillsync_model::ModelError;
use tillsync_storage::StorageError;
use tillsync_types::{LocalId, TenantId};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote store could not be reached.
    #[error("offline: {0}")]
    Offline(String),

    /// Network error on an established connection.
    #[error("network error: {0}")]
    Network(String),

    /// The remote store rejected the request.
    #[error("remote store returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// Pushing a table failed.
    #[error("push of `{table}` failed: {source}")]
    Push {
        table: String,
        #[source]
        source: Box<SyncError>,
    },

    /// Pulling a table failed.
    #[error("pull of `{table}` failed: {source}")]
    Pull {
        table: String,
        #[source]
        source: Box<SyncError>,
    },

    /// A record is owned by a different tenant than the active one.
    #[error("record {id} belongs to tenant {found}, expected {expected}")]
    TenantMismatch {
        id: LocalId,
        expected: TenantId,
        found: String,
    },

    /// The device's tenant binding could not be verified or repaired.
    #[error("tenant binding error: {0}")]
    TenantBinding(String),

    /// No tenant is bound to this device.
    #[error("no tenant bound to this device")]
    NoTenant,

    /// A full push is already running.
    #[error("a sync is already in progress")]
    AlreadySyncing,

    /// Local store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record could not be read.
    #[error("record error: {0}")]
    Model(#[from] ModelError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Table is not part of the registry.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Protocol error (unexpected message or reply).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn push(table: impl Into<String>, source: SyncError) -> Self {
        SyncError::Push {
            table: table.into(),
            source: Box::new(source),
        }
    }

    pub fn pull(table: impl Into<String>, source: SyncError) -> Self {
        SyncError::Pull {
            table: table.into(),
            source: Box::new(source),
        }
    }

    /// Whether the error means the remote side is unreachable. Such errors
    /// are deferred and retried, never treated as data problems.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Offline(_)
            | SyncError::Network(_)
            | SyncError::Timeout
            | SyncError::ChannelClosed => true,
            SyncError::Remote { status, .. } => matches!(status, 408 | 502 | 503 | 504),
            SyncError::Push { source, .. } | SyncError::Pull { source, .. } => {
                source.is_connectivity()
            }
            _ => false,
        }
    }

    /// HTTP status of the underlying remote rejection, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Remote { status, .. } => Some(*status),
            SyncError::Push { source, .. } | SyncError::Pull { source, .. } => {
                source.status_code()
            }
            _ => None,
        }
    }

    /// Table the error is attributed to, for push and pull failures.
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncError::Push { table, .. } | SyncError::Pull { table, .. } => Some(table),
            SyncError::UnknownTable(table) => Some(table),
            _ => None,
        }
    }
}
