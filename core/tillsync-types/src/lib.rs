//! Core type definitions for TillSync.
//!
//! This crate defines the small, table-agnostic types shared by every layer
//! of the sync engine:
//! - Tenant, local-record and user identifiers
//! - Natural-key normalization used for deduplication and reference repair
//!
//! Entity shapes and the table registry live in `tillsync-model`.

mod ids;
mod natural_key;

pub use ids::{LocalId, TenantId, UserId};
pub use natural_key::{NaturalKey, normalize_natural_key};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid tenant id: {0:?}")]
    InvalidTenant(String),
}
