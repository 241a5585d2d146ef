//! Embedded SQLite store for TillSync.
//!
//! Holds one table per registered entity table plus the device
//! configuration (tenant binding). Records are stored as their local JSON
//! form with the id, tenant and soft-delete marker mirrored into indexed
//! columns, so "all rows of this tenant" is a single indexed scan.
//!
//! # Architecture
//!
//! - Entity tables are created by versioned migrations (tracked in
//!   `PRAGMA user_version`) and topped up for tables added to the registry later
//! - Every operation is single-record or single-transaction atomic; nothing
//!   spans tables
//! - The store is `Clone` and cheap to share; all clones use one connection

mod error;
mod local_store;
mod migrations;

pub use error::{StorageError, StorageResult};
pub use local_store::LocalStore;
pub use migrations::LATEST_SCHEMA_VERSION;
