//! Entity model for TillSync.
//!
//! Defines the types every sync component agrees on:
//! - [`Record`]: one row of an entity table in local (camelCase) form
//! - [`TableSpec`]: the declarative per-table sync configuration: remote
//!   name, conflict key, denylisted/renamed/date fields, natural key and
//!   foreign keys
//! - [`TableRegistry`]: the ordered set of table specs (parents first)
//! - [`EntityRecord`]: implemented by the typed entity structs that callers
//!   read and write (`Category`, `Product`, `Order`, ...)
//!
//! The sync pipelines only ever see `Record`s and `TableSpec`s; the typed
//! structs are the validated boundary for UI-layer callers.

mod entities;
mod record;
mod schema;

pub use entities::{
    Category, Customer, Employee, EntityRecord, Ingredient, Order, OrderItem, PayrollEntry,
    Product, ProductIngredient,
};
pub use record::{
    DELETED_AT_FIELD, ID_FIELD, Record, TENANT_FIELD, format_timestamp, parse_timestamp,
};
pub use schema::{ConflictKey, ForeignKey, TableRegistry, TableSpec};

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised when a value cannot be read as a record.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no integer `id`")]
    MissingId,

    #[error("invalid tenant id: {0}")]
    InvalidTenant(#[from] tillsync_types::Error),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("table `{child}` depends on `{parent}`, which is not registered before it")]
    DependencyOrder { child: String, parent: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
