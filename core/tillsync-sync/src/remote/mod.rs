//! Remote store abstraction.
//!
//! The remote side is a multi-tenant relational store. Every read and write
//! is scoped to one tenant; implementations must enforce that at the query
//! layer rather than trusting callers.

pub mod memory;
mod rest;

pub use rest::{RestConfig, RestRemoteStore};

use crate::error::{SyncError, SyncResult};
use crate::transform::RemoteRow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tillsync_model::TableSpec;
use tillsync_types::{TenantId, UserId};

/// Remote column holding the owning tenant.
pub const TENANT_COLUMN: &str = "tenant_id";
/// Remote column holding the soft-delete marker.
pub const DELETED_AT_COLUMN: &str = "deleted_at";
/// Remote table holding identity profiles.
pub const PROFILES_TABLE: &str = "profiles";

/// Server-side record of an authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

/// Abstract remote store interface.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the name of the remote provider.
    fn provider_name(&self) -> &'static str;

    /// Whether the remote store is currently reachable.
    async fn is_online(&self) -> bool;

    /// Inserts or replaces `rows` in the table, resolving conflicts on the
    /// table's conflict key. Every row must belong to `tenant`.
    async fn upsert(&self, tenant: &TenantId, spec: &TableSpec, rows: Vec<RemoteRow>)
    -> SyncResult<()>;

    /// Every row of the tenant whose soft-delete marker is unset.
    async fn select_active(&self, tenant: &TenantId, spec: &TableSpec)
    -> SyncResult<Vec<RemoteRow>>;

    /// Profile of an identity, if one exists.
    async fn fetch_profile(&self, user: &UserId) -> SyncResult<Option<Profile>>;

    /// Creates or replaces a profile.
    async fn upsert_profile(&self, profile: &Profile) -> SyncResult<()>;
}

/// Refuses a batch containing any row not owned by `tenant`.
pub(crate) fn check_scope(tenant: &TenantId, rows: &[RemoteRow]) -> SyncResult<()> {
    for row in rows {
        let owner = row.get(TENANT_COLUMN).and_then(Value::as_str);
        if owner != Some(tenant.as_str()) {
            return Err(SyncError::TenantMismatch {
                id: row.get("id").and_then(Value::as_i64).unwrap_or_default(),
                expected: tenant.clone(),
                found: owner.unwrap_or("<none>").to_string(),
            });
        }
    }
    Ok(())
}

/// Whether a row belongs to `tenant`.
pub(crate) fn owned_by(row: &RemoteRow, tenant: &TenantId) -> bool {
    row.get(TENANT_COLUMN).and_then(Value::as_str) == Some(tenant.as_str())
}
