//! In-memory remote store for tests and offline demos.
//!
//! Each table is shared by every tenant and keyed by the table's conflict
//! key, as on the server. Every row also remembers the tenant that wrote it;
//! reads only see those rows, the way row-level security filters them.

use super::{DELETED_AT_COLUMN, Profile, RemoteStore, check_scope};
use crate::error::{SyncError, SyncResult};
use crate::transform::RemoteRow;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tillsync_model::TableSpec;
use tillsync_types::{TenantId, UserId};

/// A stored row and the tenant allowed to see it.
struct StoredRow {
    visible_to: TenantId,
    row: RemoteRow,
}

#[derive(Default)]
struct Inner {
    offline: bool,
    tables: HashMap<String, BTreeMap<String, StoredRow>>,
    failures: HashMap<String, (u16, String)>,
    upsert_calls: HashMap<String, usize>,
    profiles: HashMap<UserId, Profile>,
}

/// A remote store held in memory.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulates losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.lock().offline = !online;
    }

    /// Makes every call touching `table` fail with the given status.
    pub fn fail_table(&self, table: &str, status: u16, message: &str) {
        self.lock()
            .failures
            .insert(table.to_string(), (status, message.to_string()));
    }

    pub fn clear_failure(&self, table: &str) {
        self.lock().failures.remove(table);
    }

    /// Number of upsert calls received for a table.
    pub fn upsert_calls(&self, table: &str) -> usize {
        self.lock().upsert_calls.get(table).copied().unwrap_or(0)
    }

    /// Every stored row of a table visible to `tenant`, soft-deleted rows
    /// included.
    pub fn rows(&self, tenant: &TenantId, table: &str) -> Vec<RemoteRow> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|stored| stored.visible_to == *tenant)
                    .map(|stored| stored.row.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of rows in a table across all tenants.
    pub fn total_rows(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Stores a row directly for `tenant`, bypassing scope checks (seeding
    /// test data).
    pub fn insert_row(&self, tenant: &TenantId, spec: &TableSpec, row: RemoteRow) {
        let key = conflict_value(spec, &row);
        self.lock()
            .tables
            .entry(spec.remote_table.to_string())
            .or_default()
            .insert(
                key,
                StoredRow {
                    visible_to: tenant.clone(),
                    row,
                },
            );
    }

    pub fn profile(&self, user: &UserId) -> Option<Profile> {
        self.lock().profiles.get(user).cloned()
    }

    pub fn put_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id, profile);
    }

    fn check(&self, table: &str) -> SyncResult<()> {
        let inner = self.lock();
        if inner.offline {
            return Err(SyncError::Offline("remote store unreachable".to_string()));
        }
        if let Some((status, message)) = inner.failures.get(table) {
            return Err(SyncError::Remote {
                status: *status,
                message: message.clone(),
            });
        }
        Ok(())
    }
}

fn conflict_value(spec: &TableSpec, row: &RemoteRow) -> String {
    spec.conflict_key
        .columns()
        .iter()
        .map(|col| row.get(*col).map(Value::to_string).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn is_online(&self) -> bool {
        !self.lock().offline
    }

    async fn upsert(
        &self,
        tenant: &TenantId,
        spec: &TableSpec,
        rows: Vec<RemoteRow>,
    ) -> SyncResult<()> {
        self.check(spec.remote_table)?;
        check_scope(tenant, &rows)?;

        let mut inner = self.lock();
        *inner
            .upsert_calls
            .entry(spec.remote_table.to_string())
            .or_default() += 1;
        let table = inner
            .tables
            .entry(spec.remote_table.to_string())
            .or_default();

        let keys: Vec<String> = rows.iter().map(|row| conflict_value(spec, row)).collect();
        if let Some(key) = keys
            .iter()
            .find(|key| table.get(*key).is_some_and(|stored| stored.visible_to != *tenant))
        {
            return Err(SyncError::Remote {
                status: 403,
                message: format!(
                    "new row violates row-level security policy for table \"{}\" ({key})",
                    spec.remote_table
                ),
            });
        }

        for (key, row) in keys.into_iter().zip(rows) {
            // merge-duplicates: incoming columns overwrite, others are kept
            table
                .entry(key)
                .or_insert_with(|| StoredRow {
                    visible_to: tenant.clone(),
                    row: RemoteRow::new(),
                })
                .row
                .extend(row);
        }
        Ok(())
    }

    async fn select_active(
        &self,
        tenant: &TenantId,
        spec: &TableSpec,
    ) -> SyncResult<Vec<RemoteRow>> {
        self.check(spec.remote_table)?;
        Ok(self
            .rows(tenant, spec.remote_table)
            .into_iter()
            .filter(|row| row.get(DELETED_AT_COLUMN).is_none_or(Value::is_null))
            .collect())
    }

    async fn fetch_profile(&self, user: &UserId) -> SyncResult<Option<Profile>> {
        self.check(super::PROFILES_TABLE)?;
        Ok(self.profile(user))
    }

    async fn upsert_profile(&self, profile: &Profile) -> SyncResult<()> {
        self.check(super::PROFILES_TABLE)?;
        self.put_profile(profile.clone());
        Ok(())
    }
}
