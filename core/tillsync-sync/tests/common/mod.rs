//! Shared fixtures for the sync integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use tillsync_model::{Record, TableRegistry};
use tillsync_storage::LocalStore;
use tillsync_sync::remote::memory::MemoryRemoteStore;
use tillsync_sync::{SyncConfig, SyncEngine};
use tillsync_types::TenantId;

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

pub fn registry() -> Arc<TableRegistry> {
    Arc::new(TableRegistry::standard())
}

/// A migrated in-memory store.
pub fn store() -> LocalStore {
    let store = LocalStore::open_in_memory(registry()).unwrap();
    store.migrate().unwrap();
    store
}

pub fn engine_with(store: LocalStore, remote: &MemoryRemoteStore, config: SyncConfig) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(store, Arc::new(remote.clone()), config))
}

/// Engine over a fresh store with no tenant bound.
pub fn engine(remote: &MemoryRemoteStore) -> Arc<SyncEngine> {
    engine_with(store(), remote, SyncConfig::default())
}

/// Engine over a fresh store bound to `tenant`.
pub fn bound_engine(remote: &MemoryRemoteStore, tenant: &TenantId) -> Arc<SyncEngine> {
    let store = store();
    store.bind_tenant(tenant).unwrap();
    engine_with(store, remote, SyncConfig::default())
}

pub fn category(id: i64, name: &str) -> Record {
    Record::new(id).with("name", name)
}

pub fn product(id: i64, name: &str, category_id: i64) -> Record {
    Record::new(id)
        .with("name", name)
        .with("categoryId", category_id)
        .with("price", 10.0)
}

pub fn order(id: i64, total: f64) -> Record {
    Record::new(id).with("total", total).with("status", "paid")
}
