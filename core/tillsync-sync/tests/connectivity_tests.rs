//! Tests for the connectivity watch and deferred reconciliation.

mod common;

use common::{order, tenant};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;
use tillsync_model::TableRegistry;
use tillsync_sync::remote::memory::MemoryRemoteStore;
use tillsync_sync::transform::RemoteRow;
use tillsync_sync::{SyncConfig, SyncStatus};
use tokio::time::{Instant, sleep, timeout};

fn quick_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 30,
        connectivity_check_ms: 20,
        ..SyncConfig::default()
    }
}

fn row(value: Value) -> RemoteRow {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn reconnect_pushes_offline_work_then_restores() {
    let remote = MemoryRemoteStore::new();
    remote.set_online(false);
    let r1 = tenant("r1");
    let store = common::store();
    store.bind_tenant(&r1).unwrap();
    let engine = common::engine_with(store, &remote, quick_config());
    let scheduler = engine.start_scheduler().await.unwrap();

    let report = engine.start_session().await.unwrap();
    assert!(report.degraded);
    assert!(report.restore.is_none());
    assert_eq!(engine.status(), SyncStatus::Offline);

    for id in 1..=5 {
        engine.save_record("orders", order(id, id as f64)).await.unwrap();
    }
    // Written by another device while this one was offline.
    let categories = *TableRegistry::standard().get("categories").unwrap();
    remote.insert_row(
        &r1,
        &categories,
        row(json!({ "id": 9, "tenant_id": "r1", "name": "Postres" })),
    );

    let watch = engine.start_connectivity_watch();
    sleep(Duration::from_millis(100)).await;
    assert!(remote.rows(&r1, "orders").is_empty());

    remote.set_online(true);
    assert!(eventually(|| remote.rows(&r1, "orders").len() == 5).await);
    assert!(eventually(|| engine.store().get("categories", 9).unwrap().is_some()).await);
    assert_eq!(engine.store().count("orders").unwrap(), 5);
    assert!(eventually(|| engine.status() != SyncStatus::Offline).await);

    engine.shutdown().await;
    timeout(Duration::from_secs(1), watch).await.unwrap().unwrap();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn deferred_push_resumes_without_new_mutations() {
    let remote = MemoryRemoteStore::new();
    let r1 = tenant("r1");
    let store = common::store();
    store.bind_tenant(&r1).unwrap();
    let engine = common::engine_with(store, &remote, quick_config());
    engine.start_session().await.unwrap();
    let scheduler = engine.start_scheduler().await.unwrap();
    let watch = engine.start_connectivity_watch();

    remote.set_online(false);
    engine.save_record("orders", order(1, 12.0)).await.unwrap();
    assert!(eventually(|| engine.status() == SyncStatus::Offline).await);
    assert!(remote.rows(&r1, "orders").is_empty());

    remote.set_online(true);
    assert!(eventually(|| remote.rows(&r1, "orders").len() == 1).await);
    assert!(eventually(|| engine.status() == SyncStatus::Saved).await);

    engine.shutdown().await;
    timeout(Duration::from_secs(1), watch).await.unwrap().unwrap();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn watch_marks_engine_offline_when_remote_disappears() {
    let remote = MemoryRemoteStore::new();
    let engine = common::bound_engine(&remote, &tenant("r1"));
    let watch = engine.start_connectivity_watch();

    remote.set_online(false);
    assert!(eventually(|| engine.status() == SyncStatus::Offline).await);

    engine.shutdown().await;
    timeout(Duration::from_secs(1), watch).await.unwrap().unwrap();
}

#[tokio::test]
async fn check_reflects_remote_reachability() {
    let remote = MemoryRemoteStore::new();
    let engine = common::engine(&remote);
    assert!(engine.check_remote().await);
    remote.set_online(false);
    assert!(!engine.check_remote().await);
}
