//! Tests for realtime channels and event application.

mod common;

use common::{order, tenant};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tillsync_model::{TableRegistry, TableSpec};
use tillsync_sync::realtime::memory::MemoryRealtime;
use tillsync_sync::realtime::{
    ApplyOutcome, ChangeEvent, ChannelState, RealtimeManager, SubscribeOutcome, apply_event,
};
use tillsync_sync::remote::memory::MemoryRemoteStore;
use tillsync_sync::transform::RemoteRow;
use tillsync_sync::{RealtimeConfig, SyncConfig, SyncEngine};
use tokio::time::{Instant, sleep};

fn spec(name: &str) -> TableSpec {
    *TableRegistry::standard().get(name).unwrap()
}

fn row(value: Value) -> RemoteRow {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn manager(transport: &MemoryRealtime) -> RealtimeManager {
    RealtimeManager::new(
        Arc::new(transport.clone()),
        common::store(),
        RealtimeConfig::default(),
    )
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

// ── Event application ────────────────────────────────────────────

#[tokio::test]
async fn insert_and_update_upsert_local_rows() {
    let store = common::store();
    let r1 = tenant("r1");
    let spec = spec("orders");

    let inserted = apply_event(
        &store,
        &spec,
        &r1,
        ChangeEvent::Insert {
            record: row(json!({ "id": 5, "tenant_id": "r1", "total_amount": 30.0 })),
        },
    )
    .await
    .unwrap();
    assert_eq!(inserted, ApplyOutcome::Upserted(5));

    apply_event(
        &store,
        &spec,
        &r1,
        ChangeEvent::Update {
            record: row(json!({ "id": 5, "tenant_id": "r1", "total_amount": 32.5 })),
        },
    )
    .await
    .unwrap();

    let local = store.get("orders", 5).unwrap().unwrap();
    assert_eq!(local.get("total"), Some(&json!(32.5)));
    assert_eq!(local.tenant_id, Some(r1));
}

#[tokio::test]
async fn update_with_tombstone_removes_local_row() {
    let store = common::store();
    let r1 = tenant("r1");
    store.put("orders", &order(8, 1.0).with_tenant(&r1)).unwrap();

    let outcome = apply_event(
        &store,
        &spec("orders"),
        &r1,
        ChangeEvent::Update {
            record: row(json!({ "id": 8, "tenant_id": "r1", "deleted_at": "2024-06-01T10:00:00Z" })),
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome, ApplyOutcome::Removed(8));
    assert!(store.get("orders", 8).unwrap().is_none());
}

#[tokio::test]
async fn foreign_events_are_ignored() {
    let store = common::store();
    let r1 = tenant("r1");
    store.put("orders", &order(3, 1.0).with_tenant(&r1)).unwrap();

    let insert = apply_event(
        &store,
        &spec("orders"),
        &r1,
        ChangeEvent::Insert {
            record: row(json!({ "id": 9, "tenant_id": "r2", "total_amount": 1.0 })),
        },
    )
    .await
    .unwrap();
    let delete = apply_event(
        &store,
        &spec("orders"),
        &r1,
        ChangeEvent::Delete {
            old_record: row(json!({ "id": 3, "tenant_id": "r2" })),
        },
    )
    .await
    .unwrap();

    assert_eq!(insert, ApplyOutcome::Ignored);
    assert_eq!(delete, ApplyOutcome::Ignored);
    assert!(store.get("orders", 9).unwrap().is_none());
    assert!(store.get("orders", 3).unwrap().is_some());
}

#[tokio::test]
async fn delete_with_key_only_image_removes_own_row() {
    let store = common::store();
    let r1 = tenant("r1");
    store.put("orders", &order(4, 1.0).with_tenant(&r1)).unwrap();
    store.put("orders", &order(6, 1.0).with_tenant(&tenant("r2"))).unwrap();

    let own = apply_event(
        &store,
        &spec("orders"),
        &r1,
        ChangeEvent::Delete {
            old_record: row(json!({ "id": 4 })),
        },
    )
    .await
    .unwrap();
    let other = apply_event(
        &store,
        &spec("orders"),
        &r1,
        ChangeEvent::Delete {
            old_record: row(json!({ "id": 6 })),
        },
    )
    .await
    .unwrap();

    assert_eq!(own, ApplyOutcome::Removed(4));
    assert_eq!(other, ApplyOutcome::Ignored);
    assert!(store.get("orders", 6).unwrap().is_some());
}

// ── Channel lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn remote_delete_reaches_local_store() {
    let remote = MemoryRemoteStore::new();
    let transport = MemoryRealtime::new();
    let r1 = tenant("r1");
    let store = common::store();
    store.bind_tenant(&r1).unwrap();
    store.put("orders", &order(42, 99.0).with_tenant(&r1)).unwrap();
    let engine = SyncEngine::new(store, Arc::new(remote), SyncConfig::default())
        .with_realtime(Arc::new(transport.clone()));

    let outcome = engine.subscribe_to_table("orders").await.unwrap();
    assert_eq!(outcome, SubscribeOutcome::Started);
    assert!(eventually(|| transport.subscribed_tenant("orders") == Some(r1.clone())).await);

    let delivered = transport
        .emit(
            "orders",
            ChangeEvent::Delete {
                old_record: row(json!({ "id": 42, "tenant_id": "r1" })),
            },
        )
        .await;
    assert!(delivered);
    assert!(eventually(|| engine.store().get("orders", 42).unwrap().is_none()).await);

    let channels = engine.channels().await;
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].state, ChannelState::Connected);
    engine.shutdown().await;
}

#[tokio::test]
async fn engine_without_transport_reports_disabled() {
    let remote = MemoryRemoteStore::new();
    let engine = common::bound_engine(&remote, &tenant("r1"));
    assert_eq!(
        engine.subscribe_to_table("orders").await.unwrap(),
        SubscribeOutcome::Disabled
    );
    assert!(engine.channels().await.is_empty());
}

#[tokio::test]
async fn second_subscription_is_already_active() {
    let transport = MemoryRealtime::new();
    let manager = manager(&transport);
    let r1 = tenant("r1");
    assert_eq!(
        manager.subscribe(Some(r1.clone()), spec("orders")).await,
        SubscribeOutcome::Started
    );
    assert_eq!(
        manager.subscribe(Some(r1), spec("orders")).await,
        SubscribeOutcome::AlreadyActive
    );
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_subscriptions_back_off_exponentially() {
    let transport = MemoryRealtime::new();
    transport.fail_next(2);
    let manager = manager(&transport);

    manager.subscribe(Some(tenant("r1")), spec("orders")).await;
    sleep(Duration::from_millis(1)).await;
    assert_eq!(transport.attempts("orders"), 1);
    assert_eq!(manager.state("orders").await, Some(ChannelState::Error));
    assert_eq!(manager.channels().await[0].failures, 1);

    // First retry after the base delay.
    sleep(Duration::from_millis(5_010)).await;
    assert_eq!(transport.attempts("orders"), 2);
    assert_eq!(manager.channels().await[0].failures, 2);

    // Second retry after twice the base delay.
    sleep(Duration::from_millis(9_900)).await;
    assert_eq!(transport.attempts("orders"), 2);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.attempts("orders"), 3);
    assert_eq!(manager.state("orders").await, Some(ChannelState::Connected));
    assert_eq!(manager.channels().await[0].failures, 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hanging_subscription_times_out() {
    let transport = MemoryRealtime::new();
    transport.hang_next(1);
    let manager = manager(&transport);

    manager.subscribe(Some(tenant("r1")), spec("orders")).await;
    sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.state("orders").await, Some(ChannelState::Connecting));

    sleep(Duration::from_millis(5_010)).await;
    assert_eq!(manager.state("orders").await, Some(ChannelState::TimedOut));
    let status = &manager.channels().await[0];
    assert_eq!(status.last_error.as_deref(), Some("connect timed out"));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.attempts("orders"), 2);
    assert_eq!(manager.state("orders").await, Some(ChannelState::Connected));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_channel_reconnects() {
    let transport = MemoryRealtime::new();
    let manager = manager(&transport);

    manager.subscribe(Some(tenant("r1")), spec("orders")).await;
    sleep(Duration::from_millis(1)).await;
    assert_eq!(manager.state("orders").await, Some(ChannelState::Connected));

    transport.disconnect("orders");
    sleep(Duration::from_millis(1)).await;
    assert_eq!(manager.state("orders").await, Some(ChannelState::Disconnected));

    sleep(Duration::from_millis(5_010)).await;
    assert_eq!(transport.attempts("orders"), 2);
    assert_eq!(manager.state("orders").await, Some(ChannelState::Connected));

    manager.shutdown().await;
}

#[tokio::test]
async fn subscriptions_wait_for_a_tenant() {
    let remote = MemoryRemoteStore::new();
    let transport = MemoryRealtime::new();
    let engine = SyncEngine::new(common::store(), Arc::new(remote), SyncConfig::default())
        .with_realtime(Arc::new(transport.clone()));

    let outcomes = engine.subscribe_all().await.unwrap();
    assert!(outcomes.iter().all(|o| *o == SubscribeOutcome::Queued));
    let channels = engine.channels().await;
    assert!(channels.iter().all(|c| c.queued));
    assert_eq!(transport.attempts("orders"), 0);

    let r1 = tenant("r1");
    engine.bind_tenant(&r1).await.unwrap();

    assert!(eventually(|| transport.subscribed_tenant("orders") == Some(r1.clone())).await);
    assert!(engine.channels().await.iter().all(|c| !c.queued));
    engine.shutdown().await;
}

#[tokio::test]
async fn events_for_a_previous_tenant_are_dropped() {
    let store = common::store();
    store.bind_tenant(&tenant("r2")).unwrap();

    let outcome = apply_event(
        &store,
        &spec("orders"),
        &tenant("r1"),
        ChangeEvent::Insert {
            record: row(json!({ "id": 77, "tenant_id": "r1", "total_amount": 4.0 })),
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome, ApplyOutcome::Ignored);
    assert!(store.get("orders", 77).unwrap().is_none());
}

#[tokio::test]
async fn rebinding_moves_channels_to_the_new_tenant() {
    let remote = MemoryRemoteStore::new();
    let transport = MemoryRealtime::new();
    let r1 = tenant("r1");
    let r2 = tenant("r2");
    let store = common::store();
    store.bind_tenant(&r1).unwrap();
    let engine = SyncEngine::new(store, Arc::new(remote), SyncConfig::default())
        .with_realtime(Arc::new(transport.clone()));

    engine.subscribe_to_table("orders").await.unwrap();
    assert!(eventually(|| transport.subscribed_tenant("orders") == Some(r1.clone())).await);

    engine.bind_tenant(&r2).await.unwrap();
    assert!(eventually(|| transport.subscribed_tenant("orders") == Some(r2.clone())).await);
    assert_eq!(transport.attempts("orders"), 2);

    transport
        .emit(
            "orders",
            ChangeEvent::Insert {
                record: row(json!({ "id": 77, "tenant_id": "r1", "total_amount": 4.0 })),
            },
        )
        .await;
    transport
        .emit(
            "orders",
            ChangeEvent::Insert {
                record: row(json!({ "id": 78, "tenant_id": "r2", "total_amount": 6.0 })),
            },
        )
        .await;

    assert!(eventually(|| engine.store().get("orders", 78).unwrap().is_some()).await);
    assert!(engine.store().get("orders", 77).unwrap().is_none());
    assert_eq!(
        engine.subscribe_to_table("orders").await.unwrap(),
        SubscribeOutcome::AlreadyActive
    );
    engine.shutdown().await;
}
