//! Tests for the REST remote store against a mock server.

mod common;

use common::{order, tenant};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tillsync_model::{TableRegistry, TableSpec};
use tillsync_sync::remote::{RestConfig, RestRemoteStore};
use tillsync_sync::transform::RemoteRow;
use tillsync_sync::{Profile, RemoteStore, SyncConfig, SyncEngine, SyncError};
use tillsync_types::UserId;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn spec(name: &str) -> TableSpec {
    *TableRegistry::standard().get(name).unwrap()
}

fn row(value: Value) -> RemoteRow {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn client(server: &MockServer) -> RestRemoteStore {
    RestRemoteStore::new(RestConfig {
        base_url: server.uri(),
        api_key: "anon-key".to_string(),
        access_token: None,
        timeout_secs: 5,
    })
    .unwrap()
}

// ── Upsert ───────────────────────────────────────────────────────

#[tokio::test]
async fn upsert_posts_batch_with_conflict_target() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/ingredients"))
        .and(query_param("on_conflict", "tenant_id,name"))
        .and(header("apikey", "anon-key"))
        .and(header("authorization", "Bearer anon-key"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let rows = vec![row(json!({ "id": 1, "tenant_id": "r1", "name": "Sal" }))];
    client(&server)
        .upsert(&tenant("r1"), &spec("ingredients"), rows.clone())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    assert_eq!(
        request.headers.get("prefer").and_then(|v| v.to_str().ok()),
        Some("resolution=merge-duplicates,return=minimal")
    );
    let body: Vec<RemoteRow> = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body, rows);
}

#[tokio::test]
async fn uneven_rows_send_the_union_of_columns() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/orders"))
        .and(query_param("columns", "deleted_at,id,note,tenant_id,total_amount"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let rows = vec![
        row(json!({ "id": 1, "tenant_id": "r1", "deleted_at": null, "total_amount": 5.0 })),
        row(json!({ "id": 2, "tenant_id": "r1", "deleted_at": null, "total_amount": 7.0, "note": "sin hielo" })),
    ];
    client(&server)
        .upsert(&tenant("r1"), &spec("orders"), rows)
        .await
        .unwrap();
}

#[tokio::test]
async fn access_token_replaces_api_key_as_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/orders"))
        .and(header("authorization", "Bearer user-jwt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    client.set_access_token(Some("user-jwt".to_string())).await;
    client
        .upsert(
            &tenant("r1"),
            &spec("orders"),
            vec![row(json!({ "id": 1, "tenant_id": "r1" }))],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_batch_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    client(&server)
        .upsert(&tenant("r1"), &spec("orders"), Vec::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn batch_with_foreign_row_is_refused_locally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server)
        .upsert(
            &tenant("r1"),
            &spec("orders"),
            vec![
                row(json!({ "id": 1, "tenant_id": "r1" })),
                row(json!({ "id": 2, "tenant_id": "r2" })),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TenantMismatch { id: 2, .. }));
}

#[tokio::test]
async fn rejection_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/products"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string(r#"{"message":"column \"stock_alert\" does not exist"}"#),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .upsert(
            &tenant("r1"),
            &spec("products"),
            vec![row(json!({ "id": 1, "tenant_id": "r1" }))],
        )
        .await
        .unwrap_err();

    match err {
        SyncError::Remote { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("stock_alert"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn service_unavailable_counts_as_connectivity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server)
        .upsert(
            &tenant("r1"),
            &spec("orders"),
            vec![row(json!({ "id": 1, "tenant_id": "r1" }))],
        )
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}

// ── Select ───────────────────────────────────────────────────────

#[tokio::test]
async fn select_filters_by_tenant_and_tombstone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/orders"))
        .and(query_param("select", "*"))
        .and(query_param("tenant_id", "eq.r1"))
        .and(query_param("deleted_at", "is.null"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 1, "tenant_id": "r1", "total_amount": 5.0 },
            { "id": 2, "tenant_id": "r2", "total_amount": 7.0 }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let rows = client(&server)
        .select_active(&tenant("r1"), &spec("orders"))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&json!(1)));
}

#[tokio::test]
async fn unreadable_body_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = client(&server)
        .select_active(&tenant("r1"), &spec("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
}

// ── Connectivity ─────────────────────────────────────────────────

#[tokio::test]
async fn unreachable_server_is_offline() {
    let client = RestRemoteStore::new(RestConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        timeout_secs: 2,
        ..RestConfig::default()
    })
    .unwrap();

    assert!(!client.is_online().await);
    let err = client
        .select_active(&tenant("r1"), &spec("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Offline(_)));
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn any_response_means_online() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    assert!(client(&server).is_online().await);
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    let client = RestRemoteStore::new(RestConfig {
        base_url: server.uri(),
        timeout_secs: 1,
        ..RestConfig::default()
    })
    .unwrap();

    let err = client
        .select_active(&tenant("r1"), &spec("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout));
}

// ── Profiles ─────────────────────────────────────────────────────

#[tokio::test]
async fn profile_roundtrip() {
    let server = MockServer::start().await;
    let user = UserId::new();
    Mock::given(method("GET"))
        .and(path("/rest/v1/profiles"))
        .and(query_param("id", format!("eq.{user}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "id": user.to_string(), "tenant_id": "r1" }])),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/profiles"))
        .and(query_param("on_conflict", "id"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let profile = client.fetch_profile(&user).await.unwrap();
    assert_eq!(
        profile,
        Some(Profile {
            id: user,
            tenant_id: Some(tenant("r1")),
        })
    );

    client
        .upsert_profile(&Profile {
            id: user,
            tenant_id: Some(tenant("r2")),
        })
        .await
        .unwrap();
    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(body, json!([{ "id": user.to_string(), "tenant_id": "r2" }]));
}

#[tokio::test]
async fn missing_profile_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/profiles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    assert_eq!(client(&server).fetch_profile(&UserId::new()).await.unwrap(), None);
}

// ── Through the engine ───────────────────────────────────────────

#[tokio::test]
async fn engine_pushes_renamed_columns_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/orders"))
        .and(query_param("on_conflict", "tenant_id,id"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let r1 = tenant("r1");
    let store = common::store();
    store.bind_tenant(&r1).unwrap();
    let engine = SyncEngine::new(store, Arc::new(client(&server)), SyncConfig::default());
    engine
        .save_record("orders", order(1, 18.0).with("uiState", "open"))
        .await
        .unwrap();

    let report = engine.push_table("orders").await.unwrap().unwrap();
    assert_eq!(report.pushed, 1);

    let requests = server.received_requests().await.unwrap();
    let body: Vec<RemoteRow> = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body[0].get("total_amount"), Some(&json!(18.0)));
    assert_eq!(body[0].get("tenant_id"), Some(&json!("r1")));
    assert!(!body[0].contains_key("ui_state"));
}
