//! Tests for the WebSocket realtime transport against a local server.

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;
use tillsync_model::{TableRegistry, TableSpec};
use tillsync_sync::realtime::{
    ChangeEvent, RealtimeTransport, WebSocketRealtime, WebSocketRealtimeConfig, decode_change,
};
use tillsync_sync::SyncError;
use tillsync_types::TenantId;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn spec(name: &str) -> TableSpec {
    *TableRegistry::standard().get(name).unwrap()
}

fn config(port: u16) -> WebSocketRealtimeConfig {
    WebSocketRealtimeConfig {
        url: format!("ws://127.0.0.1:{port}"),
        api_key: "anon-key".to_string(),
        ..WebSocketRealtimeConfig::default()
    }
}

/// Accepts one connection, answers the join with `status` and, when the join
/// is accepted, sends `changes`. The join request is handed back.
async fn serve_once(status: &'static str, changes: Vec<Value>) -> (u16, oneshot::Receiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (joined_tx, joined_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let join = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(&text).unwrap(),
                Some(Ok(_)) => continue,
                _ => return,
            }
        };
        let topic = join["topic"].clone();
        let reply = json!({
            "topic": topic,
            "event": "phx_reply",
            "payload": { "status": status, "response": {} },
            "ref": join["ref"].clone(),
        });
        ws.send(Message::Text(reply.to_string())).await.unwrap();
        let _ = joined_tx.send(join);

        for change in changes {
            let message = json!({
                "topic": topic,
                "event": "postgres_changes",
                "payload": change,
                "ref": null,
            });
            ws.send(Message::Text(message.to_string())).await.unwrap();
        }
        // Hold the connection open until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });

    (port, joined_rx)
}

#[tokio::test]
async fn join_filters_by_tenant_and_streams_changes() {
    let insert = json!({
        "data": {
            "type": "INSERT",
            "table": "orders",
            "record": { "id": 7, "tenant_id": "r1", "total_amount": 12.0 }
        }
    });
    let (port, joined) = serve_once("ok", vec![insert]).await;
    let transport = WebSocketRealtime::new(config(port));
    let tenant = TenantId::new("r1").unwrap();

    let mut events = transport.subscribe(&tenant, &spec("orders")).await.unwrap();

    let join = joined.await.unwrap();
    assert_eq!(join["event"], "phx_join");
    assert_eq!(join["topic"], "realtime:orders:r1");
    let filter = &join["payload"]["config"]["postgres_changes"][0];
    assert_eq!(filter["table"], "orders");
    assert_eq!(filter["schema"], "public");
    assert_eq!(filter["filter"], "tenant_id=eq.r1");

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ChangeEvent::Insert { record } => assert_eq!(record.get("id"), Some(&json!(7))),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn rejected_join_is_a_protocol_error() {
    let (port, _joined) = serve_once("error", Vec::new()).await;
    let transport = WebSocketRealtime::new(config(port));

    let err = transport
        .subscribe(&TenantId::new("r1").unwrap(), &spec("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = WebSocketRealtime::new(config(port))
        .subscribe(&TenantId::new("r1").unwrap(), &spec("orders"))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}

// ── Payload decoding ─────────────────────────────────────────────

#[test]
fn decode_change_reads_each_kind() {
    let update = decode_change(&json!({
        "data": { "type": "UPDATE", "record": { "id": 1 }, "old_record": { "id": 1 } }
    }));
    assert!(matches!(update, Some(ChangeEvent::Update { .. })));

    let delete = decode_change(&json!({
        "data": { "type": "DELETE", "old_record": { "id": 42, "tenant_id": "r1" } }
    }));
    match delete {
        Some(ChangeEvent::Delete { old_record }) => {
            assert_eq!(old_record.get("id"), Some(&json!(42)));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn decode_change_rejects_malformed_payloads() {
    assert_eq!(decode_change(&json!({})), None);
    assert_eq!(decode_change(&json!({ "data": { "type": "TRUNCATE" } })), None);
    assert_eq!(decode_change(&json!({ "data": { "type": "INSERT" } })), None);
}
