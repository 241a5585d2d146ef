//! Realtime over a Phoenix-channel WebSocket.
//!
//! Protocol: join `realtime:{table}:{tenant}` with a `postgres_changes`
//! filter on the tenant column, wait for the join reply, then receive
//! `postgres_changes` messages while sending a heartbeat periodically.

use super::{ChangeEvent, RealtimeTransport};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tillsync_model::TableSpec;
use tillsync_types::TenantId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Realtime endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketRealtimeConfig {
    /// Base URL of the realtime service (`ws://` or `wss://`).
    pub url: String,
    pub api_key: String,
    /// User access token forwarded on join.
    pub access_token: Option<String>,
    /// Database schema the tables live in.
    pub schema: String,
    pub heartbeat_secs: u64,
}

impl Default for WebSocketRealtimeConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:54321".to_string(),
            api_key: String::new(),
            access_token: None,
            schema: "public".to_string(),
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

/// Realtime transport speaking the Phoenix channel protocol.
pub struct WebSocketRealtime {
    config: WebSocketRealtimeConfig,
    next_ref: AtomicU64,
}

impl WebSocketRealtime {
    pub fn new(config: WebSocketRealtimeConfig) -> Self {
        Self {
            config,
            next_ref: AtomicU64::new(1),
        }
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.config.url.trim_end_matches('/'),
            self.config.api_key
        )
    }

    fn join_payload(&self, tenant: &TenantId, spec: &TableSpec) -> Value {
        json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": self.config.schema,
                    "table": spec.remote_table,
                    "filter": format!("tenant_id=eq.{tenant}"),
                }],
            },
            "access_token": self.config.access_token.as_deref().unwrap_or(&self.config.api_key),
        })
    }
}

/// Topic of the channel carrying one tenant's changes to one table.
fn topic(tenant: &TenantId, spec: &TableSpec) -> String {
    format!("realtime:{}:{}", spec.remote_table, tenant)
}

/// Decodes the payload of a `postgres_changes` message.
pub fn decode_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)?;
    let image = |key: &str| data.get(key).and_then(Value::as_object).cloned();
    match kind {
        "INSERT" => Some(ChangeEvent::Insert {
            record: image("record")?,
        }),
        "UPDATE" => Some(ChangeEvent::Update {
            record: image("record")?,
        }),
        "DELETE" => Some(ChangeEvent::Delete {
            old_record: image("old_record")?,
        }),
        _ => None,
    }
}

fn encode(message: &PhoenixMessage) -> SyncResult<Message> {
    Ok(Message::Text(serde_json::to_string(message)?))
}

#[async_trait]
impl RealtimeTransport for WebSocketRealtime {
    async fn subscribe(
        &self,
        tenant: &TenantId,
        spec: &TableSpec,
    ) -> SyncResult<mpsc::Receiver<ChangeEvent>> {
        let (ws, _) = connect_async(self.endpoint())
            .await
            .map_err(|e| SyncError::Network(format!("realtime connect failed: {e}")))?;
        let (mut write, mut read) = ws.split();

        let topic = topic(tenant, spec);
        let join_ref = self.next_ref();
        let join = PhoenixMessage {
            topic: topic.clone(),
            event: "phx_join".to_string(),
            payload: self.join_payload(tenant, spec),
            reference: Some(join_ref.clone()),
        };
        write
            .send(encode(&join)?)
            .await
            .map_err(|e| SyncError::Network(format!("failed to send join: {e}")))?;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let reply: PhoenixMessage = serde_json::from_str(&text)?;
                    if reply.event != "phx_reply" || reply.reference.as_deref() != Some(&join_ref)
                    {
                        continue;
                    }
                    let status = reply.payload.get("status").and_then(Value::as_str);
                    if status != Some("ok") {
                        return Err(SyncError::Protocol(format!(
                            "join of {topic} rejected: {}",
                            reply.payload
                        )));
                    }
                    break;
                }
                Some(Ok(Message::Close(_))) | None => return Err(SyncError::ChannelClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(SyncError::Network(format!("realtime read failed: {e}")));
                }
            }
        }
        debug!(topic = %topic, "joined realtime channel");

        let (tx, rx) = mpsc::channel(256);
        let heartbeat = Duration::from_secs(self.config.heartbeat_secs.max(1));
        tokio::spawn(pump(write, read, tx, topic, heartbeat));
        Ok(rx)
    }
}

async fn pump(
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    events: mpsc::Sender<ChangeEvent>,
    topic: String,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut next_ref: u64 = 1;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                next_ref += 1;
                let beat = PhoenixMessage {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    reference: Some(format!("hb-{next_ref}")),
                };
                let sent = match encode(&beat) {
                    Ok(frame) => write.send(frame).await.is_ok(),
                    Err(_) => false,
                };
                if !sent {
                    warn!(topic = %topic, "heartbeat failed, closing channel");
                    break;
                }
            }
            () = events.closed() => {
                let _ = write.close().await;
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: PhoenixMessage = match serde_json::from_str(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "unreadable realtime frame");
                            continue;
                        }
                    };
                    if message.topic != topic {
                        continue;
                    }
                    match message.event.as_str() {
                        "postgres_changes" => {
                            if let Some(event) = decode_change(&message.payload) {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        "phx_error" | "phx_close" => {
                            warn!(topic = %topic, event = %message.event, "channel closed by server");
                            break;
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(topic = %topic, error = %e, "realtime connection error");
                    break;
                }
            },
        }
    }
    debug!(topic = %topic, "realtime pump stopped");
}
