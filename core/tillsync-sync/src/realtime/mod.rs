//! Realtime change propagation.
//!
//! One channel per (tenant, table), filtered server-side to the tenant.
//! Events carry full row images and are applied to the local store as they
//! arrive.

mod manager;
pub mod memory;
mod websocket;

pub use manager::{ApplyOutcome, RealtimeManager, SubscribeOutcome, apply_event};
pub use websocket::{WebSocketRealtime, WebSocketRealtimeConfig, decode_change};

use crate::error::SyncResult;
use crate::transform::RemoteRow;
use async_trait::async_trait;
use serde::Serialize;
use tillsync_model::TableSpec;
use tillsync_types::TenantId;
use tokio::sync::mpsc;

/// A change to one remote row.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert { record: RemoteRow },
    Update { record: RemoteRow },
    Delete { old_record: RemoteRow },
}

/// Lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    TimedOut,
}

/// Snapshot of one channel for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub table: String,
    pub state: ChannelState,
    /// Consecutive failed connection attempts.
    pub failures: u32,
    pub last_error: Option<String>,
    /// Waiting for a tenant to be bound.
    pub queued: bool,
}

/// Transport delivering change events for one table.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens a channel. Resolves once the channel is joined; events then
    /// arrive on the receiver until the connection drops, which closes it.
    async fn subscribe(
        &self,
        tenant: &TenantId,
        spec: &TableSpec,
    ) -> SyncResult<mpsc::Receiver<ChangeEvent>>;
}
