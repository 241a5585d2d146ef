//! In-memory realtime transport for tests.

use super::{ChangeEvent, RealtimeTransport};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tillsync_model::TableSpec;
use tillsync_types::TenantId;
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    fail_next: usize,
    hang_next: usize,
    attempts: HashMap<String, usize>,
    open: HashMap<String, (TenantId, mpsc::Sender<ChangeEvent>)>,
}

/// Realtime transport whose channels are fed by the test.
#[derive(Clone, Default)]
pub struct MemoryRealtime {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `n` subscriptions fail immediately.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// The next `n` subscriptions never complete.
    pub fn hang_next(&self, n: usize) {
        self.lock().hang_next = n;
    }

    /// Subscription attempts made for a table.
    pub fn attempts(&self, table: &str) -> usize {
        self.lock().attempts.get(table).copied().unwrap_or(0)
    }

    /// Tenant of the open channel for a table.
    pub fn subscribed_tenant(&self, table: &str) -> Option<TenantId> {
        self.lock()
            .open
            .get(table)
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(tenant, _)| tenant.clone())
    }

    /// Delivers an event on the table's open channel. Returns false when no
    /// channel is open.
    pub async fn emit(&self, table: &str, event: ChangeEvent) -> bool {
        let sender = self.lock().open.get(table).map(|(_, tx)| tx.clone());
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Drops the table's channel, as a lost connection would.
    pub fn disconnect(&self, table: &str) {
        self.lock().open.remove(table);
    }
}

#[async_trait]
impl RealtimeTransport for MemoryRealtime {
    async fn subscribe(
        &self,
        tenant: &TenantId,
        spec: &TableSpec,
    ) -> SyncResult<mpsc::Receiver<ChangeEvent>> {
        let hang = {
            let mut inner = self.lock();
            *inner.attempts.entry(spec.name.to_string()).or_default() += 1;
            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                return Err(SyncError::Network("injected subscription failure".to_string()));
            }
            if inner.hang_next > 0 {
                inner.hang_next -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::channel(64);
        self.lock()
            .open
            .insert(spec.name.to_string(), (tenant.clone(), tx));
        Ok(rx)
    }
}
