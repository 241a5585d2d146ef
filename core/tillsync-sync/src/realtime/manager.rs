use super::{ChangeEvent, ChannelState, ChannelStatus, RealtimeTransport};
use crate::config::RealtimeConfig;
use crate::engine::blocking;
use crate::error::SyncResult;
use crate::transform::to_local;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tillsync_model::TableSpec;
use tillsync_storage::LocalStore;
use tillsync_types::{LocalId, TenantId};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Result of a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeOutcome {
    /// A channel task was started.
    Started,
    /// The table already has a running channel.
    AlreadyActive,
    /// No tenant yet; the request is queued.
    Queued,
    /// The engine has no realtime transport.
    Disabled,
}

/// Effect of one event on the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted(LocalId),
    Removed(LocalId),
    /// Dropped: foreign tenant or unreadable row.
    Ignored,
}

#[derive(Debug, Clone)]
struct ChannelInfo {
    state: ChannelState,
    failures: u32,
    last_error: Option<String>,
}

impl ChannelInfo {
    fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            failures: 0,
            last_error: None,
        }
    }
}

type Channels = Arc<RwLock<BTreeMap<String, ChannelInfo>>>;

/// A running channel task and the tenant it filters on.
struct ActiveChannel {
    tenant: TenantId,
    spec: TableSpec,
    task: JoinHandle<()>,
}

/// Owns one reconnecting task per subscribed table.
pub struct RealtimeManager {
    transport: Arc<dyn RealtimeTransport>,
    store: LocalStore,
    config: RealtimeConfig,
    channels: Channels,
    pending: Mutex<BTreeMap<String, TableSpec>>,
    tasks: Mutex<BTreeMap<String, ActiveChannel>>,
}

impl RealtimeManager {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        store: LocalStore,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            channels: Arc::new(RwLock::new(BTreeMap::new())),
            pending: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts the channel for `spec`, or queues it when `tenant` is unknown.
    pub async fn subscribe(&self, tenant: Option<TenantId>, spec: TableSpec) -> SubscribeOutcome {
        let Some(tenant) = tenant else {
            debug!(table = spec.name, "no tenant yet, queueing subscription");
            self.pending.lock().await.insert(spec.name.to_string(), spec);
            self.channels
                .write()
                .await
                .entry(spec.name.to_string())
                .or_insert_with(ChannelInfo::new);
            return SubscribeOutcome::Queued;
        };

        let mut tasks = self.tasks.lock().await;
        if let Some(active) = tasks.remove(spec.name) {
            if !active.task.is_finished() && active.tenant == tenant {
                tasks.insert(spec.name.to_string(), active);
                return SubscribeOutcome::AlreadyActive;
            }
            if active.tenant != tenant {
                info!(
                    table = spec.name,
                    from = %active.tenant,
                    to = %tenant,
                    "tenant changed, restarting channel"
                );
            }
            active.task.abort();
        }
        self.pending.lock().await.remove(spec.name);
        self.channels
            .write()
            .await
            .insert(spec.name.to_string(), ChannelInfo::new());

        let task = tokio::spawn(run_channel(
            Arc::clone(&self.transport),
            self.store.clone(),
            self.config.clone(),
            Arc::clone(&self.channels),
            tenant.clone(),
            spec,
        ));
        tasks.insert(
            spec.name.to_string(),
            ActiveChannel { tenant, spec, task },
        );
        SubscribeOutcome::Started
    }

    /// Points every channel at `tenant`: channels filtering on another
    /// tenant are restarted and queued subscriptions are started.
    pub async fn rebind(&self, tenant: &TenantId) {
        let stale: Vec<TableSpec> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|active| active.tenant != *tenant)
            .map(|active| active.spec)
            .collect();
        let queued: Vec<TableSpec> = std::mem::take(&mut *self.pending.lock().await)
            .into_values()
            .collect();
        if stale.is_empty() && queued.is_empty() {
            return;
        }
        info!(
            restarted = stale.len(),
            queued = queued.len(),
            tenant = %tenant,
            "binding realtime channels to tenant"
        );
        for spec in stale.into_iter().chain(queued) {
            self.subscribe(Some(tenant.clone()), spec).await;
        }
    }

    /// Stops every channel.
    pub async fn shutdown(&self) {
        for (_, active) in std::mem::take(&mut *self.tasks.lock().await) {
            active.task.abort();
        }
        self.pending.lock().await.clear();
        for info in self.channels.write().await.values_mut() {
            info.state = ChannelState::Disconnected;
        }
    }

    pub async fn state(&self, table: &str) -> Option<ChannelState> {
        self.channels.read().await.get(table).map(|info| info.state)
    }

    pub async fn channels(&self) -> Vec<ChannelStatus> {
        let queued: BTreeSet<String> = self.pending.lock().await.keys().cloned().collect();
        self.channels
            .read()
            .await
            .iter()
            .map(|(table, info)| ChannelStatus {
                table: table.clone(),
                state: info.state,
                failures: info.failures,
                last_error: info.last_error.clone(),
                queued: queued.contains(table),
            })
            .collect()
    }
}

async fn set_state(channels: &Channels, table: &str, state: ChannelState, error: Option<String>) {
    let mut channels = channels.write().await;
    let info = channels
        .entry(table.to_string())
        .or_insert_with(ChannelInfo::new);
    match state {
        ChannelState::Connected => {
            info.failures = 0;
            info.last_error = None;
        }
        ChannelState::Error | ChannelState::TimedOut => {
            info.failures = info.failures.saturating_add(1);
            info.last_error = error;
        }
        ChannelState::Connecting | ChannelState::Disconnected => {}
    }
    if info.state != state {
        debug!(table, from = ?info.state, to = ?state, "channel state changed");
    }
    info.state = state;
}

async fn run_channel(
    transport: Arc<dyn RealtimeTransport>,
    store: LocalStore,
    config: RealtimeConfig,
    channels: Channels,
    tenant: TenantId,
    spec: TableSpec,
) {
    let table = spec.name;
    let mut failures: u32 = 0;

    loop {
        set_state(&channels, table, ChannelState::Connecting, None).await;
        match timeout(config.connect_timeout(), transport.subscribe(&tenant, &spec)).await {
            Ok(Ok(mut events)) => {
                set_state(&channels, table, ChannelState::Connected, None).await;
                info!(table, tenant = %tenant, "realtime channel connected");
                failures = 0;
                while let Some(event) = events.recv().await {
                    if let Err(e) = apply_event(&store, &spec, &tenant, event).await {
                        warn!(table, error = %e, "failed to apply realtime event");
                    }
                }
                info!(table, "realtime channel closed, reconnecting");
                set_state(&channels, table, ChannelState::Disconnected, None).await;
            }
            Ok(Err(e)) => {
                warn!(table, error = %e, failures, "realtime subscription failed");
                set_state(&channels, table, ChannelState::Error, Some(e.to_string())).await;
                failures = failures.saturating_add(1);
            }
            Err(_) => {
                warn!(table, failures, "realtime subscription timed out");
                set_state(
                    &channels,
                    table,
                    ChannelState::TimedOut,
                    Some("connect timed out".to_string()),
                )
                .await;
                failures = failures.saturating_add(1);
            }
        }

        let delay = config.backoff(failures.saturating_sub(1));
        debug!(table, ?delay, "waiting before reconnect");
        sleep(delay).await;
    }
}

/// Applies one change event to the local store.
///
/// Inserts and updates upsert the row; an update whose new image carries a
/// soft-delete marker removes the row, since the local table mirrors live
/// remote state. Rows of another tenant are dropped, as is every event once
/// the device is bound to a tenant other than `tenant`.
pub async fn apply_event(
    store: &LocalStore,
    spec: &TableSpec,
    tenant: &TenantId,
    event: ChangeEvent,
) -> SyncResult<ApplyOutcome> {
    let name = spec.name;
    let bound = blocking(store, |s| s.tenant()).await?;
    if bound.as_ref().is_some_and(|bound| bound != tenant) {
        warn!(table = name, channel = %tenant, "device rebound, dropping stale realtime event");
        return Ok(ApplyOutcome::Ignored);
    }
    match event {
        ChangeEvent::Insert { record } | ChangeEvent::Update { record } => {
            let record = to_local(spec, record)?;
            if !record.belongs_to(tenant) {
                warn!(table = name, id = record.id, "dropping realtime row of another tenant");
                return Ok(ApplyOutcome::Ignored);
            }
            let id = record.id;
            if record.is_deleted() {
                blocking(store, move |s| s.delete(name, id)).await?;
                debug!(table = name, id, "realtime soft delete applied");
                return Ok(ApplyOutcome::Removed(id));
            }
            blocking(store, move |s| s.put(name, &record)).await?;
            debug!(table = name, id, "realtime upsert applied");
            Ok(ApplyOutcome::Upserted(id))
        }
        ChangeEvent::Delete { old_record } => {
            let Some(id) = old_record.get("id").and_then(Value::as_i64) else {
                warn!(table = name, "realtime delete without id");
                return Ok(ApplyOutcome::Ignored);
            };
            // Old images may carry only the primary key.
            if let Some(owner) = old_record.get("tenant_id").and_then(Value::as_str) {
                if owner != tenant.as_str() {
                    warn!(table = name, id, "dropping realtime delete of another tenant");
                    return Ok(ApplyOutcome::Ignored);
                }
            }
            let scope = tenant.clone();
            let removed = blocking(store, move |s| {
                match s.get(name, id)? {
                    Some(local) if local.tenant_id.as_ref().is_some_and(|t| *t != scope) => {
                        Ok(false)
                    }
                    Some(_) => s.delete(name, id),
                    None => Ok(false),
                }
            })
            .await?;
            if removed {
                debug!(table = name, id, "realtime delete applied");
                Ok(ApplyOutcome::Removed(id))
            } else {
                Ok(ApplyOutcome::Ignored)
            }
        }
    }
}
