//! Sync engine: owns the local store, the remote store, the syncing guard,
//! the status channel and the realtime channel registry.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::handshake::HandshakeState;
use crate::realtime::{ChannelStatus, RealtimeManager, RealtimeTransport, SubscribeOutcome};
use crate::remote::RemoteStore;
use crate::scheduler::{self, SyncCommand};
use crate::tagger::TenantTagger;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tillsync_model::{EntityRecord, Record, TableRegistry, TableSpec};
use tillsync_storage::{LocalStore, StorageResult};
use tillsync_types::{LocalId, TenantId};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// User-visible sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Saving,
    Saved,
    Error,
    Offline,
}

/// The sync engine.
pub struct SyncEngine {
    pub(crate) store: LocalStore,
    pub(crate) registry: Arc<TableRegistry>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) config: SyncConfig,
    /// Set while a `push_all` or restore is in flight.
    syncing: AtomicBool,
    status: watch::Sender<SyncStatus>,
    pub(crate) handshake: RwLock<HandshakeState>,
    pub(crate) session_started: AtomicBool,
    /// Set when the startup restore was skipped or cut short by a
    /// connectivity failure.
    pub(crate) reconcile_pending: AtomicBool,
    /// Flipped to true on shutdown; background tasks watch it.
    pub(crate) stop: watch::Sender<bool>,
    realtime: Option<RealtimeManager>,
    commands: mpsc::UnboundedSender<SyncCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncCommand>>>,
}

impl SyncEngine {
    /// Creates an engine. The store is not touched until the session starts.
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let registry = store.registry().clone();
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        Self {
            store,
            registry,
            remote,
            config,
            syncing: AtomicBool::new(false),
            status,
            handshake: RwLock::new(HandshakeState::Idle),
            session_started: AtomicBool::new(false),
            reconcile_pending: AtomicBool::new(false),
            stop,
            realtime: None,
            commands,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    /// Enables realtime channels over the given transport.
    pub fn with_realtime(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.realtime = Some(RealtimeManager::new(
            transport,
            self.store.clone(),
            self.config.realtime.clone(),
        ));
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn spec(&self, table: &str) -> SyncResult<&TableSpec> {
        self.registry
            .get(table)
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))
    }

    /// Runs a store operation off the async runtime.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&LocalStore) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        blocking(&self.store, f).await
    }

    /// Bounds a remote call by the configured request timeout.
    pub(crate) async fn bounded<T>(
        &self,
        call: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        tokio::time::timeout(self.config.request_timeout(), call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    // ── Tenant binding ───────────────────────────────────────────

    /// Tenant bound to this device, if any.
    pub async fn tenant(&self) -> SyncResult<Option<TenantId>> {
        self.blocking(|store| store.tenant()).await
    }

    /// Binds the device to a tenant and moves realtime channels over to it.
    pub async fn bind_tenant(&self, tenant: &TenantId) -> SyncResult<()> {
        let bound = tenant.clone();
        self.blocking(move |store| store.bind_tenant(&bound)).await?;
        info!(tenant = %tenant, "device bound to tenant");
        self.retry_subscriptions().await;
        Ok(())
    }

    // ── Status ───────────────────────────────────────────────────

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Receiver observing every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_status(&self, status: SyncStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "sync status changed");
        }
    }

    /// Status after a failed run: offline for connectivity problems.
    pub(crate) fn set_failure_status(&self, error: &SyncError) {
        if error.is_connectivity() {
            self.set_status(SyncStatus::Offline);
        } else {
            self.set_status(SyncStatus::Error);
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Claims the syncing flag. Fails with `AlreadySyncing` if it is held.
    pub(crate) fn begin_sync(&self) -> SyncResult<SyncingGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadySyncing)?;
        Ok(SyncingGuard(&self.syncing))
    }

    // ── Local writes ─────────────────────────────────────────────

    /// Saves a typed entity: tags it, assigns an id when missing, persists it
    /// and queues a push.
    pub async fn save<T: EntityRecord>(&self, mut entity: T) -> SyncResult<T> {
        let spec = *self.spec(T::TABLE)?;
        if entity.id().is_none() {
            // Placeholder; `save_record` allocates the real id.
            entity.set_id(0);
        }
        let record = Record::from_entity(&spec, &entity)?;
        let saved = self.save_record(spec.name, record).await?;
        Ok(saved.to_entity()?)
    }

    /// Saves a record. Ids below 1 are replaced by the next free id.
    ///
    /// Without a bound tenant the record is stored untagged and claimed on
    /// the next push.
    pub async fn save_record(&self, table: &str, mut record: Record) -> SyncResult<Record> {
        let spec = *self.spec(table)?;
        if let Some(tenant) = self.tenant().await? {
            record = TenantTagger::new(tenant).tag(record)?;
        }
        let record = if record.id < 1 {
            self.blocking(move |store| store.insert_new(spec.name, record))
                .await?
        } else {
            let stored = record.clone();
            self.blocking(move |store| store.put(spec.name, &stored))
                .await?;
            record
        };
        debug!(table = spec.name, id = record.id, "saved record");
        self.trigger_change(spec.name);
        Ok(record)
    }

    /// Marks a record deleted. Returns false when it does not exist.
    pub async fn soft_delete(&self, table: &str, id: LocalId) -> SyncResult<bool> {
        let spec = *self.spec(table)?;
        let Some(mut record) = self
            .blocking(move |store| store.get(spec.name, id))
            .await?
        else {
            return Ok(false);
        };
        if record.is_deleted() {
            return Ok(true);
        }
        record.soft_delete(Utc::now());
        self.blocking(move |store| store.put(spec.name, &record))
            .await?;
        self.trigger_change(spec.name);
        Ok(true)
    }

    /// Reads a typed entity by id.
    pub async fn get<T: EntityRecord>(&self, id: LocalId) -> SyncResult<Option<T>> {
        let spec = *self.spec(T::TABLE)?;
        let record = self.blocking(move |store| store.get(spec.name, id)).await?;
        record.map(|r| r.to_entity().map_err(SyncError::from)).transpose()
    }

    /// Live entities of the active tenant.
    pub async fn list<T: EntityRecord>(&self) -> SyncResult<Vec<T>> {
        let spec = *self.spec(T::TABLE)?;
        let Some(tenant) = self.tenant().await? else {
            return Ok(Vec::new());
        };
        let records = self
            .blocking(move |store| store.live_for_tenant(spec.name, &tenant))
            .await?;
        records
            .iter()
            .map(|r| r.to_entity().map_err(SyncError::from))
            .collect()
    }

    // ── Scheduling ───────────────────────────────────────────────

    /// Queues a debounced push after a local mutation of `table`.
    pub fn trigger_change(&self, table: &str) {
        self.send_command(SyncCommand::Mutated(table.to_string()));
    }

    /// Queues a debounced push after connectivity came back.
    pub fn notify_connectivity_restored(&self) {
        self.send_command(SyncCommand::ConnectivityRestored);
    }

    pub(crate) fn send_command(&self, command: SyncCommand) {
        if self.commands.send(command).is_err() {
            debug!("scheduler stopped, command dropped");
        }
    }

    /// Starts the change scheduler. Can be called once per engine.
    pub async fn start_scheduler(self: &Arc<Self>) -> SyncResult<JoinHandle<()>> {
        let rx = self
            .command_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::Protocol("scheduler already started".to_string()))?;
        Ok(scheduler::spawn(Arc::clone(self), rx))
    }

    /// Stops the scheduler and the connectivity watch and closes every
    /// realtime channel.
    pub async fn shutdown(&self) {
        self.send_command(SyncCommand::Shutdown);
        self.stop.send_replace(true);
        if let Some(realtime) = &self.realtime {
            realtime.shutdown().await;
        }
    }

    // ── Realtime ─────────────────────────────────────────────────

    /// Opens the live channel for a table. Queued until a tenant is bound.
    pub async fn subscribe_to_table(&self, table: &str) -> SyncResult<SubscribeOutcome> {
        let spec = *self.spec(table)?;
        let Some(realtime) = &self.realtime else {
            return Ok(SubscribeOutcome::Disabled);
        };
        let tenant = self.tenant().await?;
        Ok(realtime.subscribe(tenant, spec).await)
    }

    /// Opens live channels for every registered table.
    pub async fn subscribe_all(&self) -> SyncResult<Vec<SubscribeOutcome>> {
        let mut outcomes = Vec::new();
        for name in self.registry.names() {
            outcomes.push(self.subscribe_to_table(name).await?);
        }
        Ok(outcomes)
    }

    /// Aligns realtime channels with the bound tenant: starts subscriptions
    /// queued while no tenant was bound and restarts channels still filtering
    /// on a previous tenant.
    pub async fn retry_subscriptions(&self) {
        let Some(realtime) = &self.realtime else {
            return;
        };
        match self.tenant().await {
            Ok(Some(tenant)) => realtime.rebind(&tenant).await,
            Ok(None) => debug!("no tenant yet, subscriptions stay queued"),
            Err(e) => debug!(error = %e, "could not read tenant for subscription retry"),
        }
    }

    /// State of every known realtime channel.
    pub async fn channels(&self) -> Vec<ChannelStatus> {
        match &self.realtime {
            Some(realtime) => realtime.channels().await,
            None => Vec::new(),
        }
    }
}

/// Clears the syncing flag when dropped.
pub(crate) struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs a store operation on the blocking pool.
pub(crate) async fn blocking<T, F>(store: &LocalStore, f: F) -> SyncResult<T>
where
    F: FnOnce(&LocalStore) -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
        .map_err(SyncError::from)
}
