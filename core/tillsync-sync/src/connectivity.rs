//! Connectivity watch.
//!
//! Checks the remote store on a fixed period. On the unreachable to
//! reachable edge the engine reconciles whatever was deferred while offline
//! and queues a push of pending local changes.

use crate::engine::{SyncEngine, SyncStatus};
use crate::error::{SyncError, SyncResult};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

impl SyncEngine {
    /// Whether the remote store answers within the request timeout.
    pub async fn check_remote(&self) -> bool {
        timeout(self.config.request_timeout(), self.remote.is_online())
            .await
            .unwrap_or(false)
    }

    /// Starts the periodic reachability check. Runs until
    /// [`SyncEngine::shutdown`].
    pub fn start_connectivity_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let period = engine.config.connectivity_check();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reachable = engine.status() != SyncStatus::Offline;
            debug!(?period, "connectivity watch started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }

                // A failed run can mark the engine offline between checks.
                let was_reachable = reachable && engine.status() != SyncStatus::Offline;
                reachable = engine.check_remote().await;
                if reachable && !was_reachable {
                    engine.connectivity_restored().await;
                } else if reachable && engine.reconcile_pending.load(Ordering::Acquire) {
                    engine.run_deferred_reconcile().await;
                } else if !reachable && was_reachable {
                    warn!("remote store unreachable");
                    engine.set_status(SyncStatus::Offline);
                }
            }
            debug!("connectivity watch stopped");
        })
    }

    /// Handles the remote store becoming reachable: runs a reconciliation
    /// deferred at startup, then queues a debounced push of pending changes.
    pub async fn connectivity_restored(&self) {
        info!("remote store reachable");
        if self.status() == SyncStatus::Offline {
            self.set_status(SyncStatus::Idle);
        }
        self.run_deferred_reconcile().await;
        self.notify_connectivity_restored();
    }

    async fn run_deferred_reconcile(&self) {
        if !self.reconcile_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "deferred reconciliation failed");
            if e.is_connectivity() || matches!(e, SyncError::AlreadySyncing) {
                self.reconcile_pending.store(true, Ordering::Release);
            }
        }
    }

    /// Pushes first so changes made offline reach the remote store before
    /// the restore replaces local tables.
    async fn reconcile(&self) -> SyncResult<()> {
        if !self.is_ready().await {
            debug!("session not ready, reconciliation stays deferred");
            self.reconcile_pending.store(true, Ordering::Release);
            return Ok(());
        }
        self.push_all().await?;
        self.restore_from_cloud().await?;
        info!("deferred reconciliation complete");
        Ok(())
    }
}
