//! Startup handshake.
//!
//! `idle -> migrating -> pulling -> ready`. A failure in `migrating` or
//! `pulling` passes through `error` and still ends in `ready`, in degraded
//! mode: the device keeps working locally and reconciles once the remote side
//! is reachable again (see [`SyncEngine::connectivity_restored`]). The handshake runs at most once per engine.

use crate::engine::{SyncEngine, SyncStatus};
use crate::pull::RestoreReport;
use crate::scheduler::SyncCommand;
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Idle,
    Migrating,
    Pulling,
    Ready,
    Error,
}

/// What the handshake did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeReport {
    /// Every state entered, in order.
    pub transitions: Vec<HandshakeState>,
    pub migrations_applied: usize,
    /// Present when the restore ran to completion.
    pub restore: Option<RestoreReport>,
    /// The device is ready but not in sync with the remote store.
    pub degraded: bool,
    pub error: Option<String>,
}

impl HandshakeReport {
    fn new() -> Self {
        Self {
            transitions: vec![HandshakeState::Idle],
            migrations_applied: 0,
            restore: None,
            degraded: false,
            error: None,
        }
    }
}

impl SyncEngine {
    pub async fn handshake_state(&self) -> HandshakeState {
        *self.handshake.read().await
    }

    /// Whether local mutations may be pushed automatically.
    pub async fn is_ready(&self) -> bool {
        self.handshake_state().await == HandshakeState::Ready
    }

    async fn enter(&self, state: HandshakeState, report: &mut HandshakeReport) {
        *self.handshake.write().await = state;
        if report.transitions.last() != Some(&state) {
            report.transitions.push(state);
        }
    }

    async fn fail(&self, report: &mut HandshakeReport, message: String) {
        self.enter(HandshakeState::Error, report).await;
        report.degraded = true;
        report.error = Some(message);
    }

    /// Runs the startup handshake: migrations, then a full restore when a
    /// tenant is bound and the remote store is reachable, then `ready`.
    ///
    /// Returns `None` when the handshake already ran for this engine.
    pub async fn start_session(&self) -> Option<HandshakeReport> {
        if self.session_started.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut report = HandshakeReport::new();

        self.enter(HandshakeState::Migrating, &mut report).await;
        match self.blocking(|store| store.migrate()).await {
            Ok(applied) => report.migrations_applied = applied,
            Err(e) => {
                error!(error = %e, "local migrations failed, continuing degraded");
                self.fail(&mut report, e.to_string()).await;
                return Some(self.finish(report).await);
            }
        }

        match self.tenant().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("no tenant bound, sync disabled until login");
                return Some(self.finish(report).await);
            }
            Err(e) => {
                self.fail(&mut report, e.to_string()).await;
                return Some(self.finish(report).await);
            }
        }

        let online = tokio::time::timeout(self.config.request_timeout(), self.remote.is_online())
            .await
            .unwrap_or(false);
        if !online {
            warn!("remote store unreachable, starting offline");
            self.set_status(SyncStatus::Offline);
            self.reconcile_pending.store(true, Ordering::Release);
            report.degraded = true;
            return Some(self.finish(report).await);
        }

        self.enter(HandshakeState::Pulling, &mut report).await;
        match self.restore_from_cloud().await {
            Ok(restore) => report.restore = restore,
            Err(e) => {
                error!(error = %e, "restore from cloud failed, continuing degraded");
                if e.is_connectivity() {
                    self.reconcile_pending.store(true, Ordering::Release);
                }
                self.fail(&mut report, e.to_string()).await;
            }
        }

        Some(self.finish(report).await)
    }

    async fn finish(&self, mut report: HandshakeReport) -> HandshakeReport {
        self.enter(HandshakeState::Ready, &mut report).await;
        info!(degraded = report.degraded, "session ready");
        // Mutations queued before `ready` may now be pushed.
        self.send_command(SyncCommand::Flush);
        report
    }
}
