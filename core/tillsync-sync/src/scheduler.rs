//! Change scheduler.
//!
//! Local mutations and connectivity changes arrive as commands. The scheduler
//! coalesces them: every command restarts the debounce window, and when the
//! window closes one `push_all` runs for everything queued so far. Nothing is
//! pushed before the handshake reaches `ready`.

use crate::engine::SyncEngine;
use crate::error::SyncError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Commands accepted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// A local write touched this table.
    Mutated(String),
    /// The remote store became reachable again.
    ConnectivityRestored,
    /// Push now if anything is pending.
    Flush,
    /// Stop the scheduler.
    Shutdown,
}

pub(crate) fn spawn(engine: Arc<SyncEngine>, rx: UnboundedReceiver<SyncCommand>) -> JoinHandle<()> {
    tokio::spawn(run(engine, rx))
}

#[derive(Default)]
struct Pending {
    tables: BTreeSet<String>,
    full: bool,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.tables.is_empty() && !self.full
    }

    fn clear(&mut self) {
        self.tables.clear();
        self.full = false;
    }
}

async fn run(engine: Arc<SyncEngine>, mut rx: UnboundedReceiver<SyncCommand>) {
    let debounce = engine.config().debounce();
    let mut pending = Pending::default();
    let mut deadline: Option<Instant> = None;
    debug!(?debounce, "change scheduler started");

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                () = sleep_until(at) => {
                    deadline = None;
                    if !flush(&engine, &mut pending).await {
                        deadline = Some(Instant::now() + debounce);
                    }
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(SyncCommand::Mutated(table)) => {
                pending.tables.insert(table);
                deadline = Some(Instant::now() + debounce);
            }
            Some(SyncCommand::ConnectivityRestored) => {
                info!("connectivity restored, scheduling push");
                pending.full = true;
                deadline = Some(Instant::now() + debounce);
            }
            Some(SyncCommand::Flush) => {
                if !pending.is_empty() {
                    deadline = None;
                    if !flush(&engine, &mut pending).await {
                        deadline = Some(Instant::now() + debounce);
                    }
                }
            }
            Some(SyncCommand::Shutdown) | None => break,
        }
    }
    debug!("change scheduler stopped");
}

/// Runs one push for everything pending. Returns false when the push should
/// be retried after another debounce window.
async fn flush(engine: &SyncEngine, pending: &mut Pending) -> bool {
    if pending.is_empty() {
        return true;
    }
    if !engine.is_ready().await {
        // The handshake sends `Flush` once it is done.
        debug!("session not ready, holding queued changes");
        return true;
    }

    debug!(tables = ?pending.tables, full = pending.full, "debounce elapsed, pushing");
    match engine.push_all().await {
        Ok(_) => {
            pending.clear();
            true
        }
        Err(SyncError::AlreadySyncing) => {
            debug!("push already running, retrying after next window");
            false
        }
        Err(e) if e.is_connectivity() => {
            // Kept until connectivity is restored.
            warn!(error = %e, "push deferred, remote unreachable");
            true
        }
        Err(e) => {
            warn!(error = %e, "push failed");
            true
        }
    }
}
