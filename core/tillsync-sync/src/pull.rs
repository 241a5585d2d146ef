//! Pull pipeline: remote tenant state into the local store.
//!
//! A pull replaces a local table wholesale with the tenant's live remote
//! rows, with one safety rule: when the remote table is empty but the local
//! one is not, the local rows are pushed instead and nothing is cleared.

use crate::engine::{SyncEngine, SyncStatus};
use crate::error::{SyncError, SyncResult};
use crate::healer::{ConsolidationReport, HealReport};
use crate::push::PushReport;
use crate::tagger::TenantTagger;
use crate::transform::to_local;
use serde::Serialize;
use tillsync_model::{Record, TableSpec};
use tillsync_types::TenantId;
use tracing::{debug, error, info, warn};

/// What pulling one table did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PullOutcome {
    /// The local table now mirrors the remote rows.
    Replaced {
        table: String,
        rows: usize,
        /// Remote rows that were unreadable or owned by another tenant.
        skipped: usize,
    },
    /// The remote table was empty while local rows existed; they were pushed.
    PushedLocal { table: String, report: PushReport },
    /// No tenant is bound.
    NoTenant { table: String },
}

impl PullOutcome {
    pub fn table(&self) -> &str {
        match self {
            PullOutcome::Replaced { table, .. }
            | PullOutcome::PushedLocal { table, .. }
            | PullOutcome::NoTenant { table } => table,
        }
    }
}

/// What a full restore did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// One outcome per table, in dependency order.
    pub tables: Vec<PullOutcome>,
    /// Consolidation run after all tables were pulled.
    pub consolidation: Vec<ConsolidationReport>,
    /// Orphan rescue run last.
    pub rescued: Vec<HealReport>,
}

impl SyncEngine {
    /// Pulls one table.
    pub async fn pull_table(&self, table: &str) -> SyncResult<PullOutcome> {
        let spec = *self.spec(table)?;
        let Some(tenant) = self.tenant().await? else {
            debug!(table, "no tenant bound, skipping pull");
            return Ok(PullOutcome::NoTenant {
                table: spec.name.to_string(),
            });
        };
        self.pull_table_inner(&spec, &tenant)
            .await
            .map_err(|e| SyncError::pull(spec.name, e))
    }

    /// Pulls every table in dependency order, then consolidates duplicates
    /// and re-homes children that are still orphaned.
    ///
    /// `Ok(None)` when no tenant is bound. Fails with `AlreadySyncing` while
    /// a full push runs.
    pub async fn restore_from_cloud(&self) -> SyncResult<Option<RestoreReport>> {
        let _guard = self.begin_sync()?;
        let Some(tenant) = self.tenant().await? else {
            debug!("no tenant bound, skipping restore");
            return Ok(None);
        };

        let specs: Vec<TableSpec> = self.registry.tables().copied().collect();
        let mut report = RestoreReport::default();

        for spec in &specs {
            match self.pull_table_inner(spec, &tenant).await {
                Ok(outcome) => report.tables.push(outcome),
                Err(e) => {
                    error!(table = spec.name, error = %e, "restore failed, halting");
                    self.set_failure_status(&e);
                    return Err(SyncError::pull(spec.name, e));
                }
            }
        }

        for spec in specs.iter().filter(|s| s.consolidate) {
            let consolidation = self.consolidate_table(spec, &tenant).await?;
            if !consolidation.is_noop() {
                report.consolidation.push(consolidation);
            }
        }

        for spec in specs.iter().filter(|s| !s.foreign_keys.is_empty()) {
            let rescue = self.rescue_orphans(spec, &tenant).await?;
            if rescue.repaired() > 0 || !rescue.excluded.is_empty() {
                report.rescued.push(rescue);
            }
        }

        self.set_status(SyncStatus::Idle);
        info!(tables = report.tables.len(), "restore from cloud complete");
        Ok(Some(report))
    }

    pub(crate) async fn pull_table_inner(
        &self,
        spec: &TableSpec,
        tenant: &TenantId,
    ) -> SyncResult<PullOutcome> {
        let name = spec.name;
        let rows = self.bounded(self.remote.select_active(tenant, spec)).await?;

        if rows.is_empty() {
            let scope = tenant.clone();
            let local = self
                .blocking(move |store| store.count_for_tenant(name, &scope))
                .await?;
            if local > 0 {
                warn!(
                    table = name,
                    local,
                    "remote table empty but local has rows, pushing local instead"
                );
                let report = self.push_table_inner(spec, tenant).await?;
                return Ok(PullOutcome::PushedLocal {
                    table: name.to_string(),
                    report,
                });
            }
        }

        let tagger = TenantTagger::new(tenant.clone());
        let total = rows.len();
        let records: Vec<Record> = rows
            .into_iter()
            .filter_map(|row| match to_local(spec, row).and_then(|r| tagger.tag(r)) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(table = name, error = %e, "skipping remote row");
                    None
                }
            })
            .collect();
        let skipped = total - records.len();
        let count = records.len();

        self.blocking(move |store| store.replace_table(name, &records))
            .await?;
        debug!(table = name, rows = count, skipped, "pulled table");

        Ok(PullOutcome::Replaced {
            table: name.to_string(),
            rows: count,
            skipped,
        })
    }
}
