//! Push pipeline: local tenant state to the remote store.
//!
//! Per table: consolidate duplicates, tag, heal references, transform and
//! upsert on the table's conflict key. A push never deletes remote rows;
//! soft-deleted records travel as rows carrying `deleted_at`.

use crate::engine::{SyncEngine, SyncStatus};
use crate::error::{SyncError, SyncResult};
use crate::healer::{ConsolidationReport, HealReport, heal_references};
use crate::tagger::TenantTagger;
use crate::transform::{RemoteRow, to_remote};
use serde::Serialize;
use std::collections::HashMap;
use tillsync_model::{ConflictKey, Record, TableSpec};
use tillsync_types::{LocalId, TenantId};
use tracing::{debug, error, info};

/// What pushing one table did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub table: String,
    /// Rows sent to the remote store.
    pub pushed: usize,
    /// Legacy records claimed for the tenant.
    pub backfilled: usize,
    /// Records owned by another tenant, left out.
    pub rejected: Vec<LocalId>,
    pub heal: HealReport,
    pub consolidation: Option<ConsolidationReport>,
}

/// What a full push did, in table order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushAllReport {
    pub tables: Vec<PushReport>,
}

impl PushAllReport {
    pub fn pushed(&self) -> usize {
        self.tables.iter().map(|t| t.pushed).sum()
    }
}

impl SyncEngine {
    /// Pushes one table. `Ok(None)` when no tenant is bound.
    pub async fn push_table(&self, table: &str) -> SyncResult<Option<PushReport>> {
        let spec = *self.spec(table)?;
        let Some(tenant) = self.tenant().await? else {
            debug!(table, "no tenant bound, skipping push");
            return Ok(None);
        };
        self.push_table_inner(&spec, &tenant)
            .await
            .map(Some)
            .map_err(|e| SyncError::push(spec.name, e))
    }

    /// Pushes every table in dependency order. Halts at the first failing
    /// table; tables pushed before it stay committed.
    ///
    /// Fails with `AlreadySyncing` while another full push or restore runs.
    pub async fn push_all(&self) -> SyncResult<Option<PushAllReport>> {
        let _guard = self.begin_sync()?;
        let Some(tenant) = self.tenant().await? else {
            debug!("no tenant bound, skipping push");
            return Ok(None);
        };

        self.set_status(SyncStatus::Saving);
        let mut report = PushAllReport::default();
        let specs: Vec<TableSpec> = self.registry.tables().copied().collect();
        for spec in specs {
            match self.push_table_inner(&spec, &tenant).await {
                Ok(table_report) => report.tables.push(table_report),
                Err(e) => {
                    error!(table = spec.name, error = %e, "push failed, halting");
                    self.set_failure_status(&e);
                    return Err(SyncError::push(spec.name, e));
                }
            }
        }
        self.set_status(SyncStatus::Saved);
        info!(rows = report.pushed(), tables = report.tables.len(), "push complete");
        Ok(Some(report))
    }

    pub(crate) async fn push_table_inner(
        &self,
        spec: &TableSpec,
        tenant: &TenantId,
    ) -> SyncResult<PushReport> {
        let name = spec.name;
        let consolidation = if spec.consolidate {
            Some(self.consolidate_table(spec, tenant).await?)
        } else {
            None
        };

        let scope = tenant.clone();
        let rows = self
            .blocking(move |store| store.scan_for_tenant(name, &scope))
            .await?;

        let tagged = TenantTagger::new(tenant.clone()).tag_batch(name, rows);
        let (records, heal) = if spec.foreign_keys.is_empty() {
            (tagged.records, HealReport::new(name))
        } else {
            let parents = self.load_parents(spec, tenant).await?;
            heal_references(spec, tagged.records, &parents)
        };

        let changed: Vec<Record> = records
            .iter()
            .filter(|r| tagged.backfilled.contains(&r.id) || heal.changed.contains(&r.id))
            .cloned()
            .collect();
        if !changed.is_empty() {
            self.blocking(move |store| store.bulk_put(name, &changed))
                .await?;
        }

        let batch = upsert_batch(spec, &records);
        let pushed = batch.len();
        self.bounded(self.remote.upsert(tenant, spec, batch)).await?;
        debug!(table = name, pushed, "pushed table");

        Ok(PushReport {
            table: name.to_string(),
            pushed,
            backfilled: tagged.backfilled.len(),
            rejected: tagged.rejected,
            heal,
            consolidation,
        })
    }
}

/// Remote rows for a batch. With a natural conflict key, a soft-deleted
/// record sharing its key with a live one is left out: one upsert statement
/// cannot touch the same conflict target twice.
fn upsert_batch(spec: &TableSpec, records: &[Record]) -> Vec<RemoteRow> {
    let rows = records.iter().map(|r| to_remote(spec, r));
    let ConflictKey::Columns(columns) = spec.conflict_key else {
        return rows.collect();
    };

    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut batch: Vec<RemoteRow> = Vec::with_capacity(records.len());
    for (record, row) in records.iter().zip(rows) {
        let key = columns
            .iter()
            .map(|col| row.get(*col).map(ToString::to_string).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("|");
        match slots.get(&key) {
            Some(&idx) => {
                let occupant_live = batch[idx]
                    .get("deleted_at")
                    .is_none_or(serde_json::Value::is_null);
                if !record.is_deleted() && !occupant_live {
                    batch[idx] = row;
                }
            }
            None => {
                slots.insert(key, batch.len());
                batch.push(row);
            }
        }
    }
    batch
}
