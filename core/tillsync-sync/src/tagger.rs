//! Tenant tagging.

use crate::error::{SyncError, SyncResult};
use tillsync_model::Record;
use tillsync_types::{LocalId, TenantId};
use tracing::{debug, warn};

/// Stamps records with the active tenant.
///
/// An untagged record is claimed for the active tenant. A record already
/// owned by another tenant is an integrity violation: it is never re-tagged.
#[derive(Debug, Clone)]
pub struct TenantTagger {
    tenant: TenantId,
}

/// Result of tagging a batch.
#[derive(Debug, Default)]
pub struct TagOutcome {
    /// Records owned by the active tenant, in input order.
    pub records: Vec<Record>,
    /// Ids of records that were untagged and have been claimed.
    pub backfilled: Vec<LocalId>,
    /// Ids of records owned by another tenant. Not included in `records`.
    pub rejected: Vec<LocalId>,
}

impl TenantTagger {
    pub fn new(tenant: TenantId) -> Self {
        Self { tenant }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn tag(&self, mut record: Record) -> SyncResult<Record> {
        match &record.tenant_id {
            None => {
                record.tenant_id = Some(self.tenant.clone());
                Ok(record)
            }
            Some(owner) if *owner == self.tenant => Ok(record),
            Some(owner) => Err(SyncError::TenantMismatch {
                id: record.id,
                expected: self.tenant.clone(),
                found: owner.to_string(),
            }),
        }
    }

    /// Tags every record of a batch, splitting off foreign ones.
    pub fn tag_batch(&self, table: &str, records: Vec<Record>) -> TagOutcome {
        let mut outcome = TagOutcome::default();
        for record in records {
            let untagged = record.tenant_id.is_none();
            let id = record.id;
            match self.tag(record) {
                Ok(tagged) => {
                    if untagged {
                        outcome.backfilled.push(id);
                    }
                    outcome.records.push(tagged);
                }
                Err(e) => {
                    warn!(table, id, error = %e, "excluding record owned by another tenant");
                    outcome.rejected.push(id);
                }
            }
        }
        if !outcome.backfilled.is_empty() {
            debug!(table, count = outcome.backfilled.len(), "backfilled tenant on legacy records");
        }
        outcome
    }
}
