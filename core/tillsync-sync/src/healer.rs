//! Referential-integrity repair and duplicate consolidation.
//!
//! Partial syncs and older clients leave children pointing at parents that no
//! longer exist locally, and the same catalog entry created twice under
//! slightly different spellings. Both are repaired here before data leaves
//! the device and after a full restore.
//!
//! Reference repair resolves a dangling id in order:
//! 1. exact id match against the live parents
//! 2. natural-key match, using the child's hint field or the stale parent's
//!    own name (soft-deleted parents included)
//! 3. the fallback parent (lowest live id) for required references; optional
//!    references are cleared instead
//!
//! A required reference with no live parent at all cannot be repaired; the
//! child is excluded from the batch and logged.

use crate::engine::SyncEngine;
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tillsync_model::{ForeignKey, Record, TableSpec};
use tillsync_types::{LocalId, NaturalKey, TenantId};
use tracing::{debug, info, warn};

/// What a reference-repair pass did to one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealReport {
    pub table: String,
    /// References that already pointed at a live parent.
    pub intact: usize,
    /// References re-resolved by natural key.
    pub by_natural_key: usize,
    /// Required references moved to the fallback parent.
    pub fallback: usize,
    /// Optional references cleared.
    pub cleared: usize,
    /// Records modified by the pass.
    pub changed: Vec<LocalId>,
    /// Records that could not be repaired.
    pub excluded: Vec<LocalId>,
}

impl HealReport {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn repaired(&self) -> usize {
        self.by_natural_key + self.fallback + self.cleared
    }
}

/// What a consolidation pass did to one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub table: String,
    /// Natural keys that had more than one live record.
    pub groups: usize,
    /// Loser id -> winner id.
    pub merged: BTreeMap<LocalId, LocalId>,
    /// Winners renamed to their canonical natural key.
    pub renamed: Vec<LocalId>,
    /// Dependent records repointed from a loser to its winner.
    pub repointed: usize,
}

impl ConsolidationReport {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.merged.is_empty() && self.renamed.is_empty()
    }
}

/// Lookup view over one parent table.
#[derive(Debug, Clone)]
pub struct ParentSet {
    spec: TableSpec,
    live: BTreeMap<LocalId, Option<String>>,
    by_key: HashMap<NaturalKey, LocalId>,
    stale_keys: HashMap<LocalId, NaturalKey>,
}

impl ParentSet {
    /// Builds the view from every local row of the parent table, soft-deleted
    /// rows included (their names resolve stale references).
    pub fn new(spec: &TableSpec, rows: &[Record]) -> Self {
        let mut live = BTreeMap::new();
        let mut by_key = HashMap::new();
        let mut stale_keys = HashMap::new();

        for row in rows {
            let key = spec.natural_key_of(row);
            if let Some(key) = &key {
                stale_keys.insert(row.id, key.clone());
            }
            if row.is_deleted() {
                continue;
            }
            let display = spec
                .natural_key
                .and_then(|field| row.get_str(field))
                .map(str::to_string);
            live.insert(row.id, display);
            if let Some(key) = key {
                by_key
                    .entry(key)
                    .and_modify(|id: &mut LocalId| *id = (*id).min(row.id))
                    .or_insert(row.id);
            }
        }

        Self {
            spec: *spec,
            live,
            by_key,
            stale_keys,
        }
    }

    pub fn table(&self) -> &'static str {
        self.spec.name
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live parent with the given natural key (lowest id on ties).
    pub fn resolve_key(&self, key: &NaturalKey) -> Option<LocalId> {
        self.by_key.get(key).copied()
    }

    /// Natural key of a parent row, live or soft-deleted.
    pub fn stale_key(&self, id: LocalId) -> Option<&NaturalKey> {
        self.stale_keys.get(&id)
    }

    /// First available parent: the lowest live id.
    pub fn fallback(&self) -> Option<LocalId> {
        self.live.keys().next().copied()
    }

    /// Natural-key value of a live parent as stored.
    pub fn display_name(&self, id: LocalId) -> Option<&str> {
        self.live.get(&id).and_then(|name| name.as_deref())
    }

    fn normalize(&self, raw: &str) -> Option<NaturalKey> {
        self.spec.normalize_key(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Intact,
    ByNaturalKey(LocalId),
    Fallback(LocalId),
    Cleared,
    Unresolvable,
}

fn resolve(fk: &ForeignKey, child: &Record, parents: Option<&ParentSet>) -> Resolution {
    let current = child.reference(fk.field);
    let Some(parents) = parents else {
        return if current.is_none() && !fk.required {
            Resolution::Intact
        } else if fk.required {
            Resolution::Unresolvable
        } else {
            Resolution::Cleared
        };
    };

    match current {
        Some(id) if parents.contains(id) => return Resolution::Intact,
        None if !fk.required => return Resolution::Intact,
        _ => {}
    }

    let hint = fk
        .hint_field
        .and_then(|field| child.get_str(field))
        .and_then(|raw| parents.normalize(raw));
    let stale = current.and_then(|id| parents.stale_key(id)).cloned();
    for key in [hint, stale].into_iter().flatten() {
        if let Some(id) = parents.resolve_key(&key) {
            return Resolution::ByNaturalKey(id);
        }
    }

    if !fk.required {
        return Resolution::Cleared;
    }
    match parents.fallback() {
        Some(id) => Resolution::Fallback(id),
        None => Resolution::Unresolvable,
    }
}

/// Repairs the foreign keys of `records` against `parents` (keyed by parent
/// table name). Returns the records that may be pushed and a report; records
/// that could not be repaired are left out.
pub fn heal_references(
    spec: &TableSpec,
    records: Vec<Record>,
    parents: &HashMap<&str, ParentSet>,
) -> (Vec<Record>, HealReport) {
    let mut report = HealReport::new(spec.name);
    let mut healed = Vec::with_capacity(records.len());

    'records: for mut record in records {
        let mut changed = false;
        for fk in spec.foreign_keys {
            let parent_set = parents.get(fk.parent);
            let target = match resolve(fk, &record, parent_set) {
                Resolution::Intact => {
                    report.intact += 1;
                    continue;
                }
                Resolution::ByNaturalKey(id) => {
                    report.by_natural_key += 1;
                    Some(id)
                }
                Resolution::Fallback(id) => {
                    warn!(
                        table = spec.name,
                        id = record.id,
                        field = fk.field,
                        parent = id,
                        "re-homed reference to fallback parent"
                    );
                    report.fallback += 1;
                    Some(id)
                }
                Resolution::Cleared => {
                    report.cleared += 1;
                    None
                }
                Resolution::Unresolvable => {
                    warn!(
                        table = spec.name,
                        id = record.id,
                        field = fk.field,
                        parent_table = fk.parent,
                        "unrepairable reference, excluding record"
                    );
                    report.excluded.push(record.id);
                    continue 'records;
                }
            };

            debug!(
                table = spec.name,
                id = record.id,
                field = fk.field,
                from = ?record.reference(fk.field),
                to = ?target,
                "repaired reference"
            );
            record.set_reference(fk.field, target);
            if let (Some(hint), Some(parent)) = (fk.hint_field, target) {
                if let Some(name) = parent_set.and_then(|p| p.display_name(parent)) {
                    record.set(hint, name.into());
                }
            }
            changed = true;
        }
        if changed {
            report.changed.push(record.id);
        }
        healed.push(record);
    }

    (healed, report)
}

/// Collapses live records sharing a natural key into the lowest-id record.
///
/// Losers are soft-deleted at `now`. When the key is an alias target the
/// winner takes the canonical name. Records are modified in place; ids of
/// changed records are `merged` keys plus `renamed`.
pub fn consolidate_duplicates(
    spec: &TableSpec,
    records: &mut [Record],
    now: DateTime<Utc>,
) -> ConsolidationReport {
    let mut report = ConsolidationReport::new(spec.name);
    if !spec.consolidate {
        return report;
    }

    let mut groups: BTreeMap<NaturalKey, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        if record.is_deleted() {
            continue;
        }
        if let Some(key) = spec.natural_key_of(record) {
            groups.entry(key).or_default().push(idx);
        }
    }

    for (key, members) in groups {
        if members.len() < 2 {
            continue;
        }
        let Some(winner) = members.iter().copied().min_by_key(|&idx| records[idx].id) else {
            continue;
        };
        let winner_id = records[winner].id;
        report.groups += 1;

        for idx in members.into_iter().filter(|&idx| idx != winner) {
            records[idx].soft_delete(now);
            report.merged.insert(records[idx].id, winner_id);
        }

        if let (Some(field), Some(canonical)) = (spec.natural_key, spec.canonical_name(&key)) {
            if records[winner].get_str(field) != Some(canonical) {
                records[winner].set(field, canonical.into());
                report.renamed.push(winner_id);
            }
        }

        info!(
            table = spec.name,
            key = %key,
            winner = winner_id,
            "consolidated duplicate records"
        );
    }

    report
}

/// Points children of merged parents at the surviving parent. `names` holds
/// the winners' natural-key values for refreshing hint fields. Returns the
/// ids of changed children.
pub fn repoint_dependents(
    fk: &ForeignKey,
    children: &mut [Record],
    merged: &BTreeMap<LocalId, LocalId>,
    names: &BTreeMap<LocalId, String>,
) -> Vec<LocalId> {
    let mut changed = Vec::new();
    for child in children.iter_mut() {
        let Some(winner) = child
            .reference(fk.field)
            .and_then(|parent| merged.get(&parent).copied())
        else {
            continue;
        };
        child.set_reference(fk.field, Some(winner));
        if let (Some(hint), Some(name)) = (fk.hint_field, names.get(&winner)) {
            child.set(hint, name.as_str().into());
        }
        changed.push(child.id);
    }
    changed
}

// ── Store-backed passes ──────────────────────────────────────────

impl SyncEngine {
    /// Parent lookup views for every foreign key of `spec`.
    pub(crate) async fn load_parents(
        &self,
        spec: &TableSpec,
        tenant: &TenantId,
    ) -> SyncResult<HashMap<&'static str, ParentSet>> {
        let mut parents = HashMap::new();
        for fk in spec.foreign_keys {
            if parents.contains_key(fk.parent) {
                continue;
            }
            let parent_spec = *self.spec(fk.parent)?;
            let tenant = tenant.clone();
            let rows = self
                .blocking(move |store| store.scan_for_tenant(parent_spec.name, &tenant))
                .await?;
            parents.insert(fk.parent, ParentSet::new(&parent_spec, &rows));
        }
        Ok(parents)
    }

    /// Consolidates one table locally and repoints its dependents.
    pub(crate) async fn consolidate_table(
        &self,
        spec: &TableSpec,
        tenant: &TenantId,
    ) -> SyncResult<ConsolidationReport> {
        let name = spec.name;
        let scope = tenant.clone();
        let mut rows = self
            .blocking(move |store| store.scan_for_tenant(name, &scope))
            .await?;

        let mut report = consolidate_duplicates(spec, &mut rows, Utc::now());
        if report.is_noop() {
            return Ok(report);
        }

        let changed: Vec<Record> = rows
            .iter()
            .filter(|r| report.merged.contains_key(&r.id) || report.renamed.contains(&r.id))
            .cloned()
            .collect();
        self.blocking(move |store| store.bulk_put(name, &changed))
            .await?;

        let names: BTreeMap<LocalId, String> = match spec.natural_key {
            Some(field) => rows
                .iter()
                .filter(|r| !r.is_deleted())
                .filter_map(|r| r.get_str(field).map(|v| (r.id, v.to_string())))
                .collect(),
            None => BTreeMap::new(),
        };

        let dependents: Vec<(TableSpec, ForeignKey)> = self
            .registry
            .dependents_of(name)
            .into_iter()
            .map(|(child, fk)| (*child, *fk))
            .collect();
        for (child_spec, fk) in dependents {
            let child = child_spec.name;
            let scope = tenant.clone();
            let mut children = self
                .blocking(move |store| store.scan_for_tenant(child, &scope))
                .await?;
            let ids = repoint_dependents(&fk, &mut children, &report.merged, &names);
            if ids.is_empty() {
                continue;
            }
            report.repointed += ids.len();
            let updated: Vec<Record> = children
                .into_iter()
                .filter(|r| ids.contains(&r.id))
                .collect();
            self.blocking(move |store| store.bulk_put(child, &updated))
                .await?;
        }

        Ok(report)
    }

    /// Re-homes children whose parents are still missing, persisting the
    /// repairs locally. Unrepairable children are left untouched.
    pub(crate) async fn rescue_orphans(
        &self,
        spec: &TableSpec,
        tenant: &TenantId,
    ) -> SyncResult<HealReport> {
        if spec.foreign_keys.is_empty() {
            return Ok(HealReport::new(spec.name));
        }
        let name = spec.name;
        let scope = tenant.clone();
        let rows = self
            .blocking(move |store| store.scan_for_tenant(name, &scope))
            .await?;
        let parents = self.load_parents(spec, tenant).await?;
        let (healed, report) = heal_references(spec, rows, &parents);

        let changed: Vec<Record> = healed
            .into_iter()
            .filter(|r| report.changed.contains(&r.id))
            .collect();
        if !changed.is_empty() {
            info!(table = name, rescued = changed.len(), "re-homed orphaned records");
            self.blocking(move |store| store.bulk_put(name, &changed))
                .await?;
        }
        Ok(report)
    }
}
