//! Table-per-entity local store.

use crate::error::{StorageError, StorageResult};
use crate::migrations;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tillsync_model::{Record, TableRegistry, TableSpec, format_timestamp};
use tillsync_types::{LocalId, TenantId};
use tracing::debug;

const TENANT_KEY: &str = "tenant_id";

/// Embedded store holding every entity table of one device.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<TableRegistry>,
}

impl LocalStore {
    /// Opens (or creates) a store at the given path. Migrations are not run;
    /// call [`Self::migrate`] before touching entity tables.
    pub fn open(path: &Path, registry: Arc<TableRegistry>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry,
        })
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory(registry: Arc<TableRegistry>) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn spec(&self, table: &str) -> StorageResult<&TableSpec> {
        self.registry
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }

    // ── Schema ───────────────────────────────────────────────────

    /// Currently applied schema version.
    pub fn schema_version(&self) -> StorageResult<i64> {
        let conn = self.conn()?;
        migrations::schema_version(&conn)
    }

    /// Number of migrations not yet applied.
    pub fn pending_migrations(&self) -> StorageResult<usize> {
        let conn = self.conn()?;
        migrations::pending(&conn)
    }

    /// Applies pending migrations. Returns how many ran.
    pub fn migrate(&self) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        migrations::run(&mut conn, &self.registry)
    }

    // ── Single-record operations ─────────────────────────────────

    pub fn get(&self, table: &str, id: LocalId) -> StorageResult<Option<Record>> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM \"{}\" WHERE id = ?1", spec.name),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|raw| decode(spec, &raw)).transpose()
    }

    /// Inserts or replaces a record by id.
    pub fn put(&self, table: &str, record: &Record) -> StorageResult<()> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        upsert_row(&conn, spec, record)
    }

    /// Inserts or replaces a batch of records in one transaction.
    pub fn bulk_put(&self, table: &str, records: &[Record]) -> StorageResult<()> {
        let spec = self.spec(table)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for record in records {
            upsert_row(&tx, spec, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Physically removes a record. Returns whether a row existed.
    pub fn delete(&self, table: &str, id: LocalId) -> StorageResult<bool> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        let removed = conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id = ?1", spec.name),
            params![id],
        )?;
        Ok(removed > 0)
    }

    /// Next free local id for a table.
    pub fn next_id(&self, table: &str) -> StorageResult<LocalId> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        next_free_id(&conn, spec)
    }

    /// Inserts a record under the next free id. The id is allocated and the
    /// row written in one transaction, so concurrent callers never share an
    /// id. Returns the record with its id set.
    pub fn insert_new(&self, table: &str, mut record: Record) -> StorageResult<Record> {
        let spec = self.spec(table)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        record.id = next_free_id(&tx, spec)?;
        upsert_row(&tx, spec, &record)?;
        tx.commit()?;
        Ok(record)
    }

    // ── Scans ────────────────────────────────────────────────────

    /// Every row of a table, ordered by id.
    pub fn scan(&self, table: &str) -> StorageResult<Vec<Record>> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM \"{}\" ORDER BY id",
            spec.name
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect(spec, rows)
    }

    /// Rows owned by `tenant` plus untagged rows (legacy data the tagger
    /// still has to claim), ordered by id.
    pub fn scan_for_tenant(&self, table: &str, tenant: &TenantId) -> StorageResult<Vec<Record>> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM \"{}\" WHERE tenant_id = ?1 OR tenant_id IS NULL ORDER BY id",
            spec.name
        ))?;
        let rows = stmt.query_map(params![tenant.as_str()], |row| row.get::<_, String>(0))?;
        collect(spec, rows)
    }

    /// Live (not soft-deleted) rows owned by `tenant`.
    pub fn live_for_tenant(&self, table: &str, tenant: &TenantId) -> StorageResult<Vec<Record>> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM \"{}\" WHERE tenant_id = ?1 AND deleted_at IS NULL ORDER BY id",
            spec.name
        ))?;
        let rows = stmt.query_map(params![tenant.as_str()], |row| row.get::<_, String>(0))?;
        collect(spec, rows)
    }

    pub fn count(&self, table: &str) -> StorageResult<usize> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", spec.name),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Rows owned by `tenant` or untagged.
    pub fn count_for_tenant(&self, table: &str, tenant: &TenantId) -> StorageResult<usize> {
        let spec = self.spec(table)?;
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM \"{}\" WHERE tenant_id = ?1 OR tenant_id IS NULL",
                spec.name
            ),
            params![tenant.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Clears the table and inserts `records`, atomically.
    pub fn replace_table(&self, table: &str, records: &[Record]) -> StorageResult<()> {
        let spec = self.spec(table)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let cleared = tx.execute(&format!("DELETE FROM \"{}\"", spec.name), [])?;
        for record in records {
            upsert_row(&tx, spec, record)?;
        }
        tx.commit()?;
        debug!(table, cleared, inserted = records.len(), "replaced local table");
        Ok(())
    }

    // ── Device configuration ─────────────────────────────────────

    pub fn config_get(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM device_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn config_set(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO device_config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn config_remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM device_config WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Tenant this device is bound to, if any.
    pub fn tenant(&self) -> StorageResult<Option<TenantId>> {
        match self.config_get(TENANT_KEY)? {
            Some(raw) => TenantId::new(raw)
                .map(Some)
                .map_err(|e| StorageError::InvalidData(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn bind_tenant(&self, tenant: &TenantId) -> StorageResult<()> {
        self.config_set(TENANT_KEY, tenant.as_str())
    }

    pub fn unbind_tenant(&self) -> StorageResult<()> {
        self.config_remove(TENANT_KEY)
    }
}

fn upsert_row(conn: &Connection, spec: &TableSpec, record: &Record) -> StorageResult<()> {
    let data = serde_json::to_string(&record.to_json())?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO \"{}\" (id, tenant_id, deleted_at, data) VALUES (?1, ?2, ?3, ?4)",
            spec.name
        ),
        params![
            record.id,
            record.tenant_id.as_ref().map(TenantId::as_str),
            record.deleted_at.as_ref().map(format_timestamp),
            data,
        ],
    )?;
    Ok(())
}

fn next_free_id(conn: &Connection, spec: &TableSpec) -> StorageResult<LocalId> {
    let max: Option<LocalId> = conn.query_row(
        &format!("SELECT MAX(id) FROM \"{}\"", spec.name),
        [],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

fn decode(spec: &TableSpec, raw: &str) -> StorageResult<Record> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    Ok(Record::from_json(spec, value)?)
}

fn collect(
    spec: &TableSpec,
    rows: impl Iterator<Item = rusqlite::Result<String>>,
) -> StorageResult<Vec<Record>> {
    let mut records = Vec::new();
    for row in rows {
        records.push(decode(spec, &row?)?);
    }
    Ok(records)
}
