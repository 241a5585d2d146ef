//! Versioned local-schema migrations.
//!
//! The applied version lives in `PRAGMA user_version`. Each migration runs
//! in its own transaction together with the version bump.

use crate::error::{StorageError, StorageResult};
use rusqlite::Connection;
use tillsync_model::TableRegistry;
use tracing::{debug, info};

/// Schema version after every migration has been applied.
pub const LATEST_SCHEMA_VERSION: i64 = 3;

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection, &TableRegistry) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "device_config",
        apply: create_device_config,
    },
    Migration {
        version: 2,
        name: "entity_tables",
        apply: create_entity_tables,
    },
    Migration {
        version: 3,
        name: "tenant_indexes",
        apply: create_tenant_indexes,
    },
];

pub(crate) fn schema_version(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

pub(crate) fn pending(conn: &Connection) -> StorageResult<usize> {
    let current = schema_version(conn)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

/// Applies every pending migration, then creates tables for registry entries
/// added since the last migration. Returns the number of migrations applied.
pub(crate) fn run(conn: &mut Connection, registry: &TableRegistry) -> StorageResult<usize> {
    let current = schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "store schema version {current} is newer than supported {LATEST_SCHEMA_VERSION}"
        )));
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        (migration.apply)(&tx, registry).map_err(|e| {
            StorageError::Migration(format!("{} (v{}): {e}", migration.name, migration.version))
        })?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
        info!(version = migration.version, name = migration.name, "applied local migration");
        applied += 1;
    }

    create_entity_tables(conn, registry)?;
    create_tenant_indexes(conn, registry)?;
    debug!(applied, "local schema up to date");
    Ok(applied)
}

fn create_device_config(conn: &Connection, _registry: &TableRegistry) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS device_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
}

fn create_entity_tables(conn: &Connection, registry: &TableRegistry) -> rusqlite::Result<()> {
    for spec in registry.tables() {
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS \"{}\" (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT,
                deleted_at TEXT,
                data TEXT NOT NULL
            );
            ",
            spec.name
        ))?;
    }
    Ok(())
}

fn create_tenant_indexes(conn: &Connection, registry: &TableRegistry) -> rusqlite::Result<()> {
    for spec in registry.tables() {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{0}_tenant\" ON \"{0}\" (tenant_id, deleted_at);",
            spec.name
        ))?;
    }
    Ok(())
}
