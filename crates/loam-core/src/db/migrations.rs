//! Database migrations

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::schema::SyncSchema;

/// Run core table setup and all pending application migrations
pub fn run(conn: &mut Connection, schema: &SyncSchema) -> Result<()> {
    ensure_core_tables(conn)?;

    let version = get_version(conn)?;
    for migration in schema.migrations() {
        if migration.version() <= version {
            continue;
        }
        let tx = conn.transaction()?;
        migration.apply(&tx)?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![migration.version()],
        )?;
        tx.commit()?;
        tracing::info!(version = migration.version(), "Applied schema migration");
    }

    Ok(())
}

/// Sync bookkeeping tables, created unconditionally before versioned
/// application migrations run.
fn ensure_core_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS archive (
            id TEXT PRIMARY KEY,
            table_name TEXT,
            data TEXT,
            data_id TEXT,
            lts INTEGER,
            is_unsynced INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_archive_unsynced ON archive(is_unsynced);
        CREATE TABLE IF NOT EXISTS syncing_table (
            entity_name TEXT PRIMARY KEY,
            last_received_lts INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    tx.commit()?;
    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
