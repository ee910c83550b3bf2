//! Database connection management

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::hooks::Action;
use rusqlite::Connection;

use crate::error::Result;
use crate::schema::SyncSchema;

use super::migrations;

/// Database wrapper for `SQLite` connections
///
/// Mutated table names are collected through the update hook so the store
/// can drive `watch` subscriptions without polling.
pub struct Database {
    conn: Connection,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>, schema: &SyncSchema) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, schema)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory(schema: &SyncSchema) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, schema)
    }

    fn from_connection(conn: Connection, schema: &SyncSchema) -> Result<Self> {
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let hook_pending = Arc::clone(&pending);
        conn.update_hook(Some(
            move |_action: Action, _db: &str, table: &str, _rowid: i64| {
                if let Ok(mut tables) = hook_pending.lock() {
                    tables.insert(table.to_string());
                }
            },
        ));

        let mut db = Self { conn, pending };
        db.configure()?;
        db.migrate(schema)?;
        Ok(db)
    }

    /// Configure `SQLite` for optimal performance
    fn configure(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA cache_size = 10000;
            ",
        )?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&mut self, schema: &SyncSchema) -> Result<()> {
        migrations::run(&mut self.conn, schema)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference to the underlying connection
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Shared set of table names mutated since the last drain.
    pub(crate) fn pending_changes(&self) -> Arc<Mutex<HashSet<String>>> {
        Arc::clone(&self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SyncSchema;

    #[test]
    fn test_open_in_memory() {
        let schema = SyncSchema::new(vec![], vec![]).unwrap();
        let db = Database::open_in_memory(&schema).unwrap();
        assert!(db.connection().is_autocommit());
    }

    #[test]
    fn update_hook_collects_mutated_tables() {
        let schema = SyncSchema::new(vec![], vec![]).unwrap();
        let db = Database::open_in_memory(&schema).unwrap();
        db.connection()
            .execute(
                "INSERT INTO syncing_table (entity_name, last_received_lts) VALUES ('items', 0)",
                [],
            )
            .unwrap();

        let pending = db.pending_changes();
        let tables = pending.lock().unwrap();
        assert!(tables.contains("syncing_table"));
    }
}
