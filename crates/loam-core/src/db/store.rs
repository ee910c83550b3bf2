//! Shared local store handle used across the engine.
//!
//! Wraps the connection in a thread-safe service object (point reads, batch
//! execution, serialized write transactions) and exposes watched queries that
//! re-emit whenever one of their trigger tables is mutated.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::{Map, Number, Value};
use tokio::sync::{watch, Mutex};

use crate::db::connection::Database;
use crate::error::{Error, Result};
use crate::schema::SyncSchema;

/// One result row, keyed by column name.
pub type RowMap = Map<String, Value>;

struct StoreInner {
    db: Mutex<Database>,
    /// Table names mutated by the operation currently holding the db lock.
    pending: Arc<StdMutex<HashSet<String>>>,
    /// Per-table mutation counters driving `watch` subscriptions.
    versions: StdMutex<HashMap<String, u64>>,
    generation: watch::Sender<u64>,
    closed: AtomicBool,
}

/// Thread-safe handle to the local database.
///
/// Cheap to clone; all clones share one connection serialized behind an
/// async mutex.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Open a store at the given filesystem path, running migrations.
    pub fn open(path: impl AsRef<Path>, schema: &SyncSchema) -> Result<Self> {
        Ok(Self::from_database(Database::open(path, schema)?))
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory(schema: &SyncSchema) -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory(schema)?))
    }

    fn from_database(db: Database) -> Self {
        let pending = db.pending_changes();
        let (generation, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(StoreInner {
                db: Mutex::new(db),
                pending,
                versions: StdMutex::new(HashMap::new()),
                generation,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Mark the store closed and wake all watchers so they terminate.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner
            .generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Run a query and collect every result row.
    pub async fn get_all(&self, sql: &str, params: &[Value]) -> Result<Vec<RowMap>> {
        self.ensure_open()?;
        let db = self.inner.db.lock().await;
        query_all(db.connection(), sql, params)
    }

    /// Run a query expected to produce at most one row.
    pub async fn get_optional(&self, sql: &str, params: &[Value]) -> Result<Option<RowMap>> {
        Ok(self.get_all(sql, params).await?.into_iter().next())
    }

    /// Execute a single statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.ensure_open()?;
        let changed = {
            let db = self.inner.db.lock().await;
            exec(db.connection(), sql, params)?
        };
        self.publish_changes();
        Ok(changed)
    }

    /// Execute one statement for every parameter tuple, reusing a single
    /// prepared statement.
    pub async fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<()> {
        self.ensure_open()?;
        {
            let db = self.inner.db.lock().await;
            exec_batch(db.connection(), sql, rows)?;
        }
        self.publish_changes();
        Ok(())
    }

    /// Run `f` inside a write transaction.
    ///
    /// Commits when the closure returns `Ok`, rolls back otherwise. Write
    /// transactions are serialized by the store lock.
    pub async fn write_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<T> + Send,
        T: Send,
    {
        self.ensure_open()?;
        let result = {
            let mut db = self.inner.db.lock().await;
            let tx = db.connection_mut().transaction()?;
            match f(&StoreTxn { tx: &tx }) {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(error) => {
                    let _ = tx.rollback();
                    Err(error)
                }
            }
        };
        match result {
            Ok(value) => {
                self.publish_changes();
                Ok(value)
            }
            Err(error) => {
                self.discard_pending();
                Err(error)
            }
        }
    }

    /// Subscribe to a query that re-emits whenever a trigger table changes.
    ///
    /// The returned watch never misses a mutation on its trigger tables; it
    /// may re-emit an unchanged result set after writes that did not affect
    /// the query.
    #[must_use]
    pub fn watch(
        &self,
        sql: impl Into<String>,
        params: &[Value],
        trigger_tables: &[&str],
    ) -> QueryWatch {
        QueryWatch {
            store: self.clone(),
            sql: sql.into(),
            params: params.to_vec(),
            tables: trigger_tables.iter().map(|t| (*t).to_string()).collect(),
            rx: self.inner.generation.subscribe(),
            seen: HashMap::new(),
            primed: false,
        }
    }

    fn table_versions(&self, tables: &[String]) -> HashMap<String, u64> {
        let versions = self.inner.versions.lock().unwrap();
        tables
            .iter()
            .map(|table| (table.clone(), versions.get(table).copied().unwrap_or(0)))
            .collect()
    }

    fn publish_changes(&self) {
        let drained: Vec<String> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        {
            let mut versions = self.inner.versions.lock().unwrap();
            for table in drained {
                *versions.entry(table).or_insert(0) += 1;
            }
        }
        self.inner
            .generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Drop table-change records from a rolled-back transaction.
    fn discard_pending(&self) {
        self.inner.pending.lock().unwrap().clear();
    }
}

/// Transaction handle passed to `write_transaction` closures.
pub struct StoreTxn<'t> {
    tx: &'t rusqlite::Transaction<'t>,
}

impl StoreTxn<'_> {
    pub fn get_all(&self, sql: &str, params: &[Value]) -> Result<Vec<RowMap>> {
        query_all(self.tx, sql, params)
    }

    pub fn get_optional(&self, sql: &str, params: &[Value]) -> Result<Option<RowMap>> {
        Ok(self.get_all(sql, params)?.into_iter().next())
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        exec(self.tx, sql, params)
    }

    pub fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<()> {
        exec_batch(self.tx, sql, rows)
    }
}

/// Restartable sequence of result sets produced by [`LocalStore::watch`].
pub struct QueryWatch {
    store: LocalStore,
    sql: String,
    params: Vec<Value>,
    tables: Vec<String>,
    rx: watch::Receiver<u64>,
    seen: HashMap<String, u64>,
    primed: bool,
}

impl QueryWatch {
    /// Wait for the next result set.
    ///
    /// Emits the current result set immediately on first call, then once per
    /// trigger-table mutation. Returns `None` after the store closes.
    pub async fn next(&mut self) -> Option<Result<Vec<RowMap>>> {
        loop {
            if self.store.is_closed() {
                return None;
            }
            if !self.primed {
                self.primed = true;
                self.seen = self.store.table_versions(&self.tables);
                return Some(self.store.get_all(&self.sql, &self.params).await);
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
            if self.store.is_closed() {
                return None;
            }
            let current = self.store.table_versions(&self.tables);
            let advanced = self
                .tables
                .iter()
                .any(|table| current.get(table) > self.seen.get(table));
            if advanced {
                self.seen = current;
                return Some(self.store.get_all(&self.sql, &self.params).await);
            }
        }
    }
}

fn query_all(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<RowMap>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| (*name).to_string())
        .collect();
    let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = RowMap::new();
        for (index, name) in names.iter().enumerate() {
            map.insert(name.clone(), sql_to_json(row.get_ref(index)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn exec(conn: &Connection, sql: &str, params: &[Value]) -> Result<usize> {
    let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
    Ok(conn.execute(sql, rusqlite::params_from_iter(bound))?)
}

fn exec_batch(conn: &Connection, sql: &str, rows: &[Vec<Value>]) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    for row in rows {
        let bound: Vec<SqlValue> = row.iter().map(json_to_sql).collect();
        stmt.execute(rusqlite::params_from_iter(bound))?;
    }
    Ok(())
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                SqlValue::Integer(integer)
            } else {
                SqlValue::Real(number.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(text) => SqlValue::Text(text.clone()),
        // Nested structures have no column form; store their JSON rendering.
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::Number(integer.into()),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        // Sync payloads are JSON scalars; blobs have no wire form.
        ValueRef::Blob(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Migration, SyncSchema, TableSchema};
    use serde_json::json;

    fn test_schema() -> SyncSchema {
        let items = TableSchema::new("items", vec!["id", "lts", "name"]).unwrap();
        let migrations = vec![Migration::new(1, |tx| {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS items (
                    id TEXT PRIMARY KEY,
                    lts INTEGER,
                    is_unsynced INTEGER NOT NULL DEFAULT 0,
                    name TEXT
                )",
            )?;
            Ok(())
        })];
        SyncSchema::new(vec![items], migrations).unwrap()
    }

    fn open_store() -> LocalStore {
        LocalStore::open_in_memory(&test_schema()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_and_get_all_roundtrip() {
        let store = open_store();
        store
            .execute(
                "INSERT INTO items (id, name) VALUES (?1, ?2)",
                &[json!("a"), json!("first")],
            )
            .await
            .unwrap();

        let rows = store
            .get_all("SELECT id, name, lts, is_unsynced FROM items", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("a"));
        assert_eq!(rows[0]["name"], json!("first"));
        assert_eq!(rows[0]["lts"], Value::Null);
        assert_eq!(rows[0]["is_unsynced"], json!(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_optional_returns_none_for_no_rows() {
        let store = open_store();
        let row = store
            .get_optional("SELECT id FROM items WHERE id = ?1", &[json!("missing")])
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_batch_reuses_statement() {
        let store = open_store();
        store
            .execute_batch(
                "INSERT INTO items (id, name) VALUES (?1, ?2)",
                &[
                    vec![json!("a"), json!("one")],
                    vec![json!("b"), json!("two")],
                    vec![json!("c"), Value::Null],
                ],
            )
            .await
            .unwrap();

        let rows = store
            .get_all("SELECT id FROM items ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_transaction_rolls_back_on_error() {
        let store = open_store();
        let result: Result<()> = store
            .write_transaction(|tx| {
                tx.execute(
                    "INSERT INTO items (id, name) VALUES (?1, ?2)",
                    &[json!("a"), json!("doomed")],
                )?;
                Err(Error::InvalidInput("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let rows = store.get_all("SELECT id FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watch_reemits_on_trigger_table_write() {
        let store = open_store();
        let mut watch = store.watch("SELECT id FROM items ORDER BY id", &[], &["items"]);

        let initial = watch.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        store
            .execute(
                "INSERT INTO items (id, name) VALUES (?1, ?2)",
                &[json!("a"), json!("first")],
            )
            .await
            .unwrap();

        let updated = watch.next().await.unwrap().unwrap();
        assert_eq!(updated.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watch_terminates_on_close() {
        let store = open_store();
        let mut watch = store.watch("SELECT id FROM items", &[], &["items"]);
        let _ = watch.next().await.unwrap().unwrap();

        store.close();
        assert!(watch.next().await.is_none());
        assert!(matches!(
            store.get_all("SELECT id FROM items", &[]).await,
            Err(Error::Closed)
        ));
    }

    #[test]
    fn json_sql_value_bridging() {
        assert_eq!(json_to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(json_to_sql(&json!(7)), SqlValue::Integer(7));
        assert_eq!(json_to_sql(&Value::Null), SqlValue::Null);
        assert_eq!(
            json_to_sql(&json!("text")),
            SqlValue::Text("text".to_string())
        );
        assert_eq!(
            json_to_sql(&json!({"nested": 1})),
            SqlValue::Text("{\"nested\":1}".to_string())
        );
    }
}
