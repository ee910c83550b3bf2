//! Incremental page-based download engine.
//!
//! For each tracked entity, requests rows with `lts` strictly greater than
//! the stored watermark, applies them in a write transaction, and advances
//! the watermark. Archive pages are applied as targeted deletes instead of
//! upserts. Download is suspended for an entity while local dirty rows are
//! outstanding; push must go first or an unsent edit could be overwritten.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::db::{LocalStore, RowMap, StoreTxn};
use crate::error::{Error, Result};
use crate::schema::{SyncSchema, TableSchema, ARCHIVE_TABLE, ID_COLUMN, LTS_COLUMN};
use crate::sync::transport::SyncTransport;

/// Result of one [`PullEngine::pull_once`] pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullOutcome {
    /// Dirty rows were found mid-pull; the orchestrator should run another
    /// push-then-pull cycle.
    pub rerun_requested: bool,
}

/// Downloads server state for registered entities.
pub struct PullEngine {
    store: LocalStore,
    transport: Arc<dyn SyncTransport>,
    schema: Arc<SyncSchema>,
    page_size: u32,
}

impl PullEngine {
    pub fn new(
        store: LocalStore,
        transport: Arc<dyn SyncTransport>,
        schema: Arc<SyncSchema>,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            transport,
            schema,
            page_size,
        }
    }

    /// Bring every listed entity up to the server's current state.
    ///
    /// Per-entity failures are logged and the next entity proceeds; the
    /// orchestrator's outer repeat logic retries on the next wake.
    pub async fn pull_once(&self, entities: &[String]) -> PullOutcome {
        let mut outcome = PullOutcome::default();
        for entity in entities {
            if self.store.is_closed() {
                break;
            }
            match self.pull_entity(entity).await {
                Ok(rerun) => outcome.rerun_requested |= rerun,
                Err(error) => {
                    warn!(entity, %error, "Pull failed; continuing with next entity");
                }
            }
        }
        outcome
    }

    /// Returns true when download was suspended because dirty rows exist.
    async fn pull_entity(&self, entity: &str) -> Result<bool> {
        if entity != ARCHIVE_TABLE && self.schema.table(entity).is_none() {
            warn!(entity, "Entity has a watermark but no schema; skipping");
            return Ok(false);
        }

        let mut watermark = self.load_watermark(entity).await?;
        loop {
            if self.store.is_closed() {
                return Ok(false);
            }

            let page = self
                .transport
                .fetch_page(entity, watermark, self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let last_lts = page
                .last()
                .and_then(|row| row.get(LTS_COLUMN))
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    Error::Protocol(format!("page row for {entity} is missing {LTS_COLUMN}"))
                })?;

            if !self.apply_page(entity, page, last_lts).await? {
                debug!(entity, "Dirty rows outstanding; suspending download");
                return Ok(true);
            }

            watermark = last_lts;
            if page_len < self.page_size as usize {
                break;
            }
        }
        Ok(false)
    }

    /// Apply one page inside a write transaction; returns false (committing
    /// nothing) when dirty rows were found mid-flight.
    async fn apply_page(&self, entity: &str, page: Vec<RowMap>, last_lts: i64) -> Result<bool> {
        let schema = &self.schema;
        self.store
            .write_transaction(move |tx| {
                let dirty = tx
                    .get_optional(
                        &format!("SELECT COUNT(*) AS dirty FROM {entity} WHERE is_unsynced = 1"),
                        &[],
                    )?
                    .and_then(|row| row.get("dirty").and_then(Value::as_i64))
                    .unwrap_or(0);
                if dirty > 0 {
                    return Ok(false);
                }

                if entity == ARCHIVE_TABLE {
                    apply_tombstones(tx, schema, &page)?;
                } else if let Some(table) = schema.table(entity) {
                    upsert_rows(tx, table, &page)?;
                }

                tx.execute(
                    "INSERT INTO syncing_table (entity_name, last_received_lts)
                     VALUES (?1, ?2)
                     ON CONFLICT(entity_name) DO UPDATE
                     SET last_received_lts = excluded.last_received_lts",
                    &[json!(entity), json!(last_lts)],
                )?;
                Ok(true)
            })
            .await
    }

    async fn load_watermark(&self, entity: &str) -> Result<i64> {
        let row = self
            .store
            .get_optional(
                "SELECT last_received_lts FROM syncing_table WHERE entity_name = ?1",
                &[json!(entity)],
            )
            .await?;
        Ok(row
            .and_then(|r| r.get("last_received_lts").and_then(Value::as_i64))
            .unwrap_or(0))
    }
}

/// Project a server row through the ordered column list; absent columns map
/// to null.
fn project_row(row: &RowMap, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Batch upsert through one prepared statement.
///
/// `is_unsynced` is not in the column list: it defaults to zero on insert
/// and is left untouched on update, so server payloads can never dirty a row.
fn upsert_rows(tx: &StoreTxn<'_>, table: &TableSchema, page: &[RowMap]) -> Result<()> {
    let sql = build_upsert_sql(table);
    let tuples: Vec<Vec<Value>> = page
        .iter()
        .map(|row| project_row(row, table.columns()))
        .collect();
    tx.execute_batch(&sql, &tuples)
}

fn build_upsert_sql(table: &TableSchema) -> String {
    let placeholders = (1..=table.columns().len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = table
        .columns()
        .iter()
        .filter(|column| column.as_str() != ID_COLUMN)
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT({ID_COLUMN}) DO UPDATE SET {updates}",
        table.name(),
        table.joined_columns(),
    )
}

/// Apply archive-channel rows as paired idempotent deletes: the referenced
/// row is removed from its table and the tombstone itself is dropped.
fn apply_tombstones(tx: &StoreTxn<'_>, schema: &SyncSchema, page: &[RowMap]) -> Result<()> {
    for row in page {
        let table_name = str_field(row, "table_name")?;
        let data_id = str_field(row, "data_id")?;
        let archive_id = str_field(row, ID_COLUMN)?;

        // Table names arrive from the wire; only schema-known tables may be
        // interpolated into SQL.
        if let Some(target) = schema.table(table_name) {
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", target.name()),
                &[json!(data_id)],
            )?;
        } else {
            warn!(
                table_name,
                "Tombstone references unknown table; dropping tombstone only"
            );
        }
        tx.execute("DELETE FROM archive WHERE id = ?1", &[json!(archive_id)])?;
    }
    Ok(())
}

fn str_field<'a>(row: &'a RowMap, field: &str) -> Result<&'a str> {
    row.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("tombstone row is missing {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Migration, TableSchema};
    use crate::sync::transport::MockTransport;

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

    struct Fixture {
        store: LocalStore,
        transport: Arc<MockTransport>,
        engine: PullEngine,
    }

    fn fixture(page_size: u32) -> Fixture {
        let schema = Arc::new(test_schema());
        let store = LocalStore::open_in_memory(&schema).unwrap();
        let transport = Arc::new(MockTransport::new());
        let engine = PullEngine::new(
            store.clone(),
            Arc::clone(&transport) as Arc<dyn SyncTransport>,
            schema,
            page_size,
        );
        Fixture {
            store,
            transport,
            engine,
        }
    }

    fn item_row(id: &str, lts: i64, name: &str) -> RowMap {
        let mut row = RowMap::new();
        row.insert("id".to_string(), json!(id));
        row.insert("lts".to_string(), json!(lts));
        row.insert("name".to_string(), json!(name));
        row
    }

    fn tombstone_row(id: &str, table: &str, data_id: &str, lts: i64) -> RowMap {
        let mut row = RowMap::new();
        row.insert("id".to_string(), json!(id));
        row.insert("table_name".to_string(), json!(table));
        row.insert("data_id".to_string(), json!(data_id));
        row.insert("data".to_string(), json!("{}"));
        row.insert("lts".to_string(), json!(lts));
        row
    }

    async fn watermark(store: &LocalStore, entity: &str) -> i64 {
        store
            .get_optional(
                "SELECT last_received_lts FROM syncing_table WHERE entity_name = ?1",
                &[json!(entity)],
            )
            .await
            .unwrap()
            .and_then(|row| row.get("last_received_lts").and_then(Value::as_i64))
            .unwrap_or(0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_page_leaves_watermark_unchanged() {
        let fx = fixture(10);
        let outcome = fx.engine.pull_once(&["items".to_string()]).await;

        assert!(!outcome.rerun_requested);
        assert_eq!(watermark(&fx.store, "items").await, 0);
        assert_eq!(fx.transport.fetch_log(), vec![("items".to_string(), 0)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn short_page_upserts_and_advances_watermark() {
        let fx = fixture(10);
        fx.transport.queue_page(
            "items",
            vec![
                item_row("a", 10, "one"),
                item_row("b", 11, "two"),
                item_row("c", 12, "three"),
            ],
        );

        fx.engine.pull_once(&["items".to_string()]).await;

        let rows = fx
            .store
            .get_all(
                "SELECT id, lts, is_unsynced FROM items ORDER BY lts",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row["is_unsynced"] == json!(0)));
        assert_eq!(watermark(&fx.store, "items").await, 12);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_page_continues_from_last_lts() {
        let fx = fixture(2);
        fx.transport.queue_page(
            "items",
            vec![item_row("a", 10, "one"), item_row("b", 11, "two")],
        );
        fx.transport
            .queue_page("items", vec![item_row("c", 12, "three")]);

        fx.engine.pull_once(&["items".to_string()]).await;

        assert_eq!(
            fx.transport.fetch_log(),
            vec![("items".to_string(), 0), ("items".to_string(), 11)]
        );
        assert_eq!(watermark(&fx.store, "items").await, 12);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn applying_the_same_page_twice_is_idempotent() {
        let fx = fixture(10);
        fx.transport
            .queue_page("items", vec![item_row("a", 10, "one")]);
        fx.engine.pull_once(&["items".to_string()]).await;

        fx.transport
            .queue_page("items", vec![item_row("a", 10, "one")]);
        fx.engine.pull_once(&["items".to_string()]).await;

        let rows = fx
            .store
            .get_all("SELECT id, name, lts FROM items", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("one"));
        assert_eq!(watermark(&fx.store, "items").await, 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_columns_map_to_null() {
        let fx = fixture(10);
        let mut partial = RowMap::new();
        partial.insert("id".to_string(), json!("a"));
        partial.insert("lts".to_string(), json!(10));
        fx.transport.queue_page("items", vec![partial]);

        fx.engine.pull_once(&["items".to_string()]).await;

        let row = fx
            .store
            .get_optional("SELECT name FROM items WHERE id = 'a'", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], Value::Null);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dirty_rows_suspend_download() {
        let fx = fixture(10);
        fx.store
            .execute(
                "INSERT INTO items (id, name, is_unsynced) VALUES ('local', 'edit', 1)",
                &[],
            )
            .await
            .unwrap();
        fx.transport
            .queue_page("items", vec![item_row("a", 10, "one")]);

        let outcome = fx.engine.pull_once(&["items".to_string()]).await;

        assert!(outcome.rerun_requested);
        // Nothing applied, watermark untouched.
        assert_eq!(watermark(&fx.store, "items").await, 0);
        let pulled = fx
            .store
            .get_optional("SELECT id FROM items WHERE id = 'a'", &[])
            .await
            .unwrap();
        assert!(pulled.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstones_delete_row_and_archive_entry() {
        let fx = fixture(10);
        fx.store
            .execute("INSERT INTO items (id, name, lts) VALUES ('c', 'gone', 9)", &[])
            .await
            .unwrap();
        fx.transport.queue_page(
            ARCHIVE_TABLE,
            vec![tombstone_row("t1", "items", "c", 51)],
        );

        fx.engine.pull_once(&[ARCHIVE_TABLE.to_string()]).await;

        assert!(fx
            .store
            .get_optional("SELECT id FROM items WHERE id = 'c'", &[])
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .store
            .get_optional("SELECT id FROM archive WHERE id = 't1'", &[])
            .await
            .unwrap()
            .is_none());
        assert_eq!(watermark(&fx.store, ARCHIVE_TABLE).await, 51);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_apply_is_idempotent() {
        let fx = fixture(10);
        fx.transport.queue_page(
            ARCHIVE_TABLE,
            vec![tombstone_row("t1", "items", "already-gone", 51)],
        );
        fx.engine.pull_once(&[ARCHIVE_TABLE.to_string()]).await;

        fx.transport.queue_page(
            ARCHIVE_TABLE,
            vec![tombstone_row("t1", "items", "already-gone", 51)],
        );
        fx.engine.pull_once(&[ARCHIVE_TABLE.to_string()]).await;

        assert_eq!(watermark(&fx.store, ARCHIVE_TABLE).await, 51);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_for_unknown_table_is_dropped_safely() {
        let fx = fixture(10);
        fx.transport.queue_page(
            ARCHIVE_TABLE,
            vec![tombstone_row("t1", "no_such_table", "x", 5)],
        );

        fx.engine.pull_once(&[ARCHIVE_TABLE.to_string()]).await;

        assert_eq!(watermark(&fx.store, ARCHIVE_TABLE).await, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn page_row_without_lts_aborts_entity() {
        let fx = fixture(10);
        let mut row = RowMap::new();
        row.insert("id".to_string(), json!("a"));
        fx.transport.queue_page("items", vec![row]);

        let outcome = fx.engine.pull_once(&["items".to_string()]).await;

        assert!(!outcome.rerun_requested);
        assert_eq!(watermark(&fx.store, "items").await, 0);
        let rows = fx.store.get_all("SELECT id FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn upsert_sql_excludes_is_unsynced_and_targets_id() {
        let table = TableSchema::new("items", vec!["id", "lts", "name"]).unwrap();
        let sql = build_upsert_sql(&table);
        assert_eq!(
            sql,
            "INSERT INTO items (id, lts, name) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET lts = excluded.lts, name = excluded.name"
        );
    }

    #[test]
    fn project_row_follows_declared_order() {
        let columns = vec!["id".to_string(), "lts".to_string(), "name".to_string()];
        let row = item_row("a", 3, "x");
        assert_eq!(
            project_row(&row, &columns),
            vec![json!("a"), json!(3), json!("x")]
        );
    }
}
