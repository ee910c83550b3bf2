//! Sync orchestrator facade.
//!
//! Owns the local store, guards against concurrent full syncs, runs the
//! event channel listener, and exposes the write/delete operations that
//! keep the sync-critical columns (`lts`, `is_unsynced`) under exclusive
//! engine control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{AuthTokenProvider, SyncOptions};
use crate::db::{LocalStore, QueryWatch, RowMap};
use crate::error::{Error, Result};
use crate::schema::{SyncSchema, ARCHIVE_TABLE, ID_COLUMN, LTS_COLUMN, UNSYNCED_COLUMN};
use crate::sync::events::{classify_line, EventLine, LineBuffer, RECONNECT_DELAY};
use crate::sync::http::HttpTransport;
use crate::sync::pull::PullEngine;
use crate::sync::push::PushEngine;
use crate::sync::registry::TableRegistrar;
use crate::sync::transport::{EventStream, SyncTransport};
use crate::util::new_row_id;

/// Local database file name, scoped per app and user by the directory path.
const DB_FILE_NAME: &str = "helper_sync.db";

/// Snapshot of the engine's observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub initialized: bool,
    pub event_channel_connected: bool,
    pub syncing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Shutdown,
    Disconnected,
}

struct ServiceInner {
    options: SyncOptions,
    schema: Arc<SyncSchema>,
    transport: Arc<dyn SyncTransport>,
    store: StdRwLock<Option<LocalStore>>,
    initialized: AtomicBool,
    syncing: AtomicBool,
    repeat: AtomicBool,
    event_connected: AtomicBool,
    changes: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

/// Facade over the sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    /// Create a service talking HTTP to the configured server.
    pub fn new(
        options: SyncOptions,
        schema: SyncSchema,
        tokens: Arc<dyn AuthTokenProvider>,
    ) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&options, tokens)?);
        Ok(Self::with_transport(options, schema, transport))
    }

    /// Create a service over an explicit transport (tests, custom wiring).
    pub fn with_transport(
        options: SyncOptions,
        schema: SyncSchema,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        let (changes, _) = watch::channel(0u64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServiceInner {
                options,
                schema: Arc::new(schema),
                transport,
                store: StdRwLock::new(None),
                initialized: AtomicBool::new(false),
                syncing: AtomicBool::new(false),
                repeat: AtomicBool::new(false),
                event_connected: AtomicBool::new(false),
                changes,
                shutdown,
                listener: StdMutex::new(None),
            }),
        }
    }

    /// Open the per-user database, run migrations, register entities, and
    /// start the event channel listener.
    pub async fn init(&self, user_id: &str) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            warn!("Sync service already initialized");
            return Ok(());
        }
        match self.init_inner(user_id).await {
            Ok(()) => {
                self.notify_changed();
                Ok(())
            }
            Err(error) => {
                self.inner.initialized.store(false, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    async fn init_inner(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.trim();
        if user_id.is_empty() || user_id.contains(['/', '\\']) || user_id.starts_with('.') {
            return Err(Error::InvalidInput(
                "user_id must be a plain directory name".to_string(),
            ));
        }

        let dir = self
            .inner
            .options
            .base_dir
            .join(&self.inner.options.app_id)
            .join(user_id);
        std::fs::create_dir_all(&dir)?;

        let store = LocalStore::open(dir.join(DB_FILE_NAME), &self.inner.schema)?;
        *self.inner.store.write().unwrap() = Some(store.clone());
        info!(path = %dir.join(DB_FILE_NAME).display(), "Opened sync database");

        let registrar = TableRegistrar::new(store, Arc::clone(&self.inner.transport));
        registrar.register(ARCHIVE_TABLE).await?;
        for table in self.inner.schema.tables() {
            registrar.register(table.name()).await?;
        }

        let _ = self.inner.shutdown.send(false);
        self.spawn_event_listener();
        Ok(())
    }

    /// Cancel the event channel, close the store, and let any in-flight sync
    /// exit between pages.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let listener = self.inner.listener.lock().unwrap().take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }
        let store = self.inner.store.write().unwrap().take();
        if let Some(store) = store {
            store.close();
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        self.inner.event_connected.store(false, Ordering::SeqCst);
        self.notify_changed();
        info!("Sync service shut down");
    }

    // ------------------------------------------------------------------
    // Status & notifications
    // ------------------------------------------------------------------

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn event_channel_connected(&self) -> bool {
        self.inner.event_connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            initialized: self.is_initialized(),
            event_channel_connected: self.event_channel_connected(),
            syncing: self.is_syncing(),
        }
    }

    /// Versioned "something changed" signal; the value only ever increases.
    #[must_use]
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    fn notify_changed(&self) {
        self.inner
            .changes
            .send_modify(|version| *version = version.wrapping_add(1));
    }

    fn store(&self) -> Result<LocalStore> {
        self.inner
            .store
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::Closed)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_all(&self, sql: &str, params: &[Value]) -> Result<Vec<RowMap>> {
        self.store()?.get_all(sql, params).await
    }

    pub async fn get_optional(&self, sql: &str, params: &[Value]) -> Result<Option<RowMap>> {
        self.store()?.get_optional(sql, params).await
    }

    /// Watched query; re-emits whenever a trigger table is mutated.
    pub fn watch(
        &self,
        sql: impl Into<String>,
        params: &[Value],
        trigger_tables: &[&str],
    ) -> Result<QueryWatch> {
        Ok(self.store()?.watch(sql, params, trigger_tables))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Upsert a row and mark it dirty for upload.
    ///
    /// A missing `id` gets a fresh random identifier; a caller-provided
    /// `lts` is stripped, since that column is server-owned. Returns the
    /// row id.
    pub async fn write(&self, table: &str, data: &RowMap) -> Result<String> {
        let Some(schema_table) = self.inner.schema.table(table) else {
            return Err(Error::InvalidInput(format!("unknown table {table}")));
        };

        let mut row = data.clone();
        row.remove(LTS_COLUMN);
        row.remove(UNSYNCED_COLUMN);
        let id = match row.remove(ID_COLUMN) {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => new_row_id(),
        };

        let mut columns = Vec::with_capacity(row.len());
        let mut values = vec![json!(id)];
        for (column, value) in &row {
            if !schema_table.columns().iter().any(|c| c == column) {
                return Err(Error::InvalidInput(format!(
                    "unknown column {column} for table {table}"
                )));
            }
            columns.push(column.clone());
            values.push(value.clone());
        }

        let sql = build_dirty_upsert_sql(schema_table.name(), &columns);
        self.store()?.execute(&sql, &values).await?;
        debug!(table, id, "Stored local write");

        self.request_sync();
        Ok(id)
    }

    /// Delete a row, recording a tombstone in the same transaction.
    ///
    /// Deleting an absent row is a logged no-op.
    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let Some(schema_table) = self.inner.schema.table(table) else {
            return Err(Error::InvalidInput(format!("unknown table {table}")));
        };

        let store = self.store()?;
        let table_name = schema_table.name().to_string();
        let archive_id = new_row_id();
        let row_id = id.to_string();

        let existed = store
            .write_transaction(move |tx| {
                let Some(row) = tx.get_optional(
                    &format!("SELECT * FROM {table_name} WHERE id = ?1"),
                    &[json!(row_id)],
                )?
                else {
                    return Ok(false);
                };

                let payload = serde_json::to_string(&row)?;
                tx.execute(
                    "INSERT INTO archive (id, table_name, data, data_id, is_unsynced)
                     VALUES (?1, ?2, ?3, ?4, 1)",
                    &[json!(archive_id), json!(table_name), json!(payload), json!(row_id)],
                )?;
                tx.execute(
                    &format!("DELETE FROM {table_name} WHERE id = ?1"),
                    &[json!(row_id)],
                )?;
                Ok(true)
            })
            .await?;

        if existed {
            debug!(table, id, "Archived and deleted row");
        } else {
            info!(table, id, "Delete requested for missing row; nothing archived");
        }

        self.request_sync();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync loop
    // ------------------------------------------------------------------

    /// Fire-and-forget sync trigger.
    pub fn request_sync(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            service.full_sync().await;
        });
    }

    /// One push-then-pull pass over every registered entity.
    ///
    /// Re-entrant calls set a repeat flag instead of running concurrently;
    /// bursts of triggers collapse into at most one extra cycle.
    pub async fn full_sync(&self) {
        if !self.is_initialized() {
            return;
        }
        if self.inner.syncing.swap(true, Ordering::SeqCst) {
            self.inner.repeat.store(true, Ordering::SeqCst);
            return;
        }

        if let Err(error) = self.sync_cycle().await {
            warn!(%error, "Sync cycle failed");
        }
        if self.inner.repeat.swap(false, Ordering::SeqCst) {
            if let Err(error) = self.sync_cycle().await {
                warn!(%error, "Coalesced sync cycle failed");
            }
        }

        self.inner.syncing.store(false, Ordering::SeqCst);
    }

    async fn sync_cycle(&self) -> Result<()> {
        let store = self.store()?;
        self.notify_changed();

        let entities = self.tracked_entities(&store).await?;
        trace!(?entities, "Starting sync cycle");

        let push = PushEngine::new(
            store.clone(),
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.schema),
            self.inner.options.push_batch_size,
        );
        let pushed = push.push_once(&entities).await;
        if pushed.retry_requested && !store.is_closed() {
            // One more top-down pass; a persistently failing server waits
            // for the next wake instead of busy-looping here.
            push.push_once(&entities).await;
        }

        let pull = PullEngine::new(
            store.clone(),
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.schema),
            self.inner.options.page_size,
        );
        let pulled = pull.pull_once(&entities).await;
        if pulled.rerun_requested {
            self.inner.repeat.store(true, Ordering::SeqCst);
        }

        self.notify_changed();
        Ok(())
    }

    async fn tracked_entities(&self, store: &LocalStore) -> Result<Vec<String>> {
        let rows = store
            .get_all(
                "SELECT entity_name FROM syncing_table ORDER BY entity_name",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                row.get("entity_name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Event channel listener
    // ------------------------------------------------------------------

    fn spawn_event_listener(&self) {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            service.event_loop().await;
        });
        *self.inner.listener.lock().unwrap() = Some(handle);
    }

    async fn event_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.inner.transport.open_event_stream().await {
                Ok(stream) => {
                    info!("Event channel connected");
                    self.inner.event_connected.store(true, Ordering::SeqCst);
                    self.notify_changed();
                    self.request_sync();

                    let ended = self.consume_events(stream, &mut shutdown).await;

                    self.inner.event_connected.store(false, Ordering::SeqCst);
                    self.notify_changed();
                    if ended == StreamEnd::Shutdown {
                        break;
                    }
                    debug!("Event channel disconnected");
                }
                Err(error) => {
                    debug!(%error, "Event channel connect failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn consume_events(
        &self,
        mut stream: EventStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let mut buffer = LineBuffer::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return StreamEnd::Shutdown;
                    }
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            buffer.extend(&bytes);
                            while let Some(line) = buffer.next_line() {
                                self.handle_event_line(&line);
                            }
                        }
                        Some(Err(error)) => {
                            debug!(%error, "Event stream error");
                            return StreamEnd::Disconnected;
                        }
                        None => return StreamEnd::Disconnected,
                    }
                }
            }
        }
    }

    fn handle_event_line(&self, line: &str) {
        match classify_line(line) {
            EventLine::Data(payload) => {
                debug!(payload = %payload, "Change event received");
                self.request_sync();
            }
            EventLine::Heartbeat => trace!("Event channel heartbeat"),
            EventLine::Delimiter | EventLine::Other => {}
        }
    }
}

fn build_dirty_upsert_sql(table: &str, columns: &[String]) -> String {
    let mut insert_cols = vec![ID_COLUMN.to_string()];
    insert_cols.extend(columns.iter().cloned());
    let placeholders = (1..=insert_cols.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut updates: Vec<String> = columns
        .iter()
        .map(|column| format!("{column} = excluded.{column}"))
        .collect();
    updates.push(format!("{UNSYNCED_COLUMN} = 1"));
    format!(
        "INSERT INTO {table} ({}, {UNSYNCED_COLUMN}) VALUES ({placeholders}, 1) \
         ON CONFLICT({ID_COLUMN}) DO UPDATE SET {}",
        insert_cols.join(", "),
        updates.join(", "),
    )
}
