//! loam-core - Offline-first bidirectional sync engine
//!
//! This crate keeps an embedded SQLite store readable and writable at all
//! times and reconciles it with an authoritative server in the background:
//! incremental pull keyed by a per-table logical timestamp sequence, batched
//! push of locally dirty rows, tombstone propagation for deletes, and a
//! long-lived event channel that wakes the sync loop.

pub mod config;
pub mod db;
pub mod error;
pub mod schema;
pub mod sync;
pub mod util;

pub use config::{AuthTokenProvider, StaticTokenProvider, SyncOptions};
pub use db::{LocalStore, QueryWatch, RowMap, StoreTxn};
pub use error::{Error, Result};
pub use schema::{Migration, SyncSchema, TableSchema, ARCHIVE_TABLE, SYNCING_TABLE};
pub use sync::http::HttpTransport;
pub use sync::pull::{PullEngine, PullOutcome};
pub use sync::push::{PushEngine, PushOutcome};
pub use sync::registry::TableRegistrar;
pub use sync::service::{SyncService, SyncStatus};
pub use sync::transport::{
    EventStream, LatestLts, MockTransport, RowVerdict, SyncTransport, VerdictStatus,
};
