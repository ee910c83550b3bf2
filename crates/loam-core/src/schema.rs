//! Static entity metadata and application migrations.
//!
//! The sync engine consumes schema information as data: for every syncable
//! table an ordered column projection used for both upload and download, and
//! an ordered list of schema migrations applied before any sync activity.

use rusqlite::Transaction;

use crate::error::{Error, Result};
use crate::util::is_safe_identifier;

/// Name of the tombstone entity.
pub const ARCHIVE_TABLE: &str = "archive";
/// Name of the watermark registry table.
pub const SYNCING_TABLE: &str = "syncing_table";
/// Name of the schema version bookkeeping table.
pub const SCHEMA_VERSION_TABLE: &str = "schema_version";

/// Dirty flag column, client-owned and excluded from every wire projection.
pub const UNSYNCED_COLUMN: &str = "is_unsynced";
/// Server-assigned logical timestamp column.
pub const LTS_COLUMN: &str = "lts";
/// Primary key column.
pub const ID_COLUMN: &str = "id";

/// Ordered syncable column projection for one tracked entity.
///
/// Must contain `id` and `lts`; must not contain `is_unsynced`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    columns: Vec<String>,
    joined: String,
}

impl TableSchema {
    /// Creates and validates a table projection.
    pub fn new<S: Into<String>>(name: impl Into<String>, columns: Vec<S>) -> Result<Self> {
        let name = name.into();
        if !is_safe_identifier(&name) {
            return Err(Error::Config(format!("invalid table name: {name:?}")));
        }

        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        for column in &columns {
            if !is_safe_identifier(column) {
                return Err(Error::Config(format!(
                    "invalid column name {column:?} in table {name}"
                )));
            }
            if column == UNSYNCED_COLUMN {
                return Err(Error::Config(format!(
                    "table {name} must not list {UNSYNCED_COLUMN} as syncable"
                )));
            }
        }
        for required in [ID_COLUMN, LTS_COLUMN] {
            if !columns.iter().any(|c| c == required) {
                return Err(Error::Config(format!(
                    "table {name} is missing required column {required}"
                )));
            }
        }

        let joined = columns.join(", ");
        Ok(Self {
            name,
            columns,
            joined,
        })
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered syncable column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Comma-joined column list for direct SQL interpolation.
    #[must_use]
    pub fn joined_columns(&self) -> &str {
        &self.joined
    }
}

/// One versioned schema transition, applied inside a transaction.
pub struct Migration {
    version: i64,
    runner: Box<dyn Fn(&Transaction<'_>) -> Result<()> + Send + Sync>,
}

impl Migration {
    pub fn new(
        version: i64,
        runner: impl Fn(&Transaction<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            version,
            runner: Box::new(runner),
        }
    }

    /// Schema version this migration produces.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    pub(crate) fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        (self.runner)(tx)
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Migration")
            .field("version", &self.version)
            .finish()
    }
}

/// Complete static schema for one application: tracked tables plus migrations.
pub struct SyncSchema {
    tables: Vec<TableSchema>,
    archive: TableSchema,
    migrations: Vec<Migration>,
}

impl SyncSchema {
    /// Validates table uniqueness and strictly increasing migration versions.
    pub fn new(tables: Vec<TableSchema>, migrations: Vec<Migration>) -> Result<Self> {
        for (index, table) in tables.iter().enumerate() {
            if [ARCHIVE_TABLE, SYNCING_TABLE, SCHEMA_VERSION_TABLE].contains(&table.name()) {
                return Err(Error::Config(format!(
                    "table name {} is reserved",
                    table.name()
                )));
            }
            if tables[..index].iter().any(|t| t.name() == table.name()) {
                return Err(Error::Config(format!(
                    "duplicate table name {}",
                    table.name()
                )));
            }
        }

        let mut last_version = 0;
        for migration in &migrations {
            if migration.version() <= last_version {
                return Err(Error::Config(format!(
                    "migration versions must be strictly increasing (saw {} after {})",
                    migration.version(),
                    last_version
                )));
            }
            last_version = migration.version();
        }

        let archive = TableSchema::new(
            ARCHIVE_TABLE,
            vec![ID_COLUMN, "table_name", "data", "data_id", LTS_COLUMN],
        )?;

        Ok(Self {
            tables,
            archive,
            migrations,
        })
    }

    /// Application tables, in declaration order.
    #[must_use]
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Ordered application migrations.
    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Wire projection for `entity`, covering the archive entity as well.
    #[must_use]
    pub fn projection(&self, entity: &str) -> Option<&TableSchema> {
        if entity == ARCHIVE_TABLE {
            return Some(&self.archive);
        }
        self.tables.iter().find(|t| t.name() == entity)
    }

    /// Application table lookup by name (excludes the archive entity).
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name() == name)
    }
}

impl std::fmt::Debug for SyncSchema {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncSchema")
            .field("tables", &self.tables)
            .field("migrations", &self.migrations)
            .finish()
    }
}
