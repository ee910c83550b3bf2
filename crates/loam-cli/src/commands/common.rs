//! Shared service construction for CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use loam_core::{
    Migration, StaticTokenProvider, SyncOptions, SyncSchema, SyncService, TableSchema,
};

use crate::cli::Cli;
use crate::error::CliError;

/// Demo schema: a single synced `notes` table.
pub fn demo_schema() -> Result<SyncSchema, CliError> {
    let notes = TableSchema::new(
        "notes",
        vec!["id", "lts", "content", "created_at", "updated_at"],
    )?;
    let migrations = vec![Migration::new(1, |tx| {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                lts INTEGER,
                is_unsynced INTEGER NOT NULL DEFAULT 0,
                content TEXT,
                created_at INTEGER,
                updated_at INTEGER
            )",
        )?;
        Ok(())
    })];
    Ok(SyncSchema::new(vec![notes], migrations)?)
}

/// Resolve the base directory for local databases.
pub fn resolve_data_dir(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir
        .or_else(|| dirs::data_local_dir().map(|dir| dir.join("loam")))
        .unwrap_or_else(|| std::env::temp_dir().join("loam"))
}

/// Build and initialize a sync service from CLI flags.
pub async fn open_service(cli: &Cli) -> Result<SyncService, CliError> {
    let options = SyncOptions::new(
        cli.app_id.clone(),
        cli.server_url.clone(),
        resolve_data_dir(cli.data_dir.clone()),
    )?;
    let tokens = Arc::new(StaticTokenProvider::new(cli.token.clone()));
    let service = SyncService::new(options, demo_schema()?, tokens)?;
    service.init(&cli.user_id).await?;
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_schema_builds() {
        let schema = demo_schema().unwrap();
        assert_eq!(schema.tables().len(), 1);
        assert_eq!(schema.tables()[0].name(), "notes");
    }

    #[test]
    fn resolve_data_dir_prefers_explicit_path() {
        let explicit = resolve_data_dir(Some(PathBuf::from("/tmp/somewhere")));
        assert_eq!(explicit, PathBuf::from("/tmp/somewhere"));
    }
}
