use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "loam")]
#[command(about = "Offline-first sync engine demo client")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Sync server base URL
    #[arg(long, global = true, value_name = "URL", default_value = "http://localhost:8080")]
    pub server_url: String,

    /// Application identifier sent on every request
    #[arg(long, global = true, value_name = "ID", default_value = "loam-demo")]
    pub app_id: String,

    /// User identifier (selects the local database)
    #[arg(long, global = true, value_name = "ID", default_value = "default")]
    pub user_id: String,

    /// Bearer token for the sync server
    #[arg(long, global = true, value_name = "TOKEN", default_value = "")]
    pub token: String,

    /// Base directory for local databases
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a note (upsert by id, marked for upload)
    Write {
        /// Row payload as a JSON object, e.g. '{"content": "hello"}'
        json: String,
    },
    /// Delete a note, recording a tombstone for propagation
    Delete {
        /// Note ID
        id: String,
    },
    /// List local notes
    List {
        /// Number of notes to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one full push-then-pull sync pass
    Sync,
    /// Show sync status and per-entity watermarks
    Status,
    /// Stay connected and print change notifications until interrupted
    Listen,
}
