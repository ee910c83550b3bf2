//! loam CLI - offline-first sync engine demo client
//!
//! Writes and deletes work locally at all times; sync runs against the
//! configured server in the background.

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("loam=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Write { json } => commands::write::run_write(json, &cli).await?,
        Commands::Delete { id } => commands::delete::run_delete(id, &cli).await?,
        Commands::List { limit, json } => commands::list::run_list(*limit, *json, &cli).await?,
        Commands::Sync => commands::sync::run_sync(&cli).await?,
        Commands::Status => commands::status::run_status(&cli).await?,
        Commands::Listen => commands::listen::run_listen(&cli).await?,
    }

    Ok(())
}
