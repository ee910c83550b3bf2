use crate::cli::Cli;
use crate::commands::common::open_service;
use crate::error::CliError;

pub async fn run_delete(id: &str, cli: &Cli) -> Result<(), CliError> {
    let service = open_service(cli).await?;
    service.delete("notes", id).await?;
    println!("Deleted {id}");

    service.full_sync().await;
    service.shutdown().await;
    Ok(())
}
