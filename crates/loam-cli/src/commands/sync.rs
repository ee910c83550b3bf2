use crate::cli::Cli;
use crate::commands::common::open_service;
use crate::error::CliError;

pub async fn run_sync(cli: &Cli) -> Result<(), CliError> {
    let service = open_service(cli).await?;
    service.full_sync().await;
    println!("Sync completed");
    service.shutdown().await;
    Ok(())
}
