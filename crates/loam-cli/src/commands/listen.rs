use crate::cli::Cli;
use crate::commands::common::open_service;
use crate::error::CliError;

/// Stay connected, printing a line per change notification, until Ctrl-C.
pub async fn run_listen(cli: &Cli) -> Result<(), CliError> {
    let service = open_service(cli).await?;
    let mut changes = service.subscribe_changes();

    println!("Listening for changes (Ctrl-C to stop)...");
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = service.status();
                println!(
                    "change #{} (connected: {}, syncing: {})",
                    *changes.borrow(),
                    status.event_channel_connected,
                    status.syncing
                );
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
