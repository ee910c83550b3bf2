use crate::cli::Cli;
use crate::commands::common::open_service;
use crate::error::CliError;

pub async fn run_status(cli: &Cli) -> Result<(), CliError> {
    let service = open_service(cli).await?;
    let status = service.status();

    println!("initialized:             {}", status.initialized);
    println!("event channel connected: {}", status.event_channel_connected);
    println!("syncing:                 {}", status.syncing);

    let watermarks = service
        .get_all(
            "SELECT entity_name, last_received_lts FROM syncing_table ORDER BY entity_name",
            &[],
        )
        .await?;
    for row in &watermarks {
        let entity = row.get("entity_name").and_then(|v| v.as_str()).unwrap_or("?");
        let lts = row
            .get("last_received_lts")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        println!("watermark {entity}: {lts}");
    }

    service.shutdown().await;
    Ok(())
}
