use loam_core::util::unix_timestamp_ms;
use serde_json::{json, Value};

use crate::cli::Cli;
use crate::commands::common::open_service;
use crate::error::CliError;

pub async fn run_write(payload: &str, cli: &Cli) -> Result<(), CliError> {
    let parsed: Value = serde_json::from_str(payload)?;
    let Value::Object(mut row) = parsed else {
        return Err(CliError::NotAnObject(payload.to_string()));
    };

    let now = unix_timestamp_ms();
    row.entry("created_at".to_string()).or_insert(json!(now));
    row.insert("updated_at".to_string(), json!(now));

    let service = open_service(cli).await?;
    let id = service.write("notes", &row).await?;
    println!("{id}");

    service.full_sync().await;
    service.shutdown().await;
    Ok(())
}
