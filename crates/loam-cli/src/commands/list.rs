use serde_json::json;

use crate::cli::Cli;
use crate::commands::common::open_service;
use crate::error::CliError;

pub async fn run_list(limit: usize, as_json: bool, cli: &Cli) -> Result<(), CliError> {
    let service = open_service(cli).await?;
    let rows = service
        .get_all(
            "SELECT id, content, lts, is_unsynced, updated_at FROM notes
             ORDER BY updated_at DESC LIMIT ?1",
            &[json!(limit as i64)],
        )
        .await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("No notes.");
    } else {
        for row in &rows {
            let id = row.get("id").and_then(|v| v.as_str()).unwrap_or("?");
            let content = row.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let dirty = row
                .get("is_unsynced")
                .and_then(|v| v.as_i64())
                .unwrap_or(0)
                != 0;
            let marker = if dirty { "*" } else { " " };
            println!("{marker} {id}  {content}");
        }
    }

    service.shutdown().await;
    Ok(())
}
