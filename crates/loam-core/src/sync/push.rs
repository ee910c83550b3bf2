//! Batched upload engine for locally dirty rows.
//!
//! Selects dirty windows in deterministic order, uploads them, and applies
//! per-row server verdicts. Before any verdict is applied the dirty window
//! is re-read inside the same transaction and compared to what was sent: a
//! user write landing mid-flight abandons the batch so the newer local edit
//! is never clobbered by the server's response to the stale one.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::db::{LocalStore, RowMap};
use crate::error::Result;
use crate::schema::{SyncSchema, TableSchema};
use crate::sync::transport::{RowVerdict, SyncTransport, VerdictStatus};

/// Result of one [`PushEngine::push_once`] pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushOutcome {
    /// A batch was abandoned (transport failure or mid-flight mutation);
    /// the whole pass should re-run top-down.
    pub retry_requested: bool,
}

/// Uploads dirty rows for registered entities.
pub struct PushEngine {
    store: LocalStore,
    transport: Arc<dyn SyncTransport>,
    schema: Arc<SyncSchema>,
    batch_size: u32,
}

impl PushEngine {
    pub fn new(
        store: LocalStore,
        transport: Arc<dyn SyncTransport>,
        schema: Arc<SyncSchema>,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            transport,
            schema,
            batch_size,
        }
    }

    /// Drain dirty rows across every listed entity.
    pub async fn push_once(&self, entities: &[String]) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        for entity in entities {
            if self.store.is_closed() {
                break;
            }
            match self.push_entity(entity).await {
                Ok(retry) => outcome.retry_requested |= retry,
                Err(error) => {
                    warn!(entity, %error, "Push failed; will retry on next pass");
                    outcome.retry_requested = true;
                }
            }
        }
        outcome
    }

    /// Returns true when the entity's upload should be retried from scratch.
    async fn push_entity(&self, entity: &str) -> Result<bool> {
        let Some(table) = self.schema.projection(entity) else {
            warn!(entity, "Entity has a watermark but no schema; skipping");
            return Ok(false);
        };

        let select = format!(
            "SELECT {} FROM {} WHERE is_unsynced = 1 ORDER BY id LIMIT ?1 OFFSET ?2",
            table.joined_columns(),
            table.name(),
        );

        let mut offset: i64 = 0;
        loop {
            if self.store.is_closed() {
                return Ok(false);
            }

            let batch = self
                .store
                .get_all(&select, &[json!(self.batch_size), json!(offset)])
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            let verdicts = match self.transport.push_batch(entity, &batch).await {
                Ok(verdicts) => verdicts,
                Err(error) => {
                    warn!(entity, %error, "Push upload failed");
                    return Ok(true);
                }
            };

            if !self
                .apply_verdicts(table, &select, offset, &batch, &verdicts)
                .await?
            {
                debug!(entity, "Dirty set changed mid-flight; abandoning batch");
                return Ok(true);
            }

            offset += i64::from(self.batch_size);
            if batch_len < self.batch_size as usize {
                break;
            }
        }
        Ok(false)
    }

    /// Verify the dirty window is unchanged, then apply verdicts, atomically.
    ///
    /// Returns false without touching any row when the window was mutated
    /// while the upload was in flight.
    async fn apply_verdicts(
        &self,
        table: &TableSchema,
        select: &str,
        offset: i64,
        sent: &[RowMap],
        verdicts: &[RowVerdict],
    ) -> Result<bool> {
        let name = table.name();
        self.store
            .write_transaction(|tx| {
                let current = tx.get_all(select, &[json!(self.batch_size), json!(offset)])?;
                if current.as_slice() != sent {
                    return Ok(false);
                }

                for verdict in verdicts {
                    match verdict.status {
                        VerdictStatus::Accepted => {
                            if let Some(lts) = verdict.lts {
                                tx.execute(
                                    &format!(
                                        "UPDATE {name} SET is_unsynced = 0, lts = ?1 WHERE id = ?2"
                                    ),
                                    &[json!(lts), json!(verdict.id)],
                                )?;
                            } else {
                                warn!(
                                    id = %verdict.id,
                                    "Accepted verdict without lts; clearing dirty flag only"
                                );
                                tx.execute(
                                    &format!("UPDATE {name} SET is_unsynced = 0 WHERE id = ?1"),
                                    &[json!(verdict.id)],
                                )?;
                            }
                        }
                        VerdictStatus::Rejected => {
                            // Abandon the local edit; the next pull restores
                            // the server's authoritative version.
                            tx.execute(
                                &format!("UPDATE {name} SET is_unsynced = 0 WHERE id = ?1"),
                                &[json!(verdict.id)],
                            )?;
                        }
                        VerdictStatus::Unknown => {
                            // A row left dirty forever would push in a loop.
                            warn!(
                                id = %verdict.id,
                                reason = verdict.reason.as_deref().unwrap_or(""),
                                "Unknown push verdict; treating as rejected"
                            );
                            tx.execute(
                                &format!("UPDATE {name} SET is_unsynced = 0 WHERE id = ?1"),
                                &[json!(verdict.id)],
                            )?;
                        }
                    }
                }
                Ok(true)
            })
            .await
    }
}
