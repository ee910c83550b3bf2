//! Watermark registry for tracked entities.
//!
//! Every entity that participates in sync gets a `syncing_table` row before
//! the first sync cycle touches it. Newly tracked entities are baselined
//! against the server's current high-water mark so historic data is not
//! re-downloaded (and, for the archive entity, pre-existing deletes are not
//! replayed).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::sync::transport::{LatestLts, SyncTransport};
use crate::util::is_safe_identifier;

const BASELINE_ATTEMPTS: u32 = 3;
const BASELINE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Registers entities in `syncing_table`, idempotently.
pub struct TableRegistrar {
    store: LocalStore,
    transport: Arc<dyn SyncTransport>,
}

impl TableRegistrar {
    pub fn new(store: LocalStore, transport: Arc<dyn SyncTransport>) -> Self {
        Self { store, transport }
    }

    /// Ensure `entity` has a watermark row, probing the server for a baseline
    /// only on first registration.
    pub async fn register(&self, entity: &str) -> Result<()> {
        if !is_safe_identifier(entity) {
            return Err(Error::InvalidInput(format!(
                "invalid entity name {entity:?}"
            )));
        }

        let existing = self
            .store
            .get_optional(
                "SELECT last_received_lts FROM syncing_table WHERE entity_name = ?1",
                &[json!(entity)],
            )
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        let baseline = self.baseline_lts(entity).await;
        self.store
            .write_transaction(|tx| {
                // INSERT OR IGNORE keeps concurrent registrars from clashing
                // on the entity_name primary key.
                tx.execute(
                    "INSERT OR IGNORE INTO syncing_table (entity_name, last_received_lts)
                     VALUES (?1, ?2)",
                    &[json!(entity), json!(baseline)],
                )?;
                Ok(())
            })
            .await?;
        debug!(entity, baseline, "Registered entity for sync");
        Ok(())
    }

    async fn baseline_lts(&self, entity: &str) -> i64 {
        for attempt in 1..=BASELINE_ATTEMPTS {
            match self.transport.latest_lts(entity).await {
                Ok(LatestLts::Known(lts)) => return lts,
                Ok(LatestLts::Unknown) => {
                    debug!(entity, "Entity not yet known to server; baseline 0");
                    return 0;
                }
                Err(error) => {
                    warn!(entity, attempt, %error, "latest-lts probe failed");
                    if attempt < BASELINE_ATTEMPTS {
                        tokio::time::sleep(BASELINE_RETRY_DELAY).await;
                    }
                }
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalStore;
    use crate::schema::SyncSchema;
    use crate::sync::transport::MockTransport;

    fn open_store() -> LocalStore {
        let schema = SyncSchema::new(vec![], vec![]).unwrap();
        LocalStore::open_in_memory(&schema).unwrap()
    }

    async fn watermark(store: &LocalStore, entity: &str) -> Option<i64> {
        store
            .get_optional(
                "SELECT last_received_lts FROM syncing_table WHERE entity_name = ?1",
                &[json!(entity)],
            )
            .await
            .unwrap()
            .and_then(|row| row.get("last_received_lts").and_then(|v| v.as_i64()))
    }

    #[tokio::test(start_paused = true)]
    async fn register_baselines_from_server() {
        let store = open_store();
        let transport = Arc::new(MockTransport::new());
        transport.set_latest_lts("archive", 50);

        let registrar = TableRegistrar::new(store.clone(), transport);
        registrar.register("archive").await.unwrap();

        assert_eq!(watermark(&store, "archive").await, Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn register_is_idempotent_and_skips_later_probes() {
        let store = open_store();
        let transport = Arc::new(MockTransport::new());
        transport.set_latest_lts("items", 10);

        let registrar = TableRegistrar::new(store.clone(), Arc::clone(&transport) as _);
        registrar.register("items").await.unwrap();
        transport.set_latest_lts("items", 99);
        registrar.register("items").await.unwrap();

        assert_eq!(watermark(&store, "items").await, Some(10));
        assert_eq!(transport.latest_probes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_entity_baselines_to_zero() {
        let store = open_store();
        let transport = Arc::new(MockTransport::new());

        let registrar = TableRegistrar::new(store.clone(), transport);
        registrar.register("items").await.unwrap();

        assert_eq!(watermark(&store, "items").await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let store = open_store();
        let transport = Arc::new(MockTransport::new());
        transport.set_latest_lts("items", 7);
        transport.fail_latest_lts("items", 2);

        let registrar = TableRegistrar::new(store.clone(), Arc::clone(&transport) as _);
        registrar.register("items").await.unwrap();

        assert_eq!(watermark(&store, "items").await, Some(7));
        assert_eq!(transport.latest_probes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_baseline_to_zero() {
        let store = open_store();
        let transport = Arc::new(MockTransport::new());
        transport.set_latest_lts("items", 7);
        transport.fail_latest_lts("items", 10);

        let registrar = TableRegistrar::new(store.clone(), Arc::clone(&transport) as _);
        registrar.register("items").await.unwrap();

        assert_eq!(watermark(&store, "items").await, Some(0));
        assert_eq!(transport.latest_probes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn register_rejects_unsafe_entity_names() {
        let store = open_store();
        let registrar = TableRegistrar::new(store, Arc::new(MockTransport::new()));
        assert!(registrar.register("items; DROP TABLE items").await.is_err());
    }
}
