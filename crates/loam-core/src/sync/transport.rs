//! Server transport seam.
//!
//! The engines talk to the server through [`SyncTransport`] so they can be
//! exercised against [`MockTransport`] without a network. The production
//! implementation lives in [`crate::sync::http`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::db::RowMap;
use crate::error::{Error, Result};

/// Raw byte stream from the server's event channel.
pub type EventStream = BoxStream<'static, Result<Bytes>>;

/// Outcome of a `latest-lts` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatestLts {
    /// The server's current high-water mark for the entity.
    Known(i64),
    /// Entity not yet known to the server (403/404); baseline to zero.
    Unknown,
}

/// Per-row status in a push response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Accepted,
    Rejected,
    /// Anything the server sends that this client does not recognize.
    #[serde(other)]
    Unknown,
}

/// Per-row verdict returned by the push endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowVerdict {
    pub id: String,
    pub status: VerdictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RowVerdict {
    pub fn accepted(id: impl Into<String>, lts: i64) -> Self {
        Self {
            id: id.into(),
            status: VerdictStatus::Accepted,
            lts: Some(lts),
            reason: None,
        }
    }

    pub fn rejected(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: VerdictStatus::Rejected,
            lts: None,
            reason: Some(reason.into()),
        }
    }
}

/// The four server operations the sync engine depends on.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Server high-water mark used to baseline a newly tracked entity.
    async fn latest_lts(&self, entity: &str) -> Result<LatestLts>;

    /// One page of rows with `lts` strictly greater than `watermark`.
    ///
    /// An empty vec means no more pages.
    async fn fetch_page(
        &self,
        entity: &str,
        watermark: i64,
        page_size: u32,
    ) -> Result<Vec<RowMap>>;

    /// Upload one batch of dirty rows, returning per-row verdicts.
    async fn push_batch(&self, entity: &str, rows: &[RowMap]) -> Result<Vec<RowVerdict>>;

    /// Open the long-lived change-notification stream.
    async fn open_event_stream(&self) -> Result<EventStream>;
}

type PushHook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Scriptable in-memory transport for tests.
///
/// Unscripted push batches fail (as an unreachable server would), unscripted
/// pages are empty, and unscripted entities report `latest-lts` as unknown.
#[derive(Default)]
pub struct MockTransport {
    latest: Mutex<HashMap<String, i64>>,
    latest_failures: Mutex<HashMap<String, u32>>,
    pages: Mutex<HashMap<String, VecDeque<Vec<RowMap>>>>,
    fetch_log: Mutex<Vec<(String, i64)>>,
    pushes: Mutex<Vec<(String, Vec<RowMap>)>>,
    verdict_queue: Mutex<VecDeque<Vec<RowVerdict>>>,
    push_hook: Mutex<Option<PushHook>>,
    event_streams: Mutex<VecDeque<EventStream>>,
    events_opened: AtomicUsize,
    latest_probes: AtomicI64,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the server high-water mark for an entity.
    pub fn set_latest_lts(&self, entity: &str, lts: i64) {
        self.latest.lock().unwrap().insert(entity.to_string(), lts);
    }

    /// Make the next `times` `latest-lts` probes for an entity fail.
    pub fn fail_latest_lts(&self, entity: &str, times: u32) {
        self.latest_failures
            .lock()
            .unwrap()
            .insert(entity.to_string(), times);
    }

    /// Queue one page of rows for an entity; pages are served in order.
    pub fn queue_page(&self, entity: &str, rows: Vec<RowMap>) {
        self.pages
            .lock()
            .unwrap()
            .entry(entity.to_string())
            .or_default()
            .push_back(rows);
    }

    /// Queue verdicts for the next push batch (served in order across entities).
    pub fn queue_verdicts(&self, verdicts: Vec<RowVerdict>) {
        self.verdict_queue.lock().unwrap().push_back(verdicts);
    }

    /// Run a side effect while a push batch is "in flight".
    pub fn set_push_hook(
        &self,
        hook: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        *self.push_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Clear the push side effect.
    pub fn clear_push_hook(&self) {
        *self.push_hook.lock().unwrap() = None;
    }

    /// Queue an event stream delivering the given lines, then ending.
    pub fn queue_event_lines(&self, lines: &[&str]) {
        let mut payload = String::new();
        for line in lines {
            payload.push_str(line);
            payload.push('\n');
        }
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from(payload))];
        let stream: EventStream = Box::pin(futures_util::stream::iter(chunks));
        self.event_streams.lock().unwrap().push_back(stream);
    }

    /// Queue an event stream that connects and then stays silent.
    pub fn queue_pending_event_stream(&self) {
        let stream: EventStream = Box::pin(futures_util::stream::pending());
        self.event_streams.lock().unwrap().push_back(stream);
    }

    /// Every `(entity, watermark)` pair fetch_page was called with.
    #[must_use]
    pub fn fetch_log(&self) -> Vec<(String, i64)> {
        self.fetch_log.lock().unwrap().clone()
    }

    /// Every pushed batch, in upload order.
    #[must_use]
    pub fn pushed_batches(&self) -> Vec<(String, Vec<RowMap>)> {
        self.pushes.lock().unwrap().clone()
    }

    /// How many times the event channel was opened.
    #[must_use]
    pub fn events_opened(&self) -> usize {
        self.events_opened.load(Ordering::SeqCst)
    }

    /// How many `latest-lts` probes were made.
    #[must_use]
    pub fn latest_probes(&self) -> i64 {
        self.latest_probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn latest_lts(&self, entity: &str) -> Result<LatestLts> {
        self.latest_probes.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.latest_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(entity) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Status {
                        status: 500,
                        body: "scripted failure".to_string(),
                    });
                }
            }
        }
        Ok(self
            .latest
            .lock()
            .unwrap()
            .get(entity)
            .copied()
            .map_or(LatestLts::Unknown, LatestLts::Known))
    }

    async fn fetch_page(
        &self,
        entity: &str,
        watermark: i64,
        _page_size: u32,
    ) -> Result<Vec<RowMap>> {
        self.fetch_log
            .lock()
            .unwrap()
            .push((entity.to_string(), watermark));
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get_mut(entity)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }

    async fn push_batch(&self, entity: &str, rows: &[RowMap]) -> Result<Vec<RowVerdict>> {
        let hook = {
            let guard = self.push_hook.lock().unwrap();
            guard.as_ref().map(|hook| hook())
        };
        if let Some(side_effect) = hook {
            side_effect.await;
        }

        self.pushes
            .lock()
            .unwrap()
            .push((entity.to_string(), rows.to_vec()));

        self.verdict_queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Status {
                status: 503,
                body: "no verdicts scripted".to_string(),
            })
    }

    async fn open_event_stream(&self) -> Result<EventStream> {
        self.events_opened.fetch_add(1, Ordering::SeqCst);
        self.event_streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Status {
                status: 503,
                body: "no event stream scripted".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str) -> RowMap {
        let mut map = RowMap::new();
        map.insert("id".to_string(), json!(id));
        map.insert("lts".to_string(), json!(1));
        map
    }

    #[tokio::test]
    async fn latest_lts_defaults_to_unknown() {
        let transport = MockTransport::new();
        assert_eq!(
            transport.latest_lts("items").await.unwrap(),
            LatestLts::Unknown
        );

        transport.set_latest_lts("items", 42);
        assert_eq!(
            transport.latest_lts("items").await.unwrap(),
            LatestLts::Known(42)
        );
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let transport = MockTransport::new();
        transport.set_latest_lts("items", 7);
        transport.fail_latest_lts("items", 2);

        assert!(transport.latest_lts("items").await.is_err());
        assert!(transport.latest_lts("items").await.is_err());
        assert_eq!(
            transport.latest_lts("items").await.unwrap(),
            LatestLts::Known(7)
        );
    }

    #[tokio::test]
    async fn pages_are_served_in_order_then_empty() {
        let transport = MockTransport::new();
        transport.queue_page("items", vec![row("a")]);
        transport.queue_page("items", vec![row("b")]);

        assert_eq!(transport.fetch_page("items", 0, 10).await.unwrap().len(), 1);
        assert_eq!(transport.fetch_page("items", 1, 10).await.unwrap().len(), 1);
        assert!(transport.fetch_page("items", 1, 10).await.unwrap().is_empty());
        assert_eq!(
            transport.fetch_log(),
            vec![
                ("items".to_string(), 0),
                ("items".to_string(), 1),
                ("items".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn unscripted_push_fails() {
        let transport = MockTransport::new();
        let result = transport.push_batch("items", &[row("a")]).await;
        assert!(matches!(result, Err(Error::Status { status: 503, .. })));
        assert_eq!(transport.pushed_batches().len(), 1);
    }

    #[test]
    fn verdict_status_parses_unknown_strings() {
        let verdict: RowVerdict =
            serde_json::from_str(r#"{"id": "a", "status": "quarantined"}"#).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Unknown);

        let verdict: RowVerdict =
            serde_json::from_str(r#"{"id": "a", "status": "accepted", "lts": 13}"#).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Accepted);
        assert_eq!(verdict.lts, Some(13));
    }
}
