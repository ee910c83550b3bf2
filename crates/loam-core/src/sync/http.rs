//! HTTP implementation of the server transport.
//!
//! Bearer tokens are fetched from the provider once per request; the
//! `app_id` query parameter travels on every request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::config::{AuthTokenProvider, SyncOptions};
use crate::db::RowMap;
use crate::error::{Error, Result};
use crate::sync::transport::{EventStream, LatestLts, RowVerdict, SyncTransport};
use crate::util::compact_text;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Production transport speaking the server's HTTP protocol.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    tokens: Arc<dyn AuthTokenProvider>,
}

impl HttpTransport {
    /// Creates a transport for the configured server.
    ///
    /// No overall request timeout is set: the event channel is a deliberately
    /// long-lived response body.
    pub fn new(options: &SyncOptions, tokens: Arc<dyn AuthTokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: options.server_url.clone(),
            app_id: options.app_id.clone(),
            tokens,
        })
    }

    async fn bearer(&self) -> Result<String> {
        self.tokens.auth_token().await
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn latest_lts(&self, entity: &str) -> Result<LatestLts> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/latest-lts", self.base_url))
            .query(&[("name", entity), ("app_id", self.app_id.as_str())])
            .bearer_auth(token)
            .send()
            .await?;

        match response.status().as_u16() {
            403 | 404 => Ok(LatestLts::Unknown),
            _ if response.status().is_success() => {
                let body = response.text().await?;
                let payload: LatestLtsResponse = serde_json::from_str(&body).map_err(|error| {
                    Error::Protocol(format!("invalid latest-lts response: {error}"))
                })?;
                Ok(LatestLts::Known(payload.lts))
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn fetch_page(
        &self,
        entity: &str,
        watermark: i64,
        page_size: u32,
    ) -> Result<Vec<RowMap>> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/data", self.base_url))
            .query(&[("name", entity), ("app_id", self.app_id.as_str())])
            .query(&[
                ("lts", watermark.to_string()),
                ("pageSize", page_size.to_string()),
            ])
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body = response.text().await?;
        let payload: PageResponse = serde_json::from_str(&body)
            .map_err(|error| Error::Protocol(format!("invalid data page response: {error}")))?;
        // A null or absent data field means the same as an empty page.
        Ok(payload.data.unwrap_or_default())
    }

    async fn push_batch(&self, entity: &str, rows: &[RowMap]) -> Result<Vec<RowVerdict>> {
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/data", self.base_url))
            .query(&[("app_id", self.app_id.as_str())])
            .bearer_auth(token)
            .json(&build_push_body(entity, rows)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body = response.text().await?;
        let payload: PushResponseBody = serde_json::from_str(&body)
            .map_err(|error| Error::Protocol(format!("invalid push response: {error}")))?;
        Ok(payload.results)
    }

    async fn open_event_stream(&self) -> Result<EventStream> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/events", self.base_url))
            .query(&[("app_id", self.app_id.as_str())])
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.bytes_stream().map_err(Error::from).boxed())
    }
}

async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Error::Status {
        status,
        body: compact_text(&body),
    }
}

#[derive(Debug, Deserialize)]
struct LatestLtsResponse {
    lts: i64,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    data: Option<Vec<RowMap>>,
}

/// Push body with the server's double-encoded row payload: `data` is a JSON
/// string containing the row array, not an inline array.
#[derive(Debug, Serialize)]
struct PushRequestBody<'a> {
    name: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct PushResponseBody {
    results: Vec<RowVerdict>,
}

fn build_push_body<'a>(entity: &'a str, rows: &[RowMap]) -> Result<PushRequestBody<'a>> {
    Ok(PushRequestBody {
        name: entity,
        data: serde_json::to_string(rows)?,
    })
}
