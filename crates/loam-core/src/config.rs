//! Engine configuration and the per-request auth token seam.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::util::is_http_url;

/// Default page size for incremental pulls.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;
/// Default batch size for dirty-row pushes.
pub const DEFAULT_PUSH_BATCH_SIZE: u32 = 100;

/// Static configuration for one sync engine instance.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Multi-tenant discriminator sent on every request.
    pub app_id: String,
    /// Base URL for all sync endpoints.
    pub server_url: String,
    /// Directory under which per-user databases live
    /// (`<base_dir>/<app_id>/<user_id>/helper_sync.db`).
    pub base_dir: PathBuf,
    /// Rows requested per pull page.
    pub page_size: u32,
    /// Dirty rows uploaded per push batch.
    pub push_batch_size: u32,
}

impl SyncOptions {
    /// Creates options with canonical page and batch sizes.
    pub fn new(
        app_id: impl Into<String>,
        server_url: impl Into<String>,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let app_id = app_id.into();
        if app_id.trim().is_empty() {
            return Err(Error::Config("app_id must not be empty".to_string()));
        }
        let server_url = normalize_server_url(server_url.into())?;
        Ok(Self {
            app_id,
            server_url,
            base_dir: base_dir.into(),
            page_size: DEFAULT_PAGE_SIZE,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
        })
    }
}

fn normalize_server_url(raw: String) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("server_url must not be empty".to_string()));
    }
    if !is_http_url(trimmed) {
        return Err(Error::Config(
            "server_url must include http:// or https://".to_string(),
        ));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Provider of short-lived bearer tokens.
///
/// Invoked once per HTTP request; the engine never caches tokens.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    /// Returns a bearer token valid for the next request.
    async fn auth_token(&self) -> Result<String>;
}

/// Token provider returning a fixed token, for tests and simple deployments.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn auth_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
