//! API client library.
//!
//! Provides a Rust client for the pool's HTTP API, used by the CLI.

pub mod types;

use anyhow::{Context, Result};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;

use types::{PoolState, SessionInfo, TagInvalidation};

/// Default API base URL.
///
/// Port 7785 = ASCII 'M' (77) + 'U' (85).
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7785";

/// HTTP client for the pool API.
pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Client {
    /// Create a client connecting to the default local address.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    /// Create a client connecting to a specific base URL.
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(endpoint))
            .send()
            .await
            .context("failed to connect to pool API")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("API request failed: {}", status);
        }
        response
            .json()
            .await
            .with_context(|| format!("failed to parse {} response", endpoint))
    }

    /// Fetch the pool-wide state snapshot.
    pub async fn get_pool(&self) -> Result<PoolState> {
        self.get_json("pool").await
    }

    /// Fetch the connected sessions.
    pub async fn get_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.get_json("sessions").await
    }

    /// Drop the cached coinbase tag for `identity`.
    pub async fn invalidate_tag(&self, identity: &str) -> Result<TagInvalidation> {
        let response = self
            .http
            .post(self.url(&format!("tags/{}/invalidate", identity)))
            .send()
            .await
            .context("failed to connect to pool API")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("API request failed: {}", status);
        }
        response
            .json()
            .await
            .context("failed to parse invalidation response")
    }

    /// GET an arbitrary endpoint under `/api/v0` and return the body.
    pub async fn get_raw(&self, endpoint: &str) -> Result<String> {
        let response = self
            .http
            .get(self.url(endpoint))
            .send()
            .await
            .context("failed to connect to pool API")?;
        let status = response.status();
        let body = response.text().await.context("failed to read response")?;
        if !status.is_success() {
            anyhow::bail!("API request failed: {}: {}", status, body.trim());
        }
        Ok(body)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
