//! Per-identity coinbase tags.
//!
//! Each claim identity may have a short tag that is written into its
//! coinbase after the pool tag. Tags come from a [`TagSource`] (a static map
//! from the config, or an HTTP service) through a read-through cache that a
//! background task refreshes. The monitoring API can invalidate an entry
//! when a tag changes upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

const TAG_PATTERN: &str = r"^[A-Za-z0-9 ._:/@#-]{1,32}$";

/// Where tags come from.
#[async_trait]
pub trait TagSource: Send + Sync {
    /// The tag for `identity`, or `None` if it has none.
    async fn fetch(&self, identity: &str) -> Result<Option<String>>;
}

/// Tags from the config file.
pub struct StaticTags {
    tags: HashMap<String, String>,
}

impl StaticTags {
    pub fn new(tags: HashMap<String, String>) -> Self {
        Self { tags }
    }
}

#[async_trait]
impl TagSource for StaticTags {
    async fn fetch(&self, identity: &str) -> Result<Option<String>> {
        Ok(self.tags.get(identity).cloned())
    }
}

#[derive(Deserialize)]
struct TagResponse {
    tag: Option<String>,
}

/// `GET {base}/{identity}` answering `{"tag": "..."}`; 404 means no tag.
pub struct HttpTags {
    http: HttpClient,
    base_url: String,
}

impl HttpTags {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("tags: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TagSource for HttpTags {
    async fn fetch(&self, identity: &str) -> Result<Option<String>> {
        let url = format!("{}/{}", self.base_url, identity);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("tags: {}", e)))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: TagResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::UpstreamUnavailable(format!("tags: {}", e)))?;
                Ok(body.tag)
            }
            status => Err(Error::UpstreamUnavailable(format!("tags: HTTP {}", status))),
        }
    }
}

struct Entry {
    tag: Option<String>,
    used_at: Instant,
}

/// Read-through tag cache.
pub struct TagCache {
    source: Arc<dyn TagSource>,
    entries: RwLock<HashMap<String, Entry>>,
    pattern: Regex,
    lookup_timeout: Duration,
    refresh_interval: Duration,
}

impl TagCache {
    pub fn new(
        source: Arc<dyn TagSource>,
        lookup_timeout: Duration,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let pattern = Regex::new(TAG_PATTERN).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            source,
            entries: RwLock::new(HashMap::new()),
            pattern,
            lookup_timeout,
            refresh_interval,
        })
    }

    fn accept(&self, identity: &str, tag: Option<String>) -> Option<String> {
        match tag {
            Some(tag) if self.pattern.is_match(&tag) => Some(tag),
            Some(tag) => {
                warn!(identity, tag, "Ignoring invalid coinbase tag");
                None
            }
            None => None,
        }
    }

    async fn fetch(&self, identity: &str) -> Result<Option<String>> {
        match timeout(self.lookup_timeout, self.source.fetch(identity)).await {
            Ok(result) => result.map(|tag| self.accept(identity, tag)),
            Err(_) => Err(Error::Timeout("tag lookup")),
        }
    }

    /// Tag for `identity`, fetching it on a miss.
    ///
    /// A failed fetch yields `None` (the pool default) and is retried on the
    /// next lookup.
    pub async fn tag_for(&self, identity: &str) -> Option<String> {
        let cached = self.entries.write().get_mut(identity).map(|entry| {
            entry.used_at = Instant::now();
            entry.tag.clone()
        });
        if let Some(tag) = cached {
            return tag;
        }
        match self.fetch(identity).await {
            Ok(tag) => {
                self.entries.write().insert(
                    identity.to_string(),
                    Entry {
                        tag: tag.clone(),
                        used_at: Instant::now(),
                    },
                );
                tag
            }
            Err(e) => {
                debug!(identity, error = %e, "Tag lookup failed");
                None
            }
        }
    }

    /// Forget `identity`'s tag so the next lookup fetches it again.
    pub fn invalidate(&self, identity: &str) -> bool {
        self.entries.write().remove(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Refetch every cached identity once, dropping ones unused for several
    /// refresh intervals.
    pub async fn refresh(&self) {
        let idle_limit = self.refresh_interval * 4;
        let identities: Vec<String> = {
            let mut entries = self.entries.write();
            entries.retain(|_, e| e.used_at.elapsed() < idle_limit);
            entries.keys().cloned().collect()
        };
        for identity in identities {
            match self.fetch(&identity).await {
                Ok(tag) => {
                    let mut entries = self.entries.write();
                    if let Some(entry) = entries.get_mut(&identity) {
                        entry.tag = tag;
                    }
                }
                Err(e) => debug!(identity, error = %e, "Tag refresh failed, keeping cached"),
            }
        }
    }

    /// Refresh periodically until cancelled.
    pub async fn run_refresh(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }
}
