//! Block template source.
//!
//! The pool takes work from a Bitcoin node over JSON-RPC
//! (`getblocktemplate`) and hands solved blocks back (`submitblock`).
//! [`TemplateSource`] is the seam; [`BitcoindRpc`] is the production
//! implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::job::BlockTemplate;
use crate::tracing::prelude::*;

/// What the node said about a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSubmission {
    Accepted,
    /// Rejected, with the node's reason (e.g. `"high-hash"`)
    Rejected(String),
}

/// Where jobs come from and solved blocks go.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch_template(&self) -> Result<BlockTemplate>;

    /// Submit a block, consensus-serialized as hex.
    async fn submit_block(&self, block_hex: String) -> Result<BlockSubmission>;
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

/// bitcoind JSON-RPC over HTTP with basic auth.
pub struct BitcoindRpc {
    http: HttpClient,
    url: String,
    username: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl BitcoindRpc {
    pub fn new(
        url: String,
        username: Option<String>,
        password: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("upstream: {}", e)))?;
        Ok(Self {
            http,
            url,
            username,
            password,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut request = self.http.post(&self.url).json(&body);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{}: {}", method, e)))?;
        let status = response.status();
        // bitcoind answers RPC errors with HTTP 500 and a JSON body, so only
        // give up on bodies that do not parse.
        let reply: RpcResponse = response.json().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("{}: HTTP {}: {}", method, status, e))
        })?;
        if let Some(error) = reply.error {
            return Err(Error::UpstreamUnavailable(format!(
                "{}: RPC error {}: {}",
                method, error.code, error.message
            )));
        }
        trace!(method, id, "RPC call complete");
        Ok(reply.result)
    }
}

#[async_trait]
impl TemplateSource for BitcoindRpc {
    async fn fetch_template(&self) -> Result<BlockTemplate> {
        let result = self
            .call("getblocktemplate", json!([{ "rules": ["segwit"] }]))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::UpstreamUnavailable(format!("getblocktemplate: {}", e)))
    }

    async fn submit_block(&self, block_hex: String) -> Result<BlockSubmission> {
        let result = self.call("submitblock", json!([block_hex])).await?;
        Ok(match result {
            Value::Null => BlockSubmission::Accepted,
            Value::String(reason) => BlockSubmission::Rejected(reason),
            other => BlockSubmission::Rejected(other.to_string()),
        })
    }
}
