//! Access to the Aptos fullnode REST interface.
//!
//! Layers, bottom up:
//! - `NodeTransport`: one HTTP GET returning JSON, with errors classified
//!   as retryable or not. `HttpTransport` is the reqwest implementation.
//! - `ResponseCache`: last good response per query signature.
//! - `NodeClient`: retry with exponential backoff + jitter, falling back to
//!   the cache once retries are exhausted.

pub mod cache;
pub mod client;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::ResponseCache;
pub use client::{Fetched, NodeClient, RetryPolicy};
pub use types::{EventHandle, RawEvent};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single HTTP attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response is not valid json: {0}")]
    Decode(String),
}

impl TransportError {
    /// Network faults, timeouts, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            TransportError::Decode(_) => false,
        }
    }
}

/// Errors surfaced by `NodeClient` after retry and cache fallback.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("node unavailable for {query} after {attempts} attempts: {last_error}")]
    NodeUnavailable {
        query: String,
        attempts: u32,
        last_error: TransportError,
    },
    #[error("malformed response for {query}: {reason}")]
    MalformedResponse { query: String, reason: String },
    #[error("not found: {query}")]
    NotFound { query: String },
    #[error("request for {query} rejected with status {status}")]
    Rejected { query: String, status: u16 },
}

impl NodeError {
    pub fn malformed(query: &NodeQuery, reason: impl Into<String>) -> Self {
        NodeError::MalformedResponse {
            query: query.to_string(),
            reason: reason.into(),
        }
    }
}

/// A single JSON GET against the node.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// `path` is relative to the node base URL and starts with `/`.
    async fn get_json(&self, path: &str) -> Result<Value, TransportError>;
}

/// reqwest-backed transport with a bounded per-request timeout.
pub struct HttpTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn get_json(&self, path: &str) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// The node endpoints this crate reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeQuery {
    LedgerInfo,
    Account {
        address: String,
    },
    Resource {
        address: String,
        resource_type: String,
    },
    Events {
        handle: EventHandle,
        start: Option<u64>,
        limit: u64,
    },
    Transactions {
        start: u64,
        limit: u64,
    },
}

impl NodeQuery {
    pub fn path(&self) -> String {
        match self {
            NodeQuery::LedgerInfo => "/".to_string(),
            NodeQuery::Account { address } => format!("/accounts/{address}"),
            NodeQuery::Resource {
                address,
                resource_type,
            } => format!("/accounts/{address}/resource/{resource_type}"),
            NodeQuery::Events {
                handle,
                start,
                limit,
            } => {
                let mut path = format!(
                    "/accounts/{}/events/{}/{}?limit={}",
                    handle.account, handle.resource_type, handle.field_name, limit
                );
                if let Some(start) = start {
                    path.push_str(&format!("&start={start}"));
                }
                path
            }
            NodeQuery::Transactions { start, limit } => {
                format!("/transactions?start={start}&limit={limit}")
            }
        }
    }

    /// Cache key. The path fully identifies the request.
    pub fn signature(&self) -> String {
        self.path()
    }
}

impl std::fmt::Display for NodeQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GET {}", self.path())
    }
}
