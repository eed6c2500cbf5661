//! Resilient fetch client.
//!
//! Retry schedule: delay(n) = min(initial · 2ⁿ · (1 + jitter), max), with
//! jitter drawn from [-j, j], for n = 0..max_retries. Only transport errors
//! classified as retryable are retried. Once retries run out the last cached
//! response for the query is returned marked stale; without one the call
//! fails with `NodeUnavailable`.

use super::cache::ResponseCache;
use super::types::{json_u64, EventHandle, RawEvent};
use super::{NodeError, NodeQuery, NodeTransport, TransportError};
use crate::config::RetryConfig;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` (0-based) for a given jitter sample.
    /// The sample is clamped to [-jitter, jitter].
    pub fn delay_for(&self, retry: u32, jitter_sample: f64) -> Duration {
        let sample = jitter_sample.clamp(-self.jitter, self.jitter);
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(retry.min(62) as i32);
        let secs = (base * (1.0 + sample)).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay before retry `retry` with a freshly sampled jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        self.delay_for(retry, sample)
    }
}

/// A response, flagged stale when served from the fallback cache.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub data: T,
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
}

impl<T> Fetched<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            data: f(self.data),
            stale: self.stale,
            fetched_at: self.fetched_at,
        }
    }
}

/// Node client with retry and cache fallback. Owns its cache.
pub struct NodeClient {
    transport: Arc<dyn NodeTransport>,
    retry: RetryPolicy,
    cache: ResponseCache,
    /// Last ledger-info read was served from cache.
    degraded: AtomicBool,
}

impl NodeClient {
    pub fn new(transport: Arc<dyn NodeTransport>, retry: RetryPolicy, cache: ResponseCache) -> Self {
        Self {
            transport,
            retry,
            cache,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Whether the node is currently being served from cache.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Fetch `query`, retrying transient failures and falling back to cache.
    pub async fn fetch(&self, query: &NodeQuery) -> Result<Fetched<Value>, NodeError> {
        let path = query.path();
        let signature = query.signature();
        let mut retry = 0u32;

        loop {
            let err = match self.transport.get_json(&path).await {
                Ok(data) => {
                    self.cache.insert(&signature, data.clone());
                    return Ok(Fetched {
                        data,
                        stale: false,
                        fetched_at: Utc::now(),
                    });
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(classify(query, err));
            }

            if retry >= self.retry.max_retries {
                return self.fallback(query, &signature, retry + 1, err);
            }

            let delay = self.retry.backoff(retry);
            debug!(
                query = %query,
                attempt = retry + 1,
                max_attempts = self.retry.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "node request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    fn fallback(
        &self,
        query: &NodeQuery,
        signature: &str,
        attempts: u32,
        last_error: TransportError,
    ) -> Result<Fetched<Value>, NodeError> {
        match self.cache.get(signature) {
            Some(cached) => {
                warn!(
                    query = %query,
                    attempts = attempts,
                    cached_at = %cached.fetched_at,
                    error = %last_error,
                    "node unavailable, serving cached response"
                );
                Ok(Fetched {
                    data: cached.data,
                    stale: true,
                    fetched_at: cached.fetched_at,
                })
            }
            None => {
                error!(
                    query = %query,
                    attempts = attempts,
                    error = %last_error,
                    "node unavailable and no cached response"
                );
                Err(NodeError::NodeUnavailable {
                    query: query.to_string(),
                    attempts,
                    last_error,
                })
            }
        }
    }

    /// Current ledger version from `GET /`.
    pub async fn ledger_version(&self) -> Result<Fetched<u64>, NodeError> {
        let query = NodeQuery::LedgerInfo;
        let fetched = self.fetch(&query).await?;
        self.degraded.store(fetched.stale, Ordering::Relaxed);
        let version = fetched
            .data
            .get("ledger_version")
            .and_then(json_u64)
            .ok_or_else(|| NodeError::malformed(&query, "missing ledger_version"))?;
        Ok(fetched.map(|_| version))
    }

    /// Whether `address` exists on chain.
    pub async fn account_exists(&self, address: &str) -> Result<bool, NodeError> {
        let query = NodeQuery::Account {
            address: address.to_string(),
        };
        match self.fetch(&query).await {
            Ok(_) => Ok(true),
            Err(NodeError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// An account resource, or `None` if the account does not hold it.
    pub async fn resource(
        &self,
        address: &str,
        resource_type: &str,
    ) -> Result<Option<Value>, NodeError> {
        let query = NodeQuery::Resource {
            address: address.to_string(),
            resource_type: resource_type.to_string(),
        };
        match self.fetch(&query).await {
            Ok(fetched) => Ok(Some(fetched.data)),
            Err(NodeError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Events of one handle, starting at sequence number `start` if given.
    pub async fn events(
        &self,
        handle: &EventHandle,
        start: Option<u64>,
        limit: u64,
    ) -> Result<Fetched<Vec<RawEvent>>, NodeError> {
        let query = NodeQuery::Events {
            handle: handle.clone(),
            start,
            limit,
        };
        let fetched = self.fetch(&query).await?;
        let items = fetched
            .data
            .as_array()
            .ok_or_else(|| NodeError::malformed(&query, "expected an array of events"))?;
        let events = items
            .iter()
            .map(|item| RawEvent::from_handle_event(handle, item))
            .collect();
        Ok(Fetched {
            data: events,
            stale: fetched.stale,
            fetched_at: fetched.fetched_at,
        })
    }

    /// Raw transactions starting at ledger version `start`.
    pub async fn transactions(
        &self,
        start: u64,
        limit: u64,
    ) -> Result<Fetched<Vec<Value>>, NodeError> {
        let query = NodeQuery::Transactions { start, limit };
        let fetched = self.fetch(&query).await?;
        let items = fetched
            .data
            .as_array()
            .cloned()
            .ok_or_else(|| NodeError::malformed(&query, "expected an array of transactions"))?;
        Ok(fetched.map(|_| items))
    }
}

/// Map a non-retryable transport failure onto the public taxonomy.
fn classify(query: &NodeQuery, err: TransportError) -> NodeError {
    match err {
        TransportError::Status { status: 404, .. } => NodeError::NotFound {
            query: query.to_string(),
        },
        TransportError::Status { status, .. } => NodeError::Rejected {
            query: query.to_string(),
            status,
        },
        other => NodeError::malformed(query, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::ScriptedTransport;
    use serde_json::json;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: 0.1,
        }
    }

    fn client(transport: Arc<ScriptedTransport>, max_retries: u32) -> NodeClient {
        NodeClient::new(transport, fast_policy(max_retries), ResponseCache::new())
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        };
        for retry in 0..5u32 {
            let nominal = 1.0 * 2f64.powi(retry as i32);
            let lo = (0.9 * nominal).min(60.0);
            let hi = (1.1 * nominal).min(60.0);
            for _ in 0..50 {
                let d = policy.backoff(retry).as_secs_f64();
                assert!(d >= lo - 1e-9 && d <= hi + 1e-9, "retry {retry}: {d} not in [{lo}, {hi}]");
            }
        }
        // Extreme samples land exactly on the band edges.
        assert!((policy.delay_for(2, -0.1).as_secs_f64() - 3.6).abs() < 1e-6);
        assert!((policy.delay_for(2, 0.5).as_secs_f64() - 4.4).abs() < 1e-6);
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 20,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        };
        assert_eq!(policy.delay_for(10, 0.1), Duration::from_secs(60));
        assert!(policy.backoff(u32::MAX) <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_success_populates_cache() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set("/", Ok(json!({"ledger_version": "100"})));
        let client = client(transport.clone(), 5);

        let fetched = client.ledger_version().await.unwrap();
        assert_eq!(fetched.data, 100);
        assert!(!fetched.stale);
        assert!(client.cache().get("/").is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("/", Err(TransportError::Timeout));
        transport.push("/", Err(TransportError::Status { status: 502, body: String::new() }));
        transport.set("/", Ok(json!({"ledger_version": 7})));
        let client = client(transport.clone(), 5);

        assert_eq!(client.ledger_version().await.unwrap().data, 7);
        assert_eq!(transport.calls("/"), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_without_cache_is_unavailable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set("/", Err(TransportError::Network("connection refused".into())));
        let client = client(transport.clone(), 5);

        let err = client.ledger_version().await.unwrap_err();
        match err {
            NodeError::NodeUnavailable { attempts, .. } => assert_eq!(attempts, 6),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.calls("/"), 6);
    }

    #[tokio::test]
    async fn test_exhaustion_serves_stale_cache() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("/", Ok(json!({"ledger_version": "55"})));
        transport.set("/", Err(TransportError::Timeout));
        let client = client(transport.clone(), 2);

        assert!(!client.ledger_version().await.unwrap().stale);
        assert!(!client.is_degraded());
        let second = client.ledger_version().await.unwrap();
        assert!(second.stale);
        assert!(client.is_degraded());
        assert_eq!(second.data, 55);
        assert_eq!(transport.calls("/"), 4);
    }

    #[tokio::test]
    async fn test_malformed_fails_without_retry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set("/", Err(TransportError::Decode("trailing garbage".into())));
        let client = client(transport.clone(), 5);

        assert!(matches!(
            client.fetch(&NodeQuery::LedgerInfo).await,
            Err(NodeError::MalformedResponse { .. })
        ));
        assert_eq!(transport.calls("/"), 1);
    }

    #[tokio::test]
    async fn test_missing_ledger_version_is_malformed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set("/", Ok(json!({"chain_id": 1})));
        let client = client(transport, 0);
        assert!(matches!(
            client.ledger_version().await,
            Err(NodeError::MalformedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_not_found_maps_to_absence() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set("/accounts/0x1", Ok(json!({"sequence_number": "0"})));
        let client = client(transport, 0);

        assert!(client.account_exists("0x1").await.unwrap());
        assert!(!client.account_exists("0xdead").await.unwrap());
        assert!(client
            .resource("0x1", "0x3::token::TokenStore")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_events_require_array() {
        let transport = Arc::new(ScriptedTransport::new());
        let handle = EventHandle::new("0x1", "0x3::token::TokenStore", "deposit_events");
        let path = NodeQuery::Events {
            handle: handle.clone(),
            start: None,
            limit: 5,
        }
        .path();
        transport.push(&path, Ok(json!({"not": "an array"})));
        transport.push(&path, Ok(json!([{"version": "3", "sequence_number": "0", "type": "t", "data": {}}])));
        let client = client(transport, 0);

        assert!(matches!(
            client.events(&handle, None, 5).await,
            Err(NodeError::MalformedResponse { .. })
        ));
        let ok = client.events(&handle, None, 5).await.unwrap();
        assert_eq!(ok.data.len(), 1);
        assert_eq!(ok.data[0].version, Some(3));
    }
}
