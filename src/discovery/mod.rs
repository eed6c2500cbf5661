//! Event handle discovery.
//!
//! Probes a fixed catalog of well-known (resource type, field) pairs on each
//! monitored account and keeps the handles that exist. Handle sets change
//! rarely, so results are cached per account set and only rebuilt when the
//! set changes, on `invalidate`, or after the refresh interval.

use crate::node::{EventHandle, NodeClient, NodeError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const APTOS_COIN_STORE: &str = "0x1::coin::CoinStore<0x1::aptos_coin::AptosCoin>";
pub const TOKEN_STORE: &str = "0x3::token::TokenStore";
pub const COLLECTIONS: &str = "0x3::token::Collections";

/// Resource types probed and the event-handle fields looked up on each.
pub const CATALOG: &[(&str, &[&str])] = &[
    (APTOS_COIN_STORE, &["deposit_events", "withdraw_events"]),
    (TOKEN_STORE, &["deposit_events", "withdraw_events"]),
    (
        COLLECTIONS,
        &[
            "create_collection_events",
            "create_token_data_events",
            "mint_token_events",
        ],
    ),
];

struct Discovered {
    accounts: BTreeSet<String>,
    handles: Vec<EventHandle>,
    at: Instant,
}

pub struct HandleDiscovery {
    client: Arc<NodeClient>,
    refresh_interval: Duration,
    cached: Option<Discovered>,
}

impl HandleDiscovery {
    pub fn new(client: Arc<NodeClient>, refresh_interval: Duration) -> Self {
        Self {
            client,
            refresh_interval,
            cached: None,
        }
    }

    /// Whether `account` exists on chain.
    pub async fn validate(&self, account: &str) -> Result<bool, NodeError> {
        self.client.account_exists(account).await
    }

    /// Catalog handles present on `account`. A missing resource or field is
    /// simply left out.
    pub async fn discover(&self, account: &str) -> Result<Vec<EventHandle>, NodeError> {
        let mut handles = Vec::new();
        for (resource_type, fields) in CATALOG {
            let Some(resource) = self.client.resource(account, resource_type).await? else {
                debug!(account = %account, resource = %resource_type, "resource not present");
                continue;
            };
            let data = resource.get("data").unwrap_or(&resource);
            for field in fields.iter() {
                if data.get(*field).is_some() {
                    handles.push(EventHandle::new(account, resource_type, field));
                }
            }
        }
        Ok(handles)
    }

    /// Validate and discover every account, reusing the cached result while
    /// it is still valid. Accounts that fail or do not exist are skipped.
    pub async fn discover_all(&mut self, accounts: &[String]) -> Vec<EventHandle> {
        let wanted: BTreeSet<String> = accounts.iter().cloned().collect();
        if let Some(cached) = &self.cached {
            if cached.accounts == wanted && cached.at.elapsed() < self.refresh_interval {
                return cached.handles.clone();
            }
        }

        let mut handles = Vec::new();
        let mut complete = true;
        for account in &wanted {
            match self.validate(account).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(account = %account, "account not found on chain, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(account = %account, error = %e, "account validation failed, skipping");
                    complete = false;
                    continue;
                }
            }
            match self.discover(account).await {
                Ok(found) => {
                    debug!(account = %account, handles = found.len(), "discovered handles");
                    handles.extend(found);
                }
                Err(e) => {
                    warn!(account = %account, error = %e, "handle discovery failed, skipping");
                    complete = false;
                }
            }
        }

        info!(
            accounts = wanted.len(),
            handles = handles.len(),
            complete = complete,
            "event handle discovery finished"
        );

        // Partial results are used but not cached, so the next cycle retries.
        self.cached = complete.then(|| Discovered {
            accounts: wanted,
            handles: handles.clone(),
            at: Instant::now(),
        });
        handles
    }

    /// Drop the cached handle set; the next `discover_all` re-probes.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }
}
