//! Event metrics aggregation.
//!
//! Tracks, for every aggregated event:
//! - Per-category counters and a running total
//! - Per-account, per-token and per-collection counters with first/last seen
//! - Hour-of-day (24) and day-of-week (7) buckets
//! - A bounded history of the cursor version sampled on a fixed cadence

use crate::events::{CanonicalEvent, EventCategory};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::info;

/// Maximum version-history entries (one day at one sample per minute).
const MAX_VERSION_HISTORY: usize = 1440;

/// Leaderboard size in snapshots.
pub const TOP_N: usize = 10;

/// Counters for one account, token, or collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStats {
    pub total: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub category_breakdown: BTreeMap<EventCategory, u64>,
}

impl EntityStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total: 0,
            first_seen: now,
            last_seen: now,
            category_breakdown: BTreeMap::new(),
        }
    }

    fn record(&mut self, category: EventCategory, now: DateTime<Utc>) {
        self.total += 1;
        self.last_seen = now;
        *self.category_breakdown.entry(category).or_default() += 1;
    }
}

/// A leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntity {
    pub key: String,
    #[serde(flatten)]
    pub stats: EntityStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionPoint {
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

/// Keyed counters that remember first-insertion order for tie-breaking.
#[derive(Debug, Default)]
struct EntityTable {
    index: HashMap<String, usize>,
    entries: Vec<(String, EntityStats)>,
}

impl EntityTable {
    fn record(&mut self, key: &str, category: EventCategory, now: DateTime<Utc>) {
        let slot = match self.index.get(key) {
            Some(&slot) => slot,
            None => {
                self.entries.push((key.to_string(), EntityStats::new(now)));
                let slot = self.entries.len() - 1;
                self.index.insert(key.to_string(), slot);
                slot
            }
        };
        self.entries[slot].1.record(category, now);
    }

    fn get(&self, key: &str) -> Option<&EntityStats> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    /// Stable sort by total descending; equal totals keep insertion order.
    fn top_n(&self, n: usize) -> Vec<RankedEntity> {
        let mut ranked: Vec<&(String, EntityStats)> = self.entries.iter().collect();
        ranked.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        ranked
            .into_iter()
            .take(n)
            .map(|(key, stats)| RankedEntity {
                key: key.clone(),
                stats: stats.clone(),
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
    }
}

/// Point-in-time copy of the aggregator's state.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub categories: BTreeMap<EventCategory, u64>,
    pub hourly: [u64; 24],
    pub daily: [u64; 7],
    pub unique_accounts: usize,
    pub unique_tokens: usize,
    pub unique_collections: usize,
    pub top_accounts: Vec<RankedEntity>,
    pub top_tokens: Vec<RankedEntity>,
    pub top_collections: Vec<RankedEntity>,
    pub version_history: Vec<VersionPoint>,
}

/// The metrics aggregator. Only the monitor writes to it.
pub struct MetricsAggregator {
    categories: BTreeMap<EventCategory, u64>,
    total: u64,
    accounts: EntityTable,
    tokens: EntityTable,
    collections: EntityTable,
    hourly: [u64; 24],
    daily: [u64; 7],
    version_history: VecDeque<VersionPoint>,
    history_interval: chrono::Duration,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(60))
    }
}

impl MetricsAggregator {
    /// `history_interval` is the minimum spacing between version samples.
    pub fn new(history_interval: std::time::Duration) -> Self {
        Self {
            categories: EventCategory::ALL.iter().map(|c| (*c, 0)).collect(),
            total: 0,
            accounts: EntityTable::default(),
            tokens: EntityTable::default(),
            collections: EntityTable::default(),
            hourly: [0; 24],
            daily: [0; 7],
            version_history: VecDeque::new(),
            history_interval: chrono::Duration::from_std(history_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    pub fn update(&mut self, event: &CanonicalEvent) {
        self.update_at(event, Utc::now());
    }

    /// Aggregate `event` as observed at `now`.
    pub fn update_at(&mut self, event: &CanonicalEvent, now: DateTime<Utc>) {
        let category = event.category();
        *self.categories.entry(category).or_default() += 1;
        self.total += 1;

        self.accounts.record(&event.account, category, now);
        if let Some(token) = event.token_name() {
            self.tokens.record(token, category, now);
        }
        if let Some(collection) = event.collection_name() {
            self.collections.record(collection, category, now);
        }

        self.hourly[now.hour() as usize] += 1;
        self.daily[now.weekday().num_days_from_monday() as usize] += 1;
    }

    pub fn record_version(&mut self, version: u64) -> bool {
        self.record_version_at(version, Utc::now())
    }

    /// Append a history sample unless the last one is younger than the
    /// cadence. Returns whether a sample was appended.
    pub fn record_version_at(&mut self, version: u64, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.version_history.back() {
            if now - last.timestamp < self.history_interval {
                return false;
            }
        }
        if self.version_history.len() >= MAX_VERSION_HISTORY {
            self.version_history.pop_front();
        }
        self.version_history.push_back(VersionPoint {
            timestamp: now,
            version,
        });
        true
    }

    /// Zero all counters and buckets. Version history is kept.
    pub fn reset(&mut self) {
        for count in self.categories.values_mut() {
            *count = 0;
        }
        self.total = 0;
        self.accounts.clear();
        self.tokens.clear();
        self.collections.clear();
        self.hourly = [0; 24];
        self.daily = [0; 7];
    }

    /// Events aggregated since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn category_count(&self, category: EventCategory) -> u64 {
        self.categories.get(&category).copied().unwrap_or(0)
    }

    pub fn hourly(&self) -> &[u64; 24] {
        &self.hourly
    }

    pub fn daily(&self) -> &[u64; 7] {
        &self.daily
    }

    pub fn account(&self, address: &str) -> Option<&EntityStats> {
        self.accounts.get(address)
    }

    pub fn token(&self, name: &str) -> Option<&EntityStats> {
        self.tokens.get(name)
    }

    pub fn collection(&self, name: &str) -> Option<&EntityStats> {
        self.collections.get(name)
    }

    pub fn top_accounts(&self, n: usize) -> Vec<RankedEntity> {
        self.accounts.top_n(n)
    }

    pub fn top_tokens(&self, n: usize) -> Vec<RankedEntity> {
        self.tokens.top_n(n)
    }

    pub fn top_collections(&self, n: usize) -> Vec<RankedEntity> {
        self.collections.top_n(n)
    }

    pub fn version_history(&self) -> impl Iterator<Item = &VersionPoint> {
        self.version_history.iter()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total: self.total,
            categories: self.categories.clone(),
            hourly: self.hourly,
            daily: self.daily,
            unique_accounts: self.accounts.len(),
            unique_tokens: self.tokens.len(),
            unique_collections: self.collections.len(),
            top_accounts: self.top_accounts(TOP_N),
            top_tokens: self.top_tokens(TOP_N),
            top_collections: self.top_collections(TOP_N),
            version_history: self.version_history.iter().copied().collect(),
        }
    }

    /// Log a summary of metrics (called periodically).
    pub fn log_summary(&self) {
        info!(
            total = self.total,
            coin_transfers = self.category_count(EventCategory::CoinTransfer),
            token_deposits = self.category_count(EventCategory::TokenDeposit),
            token_withdrawals = self.category_count(EventCategory::TokenWithdrawal),
            nft_sales = self.category_count(EventCategory::NftSale),
            contract_events = self.category_count(EventCategory::ContractEvent),
            other = self.category_count(EventCategory::Other),
            "event metrics"
        );

        let top_account = self
            .accounts
            .top_n(1)
            .into_iter()
            .next()
            .map(|r| format!("{} ({})", r.key, r.stats.total))
            .unwrap_or_default();
        info!(
            accounts = self.accounts.len(),
            tokens = self.tokens.len(),
            collections = self.collections.len(),
            top_account = %top_account,
            latest_version = self.version_history.back().map(|p| p.version).unwrap_or(0),
            "entity metrics"
        );
    }
}
