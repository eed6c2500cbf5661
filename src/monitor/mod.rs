//! Polling orchestrator.
//!
//! One task per monitor drives the cycle:
//! latest version → fetch handles → normalize → dedup → aggregate →
//! dispatch → persist cursor → sleep.
//!
//! Features:
//! - Account validation and handle discovery on first run and whenever the
//!   monitored account set changes or a refresh is requested
//! - Bounded concurrent fan-out across handles; one failing handle never
//!   aborts the others
//! - Cursor that never moves backwards, persisted after each cycle; it stops
//!   short at the lowest point any failed, stale or truncated source was
//!   read through, so nothing above it is skipped on the next cycle
//! - Transaction-stream fallback when no handles are known
//! - Adaptive sleep after consecutive empty cycles, interruptible for shutdown

pub mod status;

pub use status::{StatusBoard, StatusSnapshot};

use crate::config::{Config, MonitorConfig};
use crate::cursor::CursorStore;
use crate::dedup::Deduplicator;
use crate::discovery::HandleDiscovery;
use crate::dispatch::{DispatchQueue, Dispatcher, Enqueued, EventSink};
use crate::events::{
    AlwaysSignificant, CanonicalEvent, Normalizer, SignificancePolicy, WatchlistPolicy,
};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::node::types::json_u64;
use crate::node::{EventHandle, NodeClient, NodeError, RawEvent};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Granularity of the interruptible sleep.
const SLEEP_TICK: Duration = Duration::from_secs(1);

/// Upper bound on the adaptive sleep multiplier.
const MAX_BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    #[default]
    Idle,
    ValidatingAccounts,
    DiscoveringHandles,
    Fetching,
    Normalizing,
    Deduping,
    Aggregating,
    Dispatching,
    Sleeping,
    Stopped,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorState::Idle => "idle",
            MonitorState::ValidatingAccounts => "validating_accounts",
            MonitorState::DiscoveringHandles => "discovering_handles",
            MonitorState::Fetching => "fetching",
            MonitorState::Normalizing => "normalizing",
            MonitorState::Deduping => "deduping",
            MonitorState::Aggregating => "aggregating",
            MonitorState::Dispatching => "dispatching",
            MonitorState::Sleeping => "sleeping",
            MonitorState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub latest: u64,
    pub cursor_before: u64,
    pub cursor_after: u64,
    /// Raw events above the cursor returned by the node.
    pub fetched: usize,
    /// New events after dedup.
    pub emitted: usize,
    pub significant: usize,
    pub duplicates: usize,
    pub failed_handles: usize,
    /// Some response was served from cache.
    pub stale: bool,
    /// Cursor write failure; the in-memory cursor still advanced.
    pub cursor_error: Option<String>,
}

/// Raw events gathered in one cycle plus what is known about completeness.
#[derive(Default)]
struct Collected {
    events: Vec<RawEvent>,
    failed: usize,
    stale: bool,
    /// Lowest version some source is known to be read through when it fell
    /// short of the latest version. `None` when every source was complete.
    read_through: Option<u64>,
}

impl Collected {
    fn fall_short(&mut self, version: u64) {
        self.read_through = Some(self.read_through.map_or(version, |v| v.min(version)));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable control and read handle for a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    refresh: Arc<AtomicBool>,
    accounts: Arc<watch::Sender<Vec<String>>>,
    status: Arc<StatusBoard>,
    metrics: Arc<Mutex<MetricsAggregator>>,
    dedup: Arc<Mutex<Deduplicator>>,
}

impl MonitorHandle {
    /// Request a cooperative stop. The loop exits within one sleep tick or
    /// after the in-flight request completes.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Replace the monitored account set; handles are re-discovered next cycle.
    pub fn set_accounts(&self, accounts: Vec<String>) {
        self.accounts.send_replace(accounts);
    }

    /// Force handle re-discovery on the next cycle.
    pub fn refresh_handles(&self) {
        self.refresh.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        lock(&self.metrics).snapshot()
    }

    pub fn recent_events(&self) -> Vec<CanonicalEvent> {
        self.status.recent_events()
    }

    pub fn seen_ids(&self) -> usize {
        lock(&self.dedup).len()
    }
}

pub struct Monitor {
    config: MonitorConfig,
    client: Arc<NodeClient>,
    discovery: HandleDiscovery,
    normalizer: Normalizer,
    cursor: CursorStore,
    dedup: Arc<Mutex<Deduplicator>>,
    metrics: Arc<Mutex<MetricsAggregator>>,
    status: Arc<StatusBoard>,
    queue: DispatchQueue,
    sinks: Vec<Arc<dyn EventSink>>,
    sink_timeout: Duration,
    accounts_tx: Arc<watch::Sender<Vec<String>>>,
    accounts_rx: watch::Receiver<Vec<String>>,
    refresh: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handles: Vec<EventHandle>,
    /// Next sequence number to request per handle. Absent until first fetch.
    next_start: HashMap<EventHandle, u64>,
    accounts_known: bool,
    empty_cycles: u32,
}

impl Monitor {
    pub fn new(config: &Config, client: Arc<NodeClient>) -> Self {
        let monitor = &config.monitor;
        let cursor = CursorStore::open(&monitor.cursor_path, monitor.default_cursor);
        let status = Arc::new(StatusBoard::new(monitor.recent_events_cap, cursor.get()));
        status.set_poll_interval(monitor.poll_interval_secs);

        let significance: Arc<dyn SignificancePolicy> = {
            let filters = &config.filters;
            if filters.accounts.is_empty()
                && filters.tokens.is_empty()
                && filters.collections.is_empty()
            {
                Arc::new(AlwaysSignificant)
            } else {
                Arc::new(WatchlistPolicy::from_filters(filters))
            }
        };

        let (accounts_tx, accounts_rx) = watch::channel(monitor.accounts.clone());

        Self {
            config: monitor.clone(),
            discovery: HandleDiscovery::new(client.clone(), monitor.discovery_refresh()),
            client,
            normalizer: Normalizer::new(&config.node.explorer_url).with_significance(significance),
            cursor,
            dedup: Arc::new(Mutex::new(Deduplicator::new(monitor.dedup_capacity))),
            metrics: Arc::new(Mutex::new(MetricsAggregator::new(Duration::from_secs(
                monitor.version_history_interval_secs,
            )))),
            status,
            queue: DispatchQueue::new(config.dispatch.queue_capacity, config.dispatch.overflow),
            sinks: Vec::new(),
            sink_timeout: Duration::from_secs(config.dispatch.sink_timeout_secs),
            accounts_tx: Arc::new(accounts_tx),
            accounts_rx,
            refresh: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            next_start: HashMap::new(),
            accounts_known: false,
            empty_cycles: 0,
        }
    }

    /// Register a downstream sink. Sinks receive significant events only.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_significance(mut self, policy: Arc<dyn SignificancePolicy>) -> Self {
        self.normalizer.set_significance(policy);
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            stop: self.stop.clone(),
            refresh: self.refresh.clone(),
            accounts: self.accounts_tx.clone(),
            status: self.status.clone(),
            metrics: self.metrics.clone(),
            dedup: self.dedup.clone(),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.get()
    }

    pub fn dispatch_queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Spawn the polling loop. Returns immediately.
    pub fn start(self) -> (MonitorHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Poll until stopped, then drain the dispatch queue.
    pub async fn run(mut self) {
        let dispatcher = Dispatcher::spawn(self.queue.clone(), self.sinks.clone(), self.sink_timeout);
        info!(
            cursor = self.cursor.get(),
            accounts = self.accounts_rx.borrow().len(),
            poll_interval_secs = self.config.poll_interval_secs,
            "monitor started"
        );

        while !self.stopped() {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    self.status.record_cycle(&report, self.client.is_degraded() || report.stale);
                    if report.emitted == 0 {
                        self.empty_cycles = self.empty_cycles.saturating_add(1);
                    } else {
                        self.empty_cycles = 0;
                    }
                    self.poll_delay()
                }
                Err(e) => {
                    error!(error = %e, "polling cycle aborted");
                    self.status.record_error(e.to_string(), self.client.is_degraded());
                    self.config.error_retry_delay()
                }
            };

            self.status.set_state(MonitorState::Sleeping);
            self.sleep_interruptible(delay).await;
            if !self.stopped() {
                self.status.set_state(MonitorState::Idle);
            }
        }

        self.status.set_state(MonitorState::Stopped);
        let stats = dispatcher.shutdown().await;
        lock(&self.metrics).log_summary();
        info!(
            cursor = self.cursor.get(),
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "monitor stopped"
        );
    }

    /// Run a single cycle. Fails only when the latest ledger version cannot
    /// be obtained; the cursor is then left untouched.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, NodeError> {
        self.refresh_targets().await;

        self.status.set_state(MonitorState::Fetching);
        let latest = self.client.ledger_version().await?;
        let cursor_before = self.cursor.get();
        let mut report = CycleReport {
            latest: latest.data,
            cursor_before,
            cursor_after: cursor_before,
            stale: latest.stale,
            ..Default::default()
        };

        if latest.data <= cursor_before {
            debug!(latest = latest.data, cursor = cursor_before, "no new versions");
            report.cursor_error = self.persist_cursor(cursor_before);
            lock(&self.metrics).record_version(cursor_before);
            return Ok(report);
        }

        let collected = if self.handles.is_empty() {
            self.collect_transactions(cursor_before).await
        } else {
            self.collect_handles(cursor_before).await
        };
        report.fetched = collected.events.len();
        report.failed_handles = collected.failed;
        report.stale |= collected.stale;

        let high_watermark = collected
            .events
            .iter()
            .filter_map(|e| e.version)
            .max()
            .unwrap_or(cursor_before);

        self.status.set_state(MonitorState::Normalizing);
        let mut raw = collected.events;
        raw.sort_by_key(|e| (e.version, e.sequence_number));
        let normalized: Vec<CanonicalEvent> =
            raw.iter().map(|e| self.normalizer.normalize(e)).collect();

        self.status.set_state(MonitorState::Deduping);
        let fresh: Vec<CanonicalEvent> = {
            let mut dedup = lock(&self.dedup);
            normalized
                .into_iter()
                .filter(|e| dedup.check_and_mark(&e.id))
                .collect()
        };
        report.duplicates = report.fetched - fresh.len();
        report.emitted = fresh.len();

        self.status.set_state(MonitorState::Aggregating);
        {
            let mut metrics = lock(&self.metrics);
            for event in &fresh {
                metrics.update(event);
            }
        }
        self.status.push_recent(&fresh);

        self.status.set_state(MonitorState::Dispatching);
        for event in fresh.into_iter().filter(|e| e.significant) {
            report.significant += 1;
            if self.queue.enqueue(event) == Enqueued::Rejected {
                debug!("significant event not queued");
            }
        }

        let target = collected
            .read_through
            .unwrap_or_else(|| latest.data.max(high_watermark));
        report.cursor_error = self.persist_cursor(target);
        report.cursor_after = self.cursor.get();
        lock(&self.metrics).record_version(report.cursor_after);

        info!(
            latest = report.latest,
            cursor = report.cursor_after,
            fetched = report.fetched,
            emitted = report.emitted,
            duplicates = report.duplicates,
            failed_handles = report.failed_handles,
            stale = report.stale,
            "cycle complete"
        );
        Ok(report)
    }

    /// Re-validate and re-discover when the account set changed, a refresh
    /// was requested, or the discovery cache expired.
    async fn refresh_targets(&mut self) {
        let changed = self.accounts_rx.has_changed().unwrap_or(false);
        let accounts = self.accounts_rx.borrow_and_update().clone();
        if changed || self.refresh.swap(false, Ordering::SeqCst) {
            info!(accounts = accounts.len(), "monitored accounts changed, re-discovering handles");
            self.discovery.invalidate();
        }

        if !self.discovery.is_cached() {
            self.status.set_state(if self.accounts_known {
                MonitorState::DiscoveringHandles
            } else {
                MonitorState::ValidatingAccounts
            });
        }
        self.handles = self.discovery.discover_all(&accounts).await;
        self.accounts_known = true;
        self.next_start.retain(|h, _| self.handles.contains(h));
        self.status.set_targets(&accounts, self.handles.len());
    }

    /// Fetch every handle concurrently. A handle with a known next sequence
    /// number is read by sequence and its events are kept whatever their
    /// version; a handle read for the first time keeps only events above the
    /// cursor.
    async fn collect_handles(&mut self, cursor: u64) -> Collected {
        let batch = self.config.batch_size;
        let client = self.client.clone();
        let stop = self.stop.clone();

        let results: Vec<(EventHandle, Option<u64>, Option<Result<_, NodeError>>)> =
            stream::iter(self.handles.clone())
                .map(|handle| {
                    let client = client.clone();
                    let stop = stop.clone();
                    let start = self.next_start.get(&handle).copied();
                    async move {
                        if stop.load(Ordering::SeqCst) {
                            return (handle, start, None);
                        }
                        let result = client.events(&handle, start, batch).await;
                        (handle, start, Some(result))
                    }
                })
                .buffer_unordered(self.config.fetch_concurrency.max(1))
                .collect()
                .await;

        let mut collected = Collected::default();
        for (handle, start, result) in results {
            let fetched = match result {
                Some(Ok(fetched)) => fetched,
                Some(Err(e)) => {
                    warn!(handle = %handle, error = %e, "handle fetch failed");
                    collected.failed += 1;
                    collected.fall_short(cursor);
                    continue;
                }
                None => {
                    collected.fall_short(cursor);
                    continue;
                }
            };

            if fetched.stale {
                debug!(handle = %handle, "handle served from cache");
                collected.stale = true;
                collected.fall_short(cursor);
            } else if fetched.data.len() as u64 >= batch {
                let seen = fetched.data.iter().filter_map(|e| e.version).max();
                debug!(handle = %handle, read_through = ?seen, "handle batch truncated");
                collected.fall_short(seen.unwrap_or(cursor));
            }
            if let Some(max_seq) = fetched.data.iter().filter_map(|e| e.sequence_number).max() {
                let next = self.next_start.entry(handle.clone()).or_insert(0);
                *next = (*next).max(max_seq + 1);
            }
            let anchored = start.is_some();
            let kept = fetched
                .data
                .into_iter()
                .filter(|e| anchored || e.version.map_or(true, |v| v > cursor));
            collected.events.extend(kept);
        }
        collected
    }

    async fn collect_transactions(&self, cursor: u64) -> Collected {
        let batch = self.config.batch_size;
        let mut collected = Collected::default();
        match self.client.transactions(cursor + 1, batch).await {
            Ok(fetched) => {
                // Every transaction counts towards progress, including ones
                // that carry no events.
                let scanned = fetched
                    .data
                    .iter()
                    .filter_map(|tx| tx.get("version").and_then(json_u64))
                    .max();
                debug!(
                    start = cursor + 1,
                    count = fetched.data.len(),
                    scanned = ?scanned,
                    "read transaction stream"
                );
                if fetched.stale {
                    collected.stale = true;
                    collected.fall_short(cursor);
                } else if fetched.data.len() as u64 >= batch {
                    collected.fall_short(scanned.unwrap_or(cursor));
                }
                collected.events = fetched
                    .data
                    .iter()
                    .flat_map(RawEvent::from_transaction)
                    .filter(|e| e.version.map_or(true, |v| v > cursor))
                    .collect();
            }
            Err(e) => {
                warn!(error = %e, "transaction stream fetch failed");
                collected.failed = 1;
                collected.fall_short(cursor);
            }
        }
        collected
    }

    /// Advance the cursor (never backwards), retrying a previously failed
    /// write. Returns the persistence error, if any.
    fn persist_cursor(&mut self, target: u64) -> Option<String> {
        let target = target.max(self.cursor.get());
        match self.cursor.set(target) {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, cursor = self.cursor.get(), "cursor persistence failed");
                Some(e.to_string())
            }
        }
    }

    /// Base interval, scaled up after `idle_cycles_before_backoff`
    /// consecutive empty cycles.
    fn poll_delay(&self) -> Duration {
        let base = self.config.poll_interval();
        let threshold = self.config.idle_cycles_before_backoff;
        if self.empty_cycles < threshold || threshold == 0 {
            return base;
        }
        let factor = (1.0 + 0.25 * (self.empty_cycles - threshold + 1) as f64).min(MAX_BACKOFF_FACTOR);
        base.mul_f64(factor)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn sleep_interruptible(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(SLEEP_TICK)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{APTOS_COIN_STORE, TOKEN_STORE};
    use crate::dispatch::tests::RecordingSink;
    use crate::node::testing::ScriptedTransport;
    use crate::node::{NodeQuery, ResponseCache, RetryPolicy, TransportError};
    use serde_json::{json, Value};
    use std::path::Path;

    fn config(dir: &Path, cursor: u64) -> Config {
        let mut config = Config::default();
        config.monitor.accounts = vec!["0xa".into()];
        config.monitor.cursor_path = dir.join("cursor.txt");
        config.monitor.default_cursor = cursor;
        config.monitor.batch_size = 25;
        config.monitor.poll_interval_secs = 5;
        config
    }

    fn client(transport: Arc<ScriptedTransport>, max_retries: u32) -> Arc<NodeClient> {
        let policy = RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        };
        Arc::new(NodeClient::new(transport, policy, ResponseCache::new()))
    }

    fn events_path(account: &str, resource: &str, field: &str, start: Option<u64>) -> String {
        NodeQuery::Events {
            handle: EventHandle::new(account, resource, field),
            start,
            limit: 25,
        }
        .path()
    }

    fn coin_event(version: u64, seq: u64) -> Value {
        json!({
            "version": version.to_string(),
            "sequence_number": seq.to_string(),
            "guid": {"creation_number": "2", "account_address": "0xa"},
            "type": "0x1::coin::DepositEvent",
            "data": {"amount": "150000000"}
        })
    }

    /// Account `0xa` holding an APT coin store with both handles.
    fn script_account(transport: &ScriptedTransport, latest: u64) {
        transport.set("/", Ok(json!({"ledger_version": latest.to_string()})));
        transport.set("/accounts/0xa", Ok(json!({"sequence_number": "1"})));
        transport.set(
            &format!("/accounts/0xa/resource/{APTOS_COIN_STORE}"),
            Ok(json!({"data": {"deposit_events": {}, "withdraw_events": {}}})),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "withdraw_events", None),
            Ok(json!([])),
        );
    }

    #[tokio::test]
    async fn test_new_events_advance_cursor_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(91, 91), coin_event(92, 92), coin_event(93, 93)])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport, 0));

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.emitted, 3);
        assert_eq!(report.cursor_after, 100);
        assert_eq!(monitor.cursor(), 100);
        assert_eq!(monitor.dispatch_queue().len(), 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cursor.txt")).unwrap(),
            "100"
        );

        let metrics = monitor.handle().metrics();
        assert_eq!(metrics.total, 3);
        assert_eq!(monitor.handle().recent_events()[0].amount_apt(), Some(1.5));
    }

    #[tokio::test]
    async fn test_duplicate_in_batch_dispatched_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(95, 5), coin_event(95, 5)])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport, 0));

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.emitted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(monitor.dispatch_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_node_skips_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set("/", Err(TransportError::Network("connection reset".into())));
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport.clone(), 5));

        let err = monitor.run_cycle().await.unwrap_err();
        assert!(matches!(err, NodeError::NodeUnavailable { attempts: 6, .. }));
        assert_eq!(transport.calls("/"), 6);
        assert_eq!(monitor.cursor(), 90);
        assert!(!dir.path().join("cursor.txt").exists());
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(150, 1)])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 200), client(transport, 0));

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.cursor_before, 200);
        assert_eq!(report.cursor_after, 200);
        assert_eq!(report.emitted, 0);
        assert!(monitor.dispatch_queue().is_empty());
    }

    #[tokio::test]
    async fn test_failed_handle_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(94, 1)])),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "withdraw_events", None),
            Err(TransportError::Status { status: 503, body: String::new() }),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport, 0));

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.failed_handles, 1);
        assert_eq!(report.emitted, 1);
        // Nothing is known about the failed handle above the old cursor.
        assert_eq!(report.cursor_after, 90);
    }

    #[tokio::test]
    async fn test_failed_handle_recovers_its_events() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(94, 0)])),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(1)),
            Ok(json!([])),
        );
        let withdraw = events_path("0xa", APTOS_COIN_STORE, "withdraw_events", None);
        transport.push(&withdraw, Err(TransportError::Status { status: 503, body: String::new() }));
        transport.set(&withdraw, Ok(json!([coin_event(93, 0)])));
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport, 0));

        let first = monitor.run_cycle().await.unwrap();
        assert_eq!(first.failed_handles, 1);
        assert_eq!(first.cursor_after, 90);

        let second = monitor.run_cycle().await.unwrap();
        assert_eq!(second.failed_handles, 0);
        assert_eq!(second.emitted, 1);
        assert_eq!(second.cursor_after, 100);
        let versions: Vec<u64> = monitor
            .handle()
            .recent_events()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![94, 93]);
    }

    #[tokio::test]
    async fn test_stale_handle_holds_cursor_back() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(95, 0)])),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(1)),
            Ok(json!([])),
        );
        let withdraw = events_path("0xa", APTOS_COIN_STORE, "withdraw_events", None);
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport.clone(), 0));

        let first = monitor.run_cycle().await.unwrap();
        assert_eq!(first.cursor_after, 100);

        // The withdraw handle times out and is answered from cache.
        transport.set("/", Ok(json!({"ledger_version": "200"})));
        transport.push(&withdraw, Err(TransportError::Timeout));
        let second = monitor.run_cycle().await.unwrap();
        assert!(second.stale);
        assert_eq!(second.failed_handles, 0);
        assert_eq!(second.cursor_after, 100);

        transport.set(&withdraw, Ok(json!([coin_event(150, 0)])));
        let third = monitor.run_cycle().await.unwrap();
        assert!(!third.stale);
        assert_eq!(third.emitted, 1);
        assert_eq!(third.cursor_after, 200);
    }

    #[tokio::test]
    async fn test_truncated_batch_stops_at_high_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 1000);
        let batch: Vec<Value> = (0..25).map(|i| coin_event(100 + i, i)).collect();
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(Value::Array(batch)),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(25)),
            Ok(json!([coin_event(130, 25)])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport.clone(), 0));

        let first = monitor.run_cycle().await.unwrap();
        assert_eq!(first.emitted, 25);
        assert_eq!(first.cursor_after, 124);

        let second = monitor.run_cycle().await.unwrap();
        assert_eq!(second.emitted, 1);
        assert_eq!(second.cursor_after, 1000);
        assert_eq!(
            transport.calls(&events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(25))),
            1
        );
    }

    #[tokio::test]
    async fn test_truncated_handle_keeps_pending_events_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 1000);
        let batch: Vec<Value> = (0..25).map(|i| coin_event(100 + i, i)).collect();
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(Value::Array(batch)),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(25)),
            Ok(json!([coin_event(130, 25)])),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "withdraw_events", None),
            Ok(json!([coin_event(500, 0)])),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "withdraw_events", Some(1)),
            Ok(json!([])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport, 0));

        let first = monitor.run_cycle().await.unwrap();
        assert_eq!(first.emitted, 26);
        // Held at the truncated handle, not the withdraw event at 500.
        assert_eq!(first.cursor_after, 124);

        let second = monitor.run_cycle().await.unwrap();
        assert_eq!(second.emitted, 1);
        assert_eq!(second.cursor_after, 1000);
        assert_eq!(monitor.handle().metrics().total, 27);
    }

    #[tokio::test]
    async fn test_anchored_handle_keeps_events_below_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(95, 0)])),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(1)),
            Ok(json!([coin_event(99, 1)])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport.clone(), 0));

        monitor.run_cycle().await.unwrap();
        transport.set("/", Ok(json!({"ledger_version": "120"})));
        let second = monitor.run_cycle().await.unwrap();
        assert_eq!(second.cursor_before, 100);
        assert_eq!(second.emitted, 1);

        // Repeats of an already seen event are caught by dedup.
        transport.set("/", Ok(json!({"ledger_version": "130"})));
        transport.push(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(2)),
            Ok(json!([coin_event(99, 1)])),
        );
        let third = monitor.run_cycle().await.unwrap();
        assert_eq!(third.emitted, 0);
        assert_eq!(third.duplicates, 1);
    }

    #[tokio::test]
    async fn test_transaction_fallback_advances_past_eventless_page() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.set("/", Ok(json!({"ledger_version": "1000"})));
        transport.set("/accounts/0xa", Ok(json!({"sequence_number": "0"})));
        let page: Vec<Value> = (91..116)
            .map(|v| json!({"type": "block_metadata_transaction", "version": v.to_string()}))
            .collect();
        transport.set("/transactions?start=91&limit=25", Ok(Value::Array(page)));
        transport.set("/transactions?start=116&limit=25", Ok(json!([])));
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport.clone(), 0));

        let first = monitor.run_cycle().await.unwrap();
        assert_eq!(first.emitted, 0);
        assert_eq!(first.cursor_after, 115);

        let second = monitor.run_cycle().await.unwrap();
        assert_eq!(second.cursor_after, 1000);
        assert_eq!(transport.calls("/transactions?start=91&limit=25"), 1);
        assert_eq!(transport.calls("/transactions?start=116&limit=25"), 1);
    }

    #[tokio::test]
    async fn test_idle_cycle_records_version_history() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 200), client(transport, 0));

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.cursor_after, 200);
        let history = monitor.handle().metrics().version_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 200);
    }

    #[tokio::test]
    async fn test_transaction_fallback_without_handles() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.set("/", Ok(json!({"ledger_version": "100"})));
        transport.set("/accounts/0xa", Ok(json!({"sequence_number": "0"})));
        transport.set(
            "/transactions?start=91&limit=25",
            Ok(json!([
                {"type": "block_metadata_transaction", "version": "91"},
                {"type": "user_transaction", "version": "95", "sender": "0xa",
                 "timestamp": "1700000000000000",
                 "events": [{"type": "0x3::token::DepositEvent",
                             "guid": {"creation_number": "4", "account_address": "0xa"},
                             "sequence_number": "0",
                             "data": {"amount": "1", "id": {"token_data_id": {
                                 "collection": "C", "name": "T #1", "creator": "0xc"}}}}]}
            ])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport, 0));

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.emitted, 1);
        assert_eq!(report.cursor_after, 100);
        let recent = monitor.handle().recent_events();
        assert_eq!(recent[0].token_name(), Some("T #1"));
        assert!(recent[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_account_change_triggers_rediscovery() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set("/accounts/0xb", Ok(json!({"sequence_number": "0"})));
        transport.set(
            &format!("/accounts/0xb/resource/{TOKEN_STORE}"),
            Ok(json!({"data": {"deposit_events": {}}})),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([])),
        );
        transport.set(
            &events_path("0xb", TOKEN_STORE, "deposit_events", None),
            Ok(json!([])),
        );
        let mut monitor = Monitor::new(&config(dir.path(), 90), client(transport.clone(), 0));
        let handle = monitor.handle();

        monitor.run_cycle().await.unwrap();
        assert_eq!(handle.status().handle_count, 2);

        handle.set_accounts(vec!["0xb".into()]);
        monitor.run_cycle().await.unwrap();
        assert_eq!(transport.calls("/accounts/0xb"), 1);
        assert_eq!(handle.status().monitored_accounts, vec!["0xb".to_string()]);
        assert_eq!(handle.status().handle_count, 1);

        handle.refresh_handles();
        monitor.run_cycle().await.unwrap();
        assert_eq!(transport.calls("/accounts/0xb"), 2);
    }

    #[tokio::test]
    async fn test_adaptive_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 0);
        config.monitor.poll_interval_secs = 60;
        config.monitor.idle_cycles_before_backoff = 3;
        let transport = Arc::new(ScriptedTransport::new());
        let mut monitor = Monitor::new(&config, client(transport, 0));

        let delays: Vec<u64> = (0..6)
            .map(|empty| {
                monitor.empty_cycles = empty;
                monitor.poll_delay().as_secs()
            })
            .collect();
        assert_eq!(delays, vec![60, 60, 60, 75, 90, 90]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_does_not_block_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        script_account(&transport, 100);
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", None),
            Ok(json!([coin_event(91, 0), coin_event(92, 1)])),
        );
        transport.set(
            &events_path("0xa", APTOS_COIN_STORE, "deposit_events", Some(2)),
            Ok(json!([])),
        );
        let recording = Arc::new(RecordingSink::default());
        let monitor = Monitor::new(&config(dir.path(), 90), client(transport, 0))
            .with_sink(Arc::new(RecordingSink::failing()))
            .with_sink(recording.clone());

        let (handle, task) = monitor.start();
        while handle.status().cycles < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop();
        task.await.unwrap();

        assert_eq!(recording.ids().len(), 2);
        let status = handle.status();
        assert_eq!(status.last_cursor, 100);
        assert_eq!(status.state, MonitorState::Stopped);
        assert_eq!(status.events_processed, 2);
    }
}
