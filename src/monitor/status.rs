//! Read-only status board shared between the polling task and observers.

use super::{CycleReport, MonitorState};
use crate::events::CanonicalEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Default)]
struct BoardState {
    state: MonitorState,
    last_cursor: u64,
    latest_version: Option<u64>,
    degraded: bool,
    last_error: Option<String>,
    last_cycle_at: Option<DateTime<Utc>>,
    cycles: u64,
    failed_cycles: u64,
    events_processed: u64,
    significant_events: u64,
    duplicates: u64,
    monitored_accounts: Vec<String>,
    handle_count: usize,
    poll_interval_secs: u64,
    recent: VecDeque<CanonicalEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub state: MonitorState,
    pub last_cursor: u64,
    pub latest_version: Option<u64>,
    /// Serving cached node data rather than live responses.
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub events_processed: u64,
    pub significant_events: u64,
    pub duplicates: u64,
    pub monitored_accounts: Vec<String>,
    pub handle_count: usize,
    pub poll_interval_secs: u64,
    pub recent_events: usize,
}

/// Written only by the monitor; everything else reads snapshots.
pub struct StatusBoard {
    started_at: DateTime<Utc>,
    started: Instant,
    recent_cap: usize,
    inner: Mutex<BoardState>,
}

impl StatusBoard {
    pub fn new(recent_cap: usize, last_cursor: u64) -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            recent_cap: recent_cap.max(1),
            inner: Mutex::new(BoardState {
                last_cursor,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: MonitorState) {
        self.lock().state = state;
    }

    pub(crate) fn set_targets(&self, accounts: &[String], handle_count: usize) {
        let mut inner = self.lock();
        inner.monitored_accounts = accounts.to_vec();
        inner.handle_count = handle_count;
    }

    pub(crate) fn set_poll_interval(&self, secs: u64) {
        self.lock().poll_interval_secs = secs;
    }

    pub(crate) fn record_cycle(&self, report: &CycleReport, degraded: bool) {
        let mut inner = self.lock();
        inner.last_cursor = report.cursor_after;
        inner.latest_version = Some(report.latest);
        inner.degraded = degraded;
        inner.last_cycle_at = Some(Utc::now());
        inner.cycles += 1;
        inner.events_processed += report.emitted as u64;
        inner.significant_events += report.significant as u64;
        inner.duplicates += report.duplicates as u64;
        if report.failed_handles == 0 && report.cursor_error.is_none() {
            inner.last_error = None;
        } else if let Some(e) = &report.cursor_error {
            inner.last_error = Some(e.clone());
        }
    }

    pub(crate) fn record_error(&self, error: String, degraded: bool) {
        let mut inner = self.lock();
        inner.failed_cycles += 1;
        inner.degraded = degraded;
        inner.last_error = Some(error);
    }

    /// Append to the recent-events buffer, evicting the oldest beyond the cap.
    pub(crate) fn push_recent(&self, events: &[CanonicalEvent]) {
        let mut inner = self.lock();
        for event in events {
            if inner.recent.len() >= self.recent_cap {
                inner.recent.pop_front();
            }
            inner.recent.push_back(event.clone());
        }
    }

    /// Oldest first.
    pub fn recent_events(&self) -> Vec<CanonicalEvent> {
        self.lock().recent.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            state: inner.state,
            last_cursor: inner.last_cursor,
            latest_version: inner.latest_version,
            degraded: inner.degraded,
            last_error: inner.last_error.clone(),
            last_cycle_at: inner.last_cycle_at,
            cycles: inner.cycles,
            failed_cycles: inner.failed_cycles,
            events_processed: inner.events_processed,
            significant_events: inner.significant_events,
            duplicates: inner.duplicates,
            monitored_accounts: inner.monitored_accounts.clone(),
            handle_count: inner.handle_count,
            poll_interval_secs: inner.poll_interval_secs,
            recent_events: inner.recent.len(),
        }
    }
}
