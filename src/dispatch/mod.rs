//! Downstream hand-off of significant events.
//!
//! The monitor pushes into a bounded `DispatchQueue` without awaiting; a
//! single consumer task spawned by `Dispatcher::spawn` drains it and delivers
//! each event to every registered sink under a per-sink timeout. A failing or
//! slow sink is logged and counted, never propagated back to the monitor.

pub mod sinks;

pub use crate::config::OverflowPolicy;
pub use sinks::{ChannelSink, LogSink};

use crate::events::CanonicalEvent;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("sink {0} is full")]
    Backpressure(String),
    #[error("sink {0} is closed")]
    Closed(String),
    #[error("sink {sink} failed: {reason}")]
    Failed { sink: String, reason: String },
}

/// A downstream consumer of canonical events.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &CanonicalEvent) -> Result<(), SinkError>;
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Accepted after evicting the oldest queued event.
    DisplacedOldest,
    /// Queue full under `RejectNew`, or queue closed.
    Rejected,
}

struct QueueInner {
    events: Mutex<VecDeque<CanonicalEvent>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Bounded multi-producer queue with an explicit overflow policy.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(QueueInner {
                events: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                policy,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Push without waiting. Overflow is resolved by the queue's policy.
    pub fn enqueue(&self, event: CanonicalEvent) -> Enqueued {
        if self.inner.closed.load(Ordering::Acquire) {
            return Enqueued::Rejected;
        }
        let outcome = {
            let mut events = lock(&self.inner.events);
            if events.len() < self.inner.capacity {
                events.push_back(event);
                Enqueued::Accepted
            } else {
                match self.inner.policy {
                    OverflowPolicy::RejectNew => Enqueued::Rejected,
                    OverflowPolicy::DropOldest => {
                        events.pop_front();
                        events.push_back(event);
                        Enqueued::DisplacedOldest
                    }
                }
            }
        };
        match outcome {
            Enqueued::Accepted => {}
            Enqueued::DisplacedOldest | Enqueued::Rejected => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(policy = ?self.inner.policy, dropped = dropped, "dispatch queue full");
            }
        }
        if outcome != Enqueued::Rejected {
            self.inner.notify.notify_one();
        }
        outcome
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events. The consumer drains what is left, then exits.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    fn pop(&self) -> Option<CanonicalEvent> {
        lock(&self.inner.events).pop_front()
    }

    /// Next event, or `None` once closed and drained.
    async fn next(&self) -> Option<CanonicalEvent> {
        loop {
            if let Some(event) = self.pop() {
                return Some(event);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Consumer task delivering queued events to sinks.
pub struct Dispatcher {
    queue: DispatchQueue,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn spawn(
        queue: DispatchQueue,
        sinks: Vec<Arc<dyn EventSink>>,
        sink_timeout: Duration,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let task = {
            let queue = queue.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                info!(sinks = sinks.len(), "dispatcher started");
                while let Some(event) = queue.next().await {
                    for sink in &sinks {
                        deliver_one(sink.as_ref(), &event, sink_timeout, &counters).await;
                    }
                }
                info!("dispatcher stopped");
            })
        };

        Self {
            queue,
            counters,
            task,
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.queue.dropped(),
        }
    }

    /// Close the queue, let the consumer drain it, and wait for it to exit.
    pub async fn shutdown(self) -> DispatchStats {
        self.queue.close();
        if let Err(e) = self.task.await {
            warn!(error = %e, "dispatcher task ended abnormally");
        }
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.queue.dropped(),
        }
    }
}

async fn deliver_one(
    sink: &dyn EventSink,
    event: &CanonicalEvent,
    timeout: Duration,
    counters: &Counters,
) {
    match tokio::time::timeout(timeout, sink.deliver(event)).await {
        Ok(Ok(())) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(sink = sink.name(), id = %event.id, "event delivered");
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(sink = sink.name(), id = %event.id, error = %e, "sink delivery failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                sink = sink.name(),
                id = %event.id,
                timeout_ms = timeout.as_millis() as u64,
                "sink delivery timed out"
            );
        }
    }
}
