//! Built-in event sinks.

use super::{EventSink, SinkError};
use crate::events::CanonicalEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

/// Hands events to a collaborator task over a bounded channel. A full
/// channel is reported as backpressure rather than awaited.
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<CanonicalEvent>,
}

impl ChannelSink {
    pub fn new(name: &str, capacity: usize) -> (Self, mpsc::Receiver<CanonicalEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.to_string(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &CanonicalEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Backpressure(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed(self.name.clone()),
        })
    }
}

/// Writes each event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &CanonicalEvent) -> Result<(), SinkError> {
        info!(
            category = %event.category(),
            version = event.version,
            account = %event.account,
            link = %event.transaction_link,
            "{}",
            event.description
        );
        Ok(())
    }
}
