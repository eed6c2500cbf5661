//! Scripted transport used by unit tests in place of a live node.

use super::{NodeTransport, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Reply = Result<Value, TransportError>;

/// Replies are looked up by exact path: queued one-shot replies first, then
/// the sticky reply for that path, else a 404.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    sticky: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reply once with `reply` on the next request to `path`.
    pub(crate) fn push(&self, path: &str, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Reply with `reply` whenever nothing is queued for `path`.
    pub(crate) fn set(&self, path: &str, reply: Reply) {
        self.sticky.lock().unwrap().insert(path.to_string(), reply);
    }

    pub(crate) fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NodeTransport for ScriptedTransport {
    async fn get_json(&self, path: &str) -> Result<Value, TransportError> {
        *self.calls.lock().unwrap().entry(path.to_string()).or_default() += 1;

        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        if let Some(reply) = self.sticky.lock().unwrap().get(path) {
            return reply.clone();
        }
        Err(TransportError::Status {
            status: 404,
            body: format!("no script for {path}"),
        })
    }
}
