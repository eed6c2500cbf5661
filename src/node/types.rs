//! Wire-level types read from the node.
//!
//! The node encodes u64 values as JSON strings; `json_u64` accepts both
//! forms. Raw events keep their `data` payload untouched for the normalizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An on-chain (account, resource type, field) event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventHandle {
    pub account: String,
    pub resource_type: String,
    pub field_name: String,
}

impl EventHandle {
    pub fn new(account: &str, resource_type: &str, field_name: &str) -> Self {
        Self {
            account: account.to_string(),
            resource_type: resource_type.to_string(),
            field_name: field_name.to_string(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.account, self.resource_type, self.field_name)
    }
}

impl std::fmt::Display for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A single event as returned by the node, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub account: String,
    /// Set when the event was read through an event handle.
    pub handle: Option<EventHandle>,
    /// Move type, e.g. `0x1::coin::DepositEvent`.
    pub event_type: String,
    pub sequence_number: Option<u64>,
    pub version: Option<u64>,
    /// `creation_number@account_address` of the emitting stream.
    pub guid: Option<String>,
    pub data: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawEvent {
    /// Build from an element of `/accounts/{a}/events/{type}/{field}`.
    pub fn from_handle_event(handle: &EventHandle, value: &Value) -> Self {
        Self {
            account: handle.account.clone(),
            handle: Some(handle.clone()),
            event_type: json_str(value, "type"),
            sequence_number: value.get("sequence_number").and_then(json_u64),
            version: value.get("version").and_then(json_u64),
            guid: guid_of(value),
            data: value.get("data").cloned().unwrap_or(Value::Null),
            timestamp: None,
        }
    }

    /// Extract the events of a user transaction from `/transactions`.
    /// Other transaction kinds (block metadata, state checkpoints) yield nothing.
    pub fn from_transaction(tx: &Value) -> Vec<RawEvent> {
        if tx.get("type").and_then(Value::as_str) != Some("user_transaction") {
            return Vec::new();
        }
        let version = tx.get("version").and_then(json_u64);
        let timestamp = tx.get("timestamp").and_then(json_u64).and_then(micros_to_utc);
        let sender = json_str(tx, "sender");

        let Some(events) = tx.get("events").and_then(Value::as_array) else {
            return Vec::new();
        };

        events
            .iter()
            .map(|event| {
                let account = event
                    .get("guid")
                    .and_then(|g| g.get("account_address"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| sender.clone());
                RawEvent {
                    account,
                    handle: None,
                    event_type: json_str(event, "type"),
                    sequence_number: event.get("sequence_number").and_then(json_u64),
                    version,
                    guid: guid_of(event),
                    data: event.get("data").cloned().unwrap_or(Value::Null),
                    timestamp,
                }
            })
            .collect()
    }
}

/// Parse a u64 that may be encoded as a JSON number or string.
pub fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a u128 amount that may be encoded as a JSON number or string.
pub fn json_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_str(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn guid_of(event: &Value) -> Option<String> {
    let guid = event.get("guid")?;
    let creation = guid.get("creation_number").and_then(json_u64)?;
    let address = guid.get("account_address").and_then(Value::as_str)?;
    Some(format!("{creation}@{address}"))
}

fn micros_to_utc(micros: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(i64::try_from(micros).ok()?)
}
