//! Aptos on-chain event monitor.
//!
//! Polls an Aptos fullnode for events on a set of monitored accounts,
//! normalizes them into typed canonical events, and hands significant ones
//! to downstream sinks while keeping metrics and a persistent cursor.

pub mod config;
pub mod cursor;
pub mod dedup;
pub mod discovery;
pub mod dispatch;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod node;
