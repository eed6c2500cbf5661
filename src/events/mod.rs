//! Canonical event model.
//!
//! Every raw node event is normalized into a `CanonicalEvent`: common fields
//! (id, account, version, links, description) plus an `EventKind` carrying
//! only the fields relevant to its category.

pub mod normalizer;
pub mod significance;

pub use normalizer::{classify, Normalizer};
pub use significance::{AlwaysSignificant, SignificancePolicy, WatchlistPolicy};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Octas per APT.
pub const OCTAS_PER_APT: f64 = 100_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    CoinTransfer,
    TokenDeposit,
    TokenWithdrawal,
    NftSale,
    ContractEvent,
    Other,
}

impl EventCategory {
    pub const ALL: [EventCategory; 6] = [
        EventCategory::CoinTransfer,
        EventCategory::TokenDeposit,
        EventCategory::TokenWithdrawal,
        EventCategory::NftSale,
        EventCategory::ContractEvent,
        EventCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::CoinTransfer => "coin_transfer",
            EventCategory::TokenDeposit => "token_deposit",
            EventCategory::TokenWithdrawal => "token_withdrawal",
            EventCategory::NftSale => "nft_sale",
            EventCategory::ContractEvent => "contract_event",
            EventCategory::Other => "other",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Deposit,
    Withdraw,
    Unknown,
}

/// Token identity from the nested `token_data_id` structure.
/// Missing parts are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenRef {
    pub name: String,
    pub collection: String,
    pub creator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EventKind {
    CoinTransfer {
        direction: TransferDirection,
        raw_amount: u128,
        amount_apt: f64,
    },
    TokenDeposit {
        token: TokenRef,
        amount: u64,
    },
    TokenWithdrawal {
        token: TokenRef,
        amount: u64,
    },
    NftSale {
        token: TokenRef,
        amount_apt: f64,
    },
    ContractEvent {
        event_type: String,
    },
    Other {
        event_type: String,
    },
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::CoinTransfer { .. } => EventCategory::CoinTransfer,
            EventKind::TokenDeposit { .. } => EventCategory::TokenDeposit,
            EventKind::TokenWithdrawal { .. } => EventCategory::TokenWithdrawal,
            EventKind::NftSale { .. } => EventCategory::NftSale,
            EventKind::ContractEvent { .. } => EventCategory::ContractEvent,
            EventKind::Other { .. } => EventCategory::Other,
        }
    }

    fn token(&self) -> Option<&TokenRef> {
        match self {
            EventKind::TokenDeposit { token, .. }
            | EventKind::TokenWithdrawal { token, .. }
            | EventKind::NftSale { token, .. } => Some(token),
            _ => None,
        }
    }
}

/// A normalized, enriched on-chain event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEvent {
    /// Unique within the dedup window.
    pub id: String,
    pub account: String,
    pub version: u64,
    pub sequence_number: Option<u64>,
    /// Chain timestamp when the source carried one.
    pub timestamp: Option<DateTime<Utc>>,
    pub description: String,
    pub transaction_link: String,
    pub account_link: String,
    /// Other addresses named in the payload (sender, receiver, creator).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub counterparties: Vec<String>,
    pub significant: bool,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl CanonicalEvent {
    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }

    /// Token name, when present and non-empty.
    pub fn token_name(&self) -> Option<&str> {
        self.kind
            .token()
            .map(|t| t.name.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Collection name, when present and non-empty.
    pub fn collection_name(&self) -> Option<&str> {
        self.kind
            .token()
            .map(|t| t.collection.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn amount_apt(&self) -> Option<f64> {
        match &self.kind {
            EventKind::CoinTransfer { amount_apt, .. } | EventKind::NftSale { amount_apt, .. } => {
                Some(*amount_apt)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for CanonicalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(v={}, id={})", self.category(), self.version, self.id)
    }
}
