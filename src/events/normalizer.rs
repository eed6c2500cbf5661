//! Raw event → canonical event.
//!
//! Classification looks at the event handle first and falls back to the Move
//! event type. Normalization never fails: a missing or malformed field
//! degrades to a default (zero amount, empty token name) and the event is
//! still emitted. Output depends only on the input; no clock is read.

use super::significance::{AlwaysSignificant, SignificancePolicy};
use super::{CanonicalEvent, EventCategory, EventKind, TokenRef, TransferDirection, OCTAS_PER_APT};
use crate::node::types::{json_u128, json_u64, RawEvent};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// (resource type, field name) → category for well-known handles.
/// Resource types match with or without generic parameters.
const HANDLE_TABLE: &[(&str, &str, EventCategory)] = &[
    ("0x1::coin::CoinStore", "deposit_events", EventCategory::CoinTransfer),
    ("0x1::coin::CoinStore", "withdraw_events", EventCategory::CoinTransfer),
    ("0x3::token::TokenStore", "deposit_events", EventCategory::TokenDeposit),
    ("0x3::token::TokenStore", "withdraw_events", EventCategory::TokenWithdrawal),
    ("0x3::token::Collections", "create_collection_events", EventCategory::ContractEvent),
    ("0x3::token::Collections", "create_token_data_events", EventCategory::ContractEvent),
    ("0x3::token::Collections", "mint_token_events", EventCategory::ContractEvent),
];

/// Exact Move event types.
const EVENT_TYPE_TABLE: &[(&str, EventCategory)] = &[
    ("0x1::coin::DepositEvent", EventCategory::CoinTransfer),
    ("0x1::coin::WithdrawEvent", EventCategory::CoinTransfer),
    ("0x1::coin::CoinDeposit", EventCategory::CoinTransfer),
    ("0x1::coin::CoinWithdraw", EventCategory::CoinTransfer),
    ("0x3::token::DepositEvent", EventCategory::TokenDeposit),
    ("0x3::token::WithdrawEvent", EventCategory::TokenWithdrawal),
    ("0x3::token::CreateCollectionEvent", EventCategory::ContractEvent),
    ("0x3::token::CreateTokenDataEvent", EventCategory::ContractEvent),
    ("0x3::token::MintTokenEvent", EventCategory::ContractEvent),
];

/// Marketplace sale events, matched on the type name in any module.
const SALE_SUFFIXES: &[&str] = &["::BuyEvent", "::ListingFilledEvent", "::TokenSwapEvent"];

/// Category of a raw event. Unknown handles and types are `Other`.
pub fn classify(raw: &RawEvent) -> EventCategory {
    if let Some(handle) = &raw.handle {
        if let Some(category) = classify_handle(&handle.resource_type, &handle.field_name) {
            return category;
        }
    }
    classify_event_type(&raw.event_type)
}

fn classify_handle(resource_type: &str, field_name: &str) -> Option<EventCategory> {
    let base = strip_generics(resource_type);
    HANDLE_TABLE
        .iter()
        .find(|(resource, field, _)| *resource == base && *field == field_name)
        .map(|(_, _, category)| *category)
}

fn classify_event_type(event_type: &str) -> EventCategory {
    let base = strip_generics(event_type);
    if let Some((_, category)) = EVENT_TYPE_TABLE.iter().find(|(t, _)| *t == base) {
        return *category;
    }
    if SALE_SUFFIXES.iter().any(|suffix| base.ends_with(suffix)) {
        return EventCategory::NftSale;
    }
    EventCategory::Other
}

fn strip_generics(move_type: &str) -> &str {
    move_type.split('<').next().unwrap_or(move_type).trim()
}

pub struct Normalizer {
    explorer_url: String,
    significance: Arc<dyn SignificancePolicy>,
}

impl Normalizer {
    /// Every event is significant until a policy is set.
    pub fn new(explorer_url: &str) -> Self {
        Self {
            explorer_url: explorer_url.trim_end_matches('/').to_string(),
            significance: Arc::new(AlwaysSignificant),
        }
    }

    pub fn with_significance(mut self, policy: Arc<dyn SignificancePolicy>) -> Self {
        self.significance = policy;
        self
    }

    pub fn set_significance(&mut self, policy: Arc<dyn SignificancePolicy>) {
        self.significance = policy;
    }

    pub fn normalize(&self, raw: &RawEvent) -> CanonicalEvent {
        let kind = build_kind(classify(raw), raw);
        let version = raw.version.unwrap_or(0);
        let description = describe(&kind, &raw.account);

        let mut event = CanonicalEvent {
            id: event_id(raw),
            account: raw.account.clone(),
            version,
            sequence_number: raw.sequence_number,
            timestamp: raw.timestamp,
            description,
            transaction_link: format!("{}/txn/{}", self.explorer_url, version),
            account_link: format!("{}/account/{}", self.explorer_url, raw.account),
            counterparties: counterparties(&raw.data),
            significant: true,
            kind,
        };
        event.significant = self.significance.is_significant(&event);
        event
    }
}

fn build_kind(category: EventCategory, raw: &RawEvent) -> EventKind {
    let data = &raw.data;
    match category {
        EventCategory::CoinTransfer => {
            let raw_amount = data.get("amount").and_then(json_u128).unwrap_or(0);
            EventKind::CoinTransfer {
                direction: direction_of(raw),
                raw_amount,
                amount_apt: raw_amount as f64 / OCTAS_PER_APT,
            }
        }
        EventCategory::TokenDeposit => EventKind::TokenDeposit {
            token: token_ref(data),
            amount: data.get("amount").and_then(json_u64).unwrap_or(0),
        },
        EventCategory::TokenWithdrawal => EventKind::TokenWithdrawal {
            token: token_ref(data),
            amount: data.get("amount").and_then(json_u64).unwrap_or(0),
        },
        EventCategory::NftSale => {
            let price = data
                .get("price")
                .or_else(|| data.get("amount"))
                .and_then(json_u128)
                .unwrap_or(0);
            EventKind::NftSale {
                token: token_ref(data),
                amount_apt: price as f64 / OCTAS_PER_APT,
            }
        }
        EventCategory::ContractEvent => EventKind::ContractEvent {
            event_type: raw.event_type.clone(),
        },
        EventCategory::Other => EventKind::Other {
            event_type: raw.event_type.clone(),
        },
    }
}

fn direction_of(raw: &RawEvent) -> TransferDirection {
    let hint = raw
        .handle
        .as_ref()
        .map(|h| h.field_name.as_str())
        .unwrap_or(raw.event_type.as_str())
        .to_lowercase();
    if hint.contains("deposit") {
        TransferDirection::Deposit
    } else if hint.contains("withdraw") {
        TransferDirection::Withdraw
    } else {
        TransferDirection::Unknown
    }
}

/// Token identity from `id.token_data_id` or `token_id.token_data_id`,
/// falling back to flat `token_name`, `collection_name` and
/// `creator_address` fields.
fn token_ref(data: &Value) -> TokenRef {
    let nested = data
        .get("id")
        .or_else(|| data.get("token_id"))
        .and_then(|id| id.get("token_data_id"));
    let field = |nested_key: &str, flat_key: &str| {
        nested
            .and_then(|t| t.get(nested_key))
            .or_else(|| data.get(flat_key))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    TokenRef {
        name: field("name", "token_name"),
        collection: field("collection", "collection_name"),
        creator: field("creator", "creator_address"),
    }
}

/// Addresses under `sender`, `receiver` and `creator_address`, in that order.
fn counterparties(data: &Value) -> Vec<String> {
    ["sender", "receiver", "creator_address"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_str))
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

fn describe(kind: &EventKind, account: &str) -> String {
    let account = short_account(account);
    match kind {
        EventKind::CoinTransfer {
            direction,
            amount_apt,
            ..
        } => match direction {
            TransferDirection::Deposit => {
                format!("Coin deposit of {amount_apt:.2} APT to account {account}")
            }
            TransferDirection::Withdraw => {
                format!("Coin withdrawal of {amount_apt:.2} APT from account {account}")
            }
            TransferDirection::Unknown => {
                format!("Coin transfer of {amount_apt:.2} APT on account {account}")
            }
        },
        EventKind::TokenDeposit { token, .. } => format!(
            "Token deposit of {} to account {account}",
            token_label(token)
        ),
        EventKind::TokenWithdrawal { token, .. } => format!(
            "Token withdrawal of {} from account {account}",
            token_label(token)
        ),
        EventKind::NftSale { token, amount_apt } => format!(
            "NFT sale of {} for {amount_apt:.2} APT involving account {account}",
            token_label(token)
        ),
        EventKind::ContractEvent { event_type } => {
            format!("Contract event {} on account {account}", short_type(event_type))
        }
        EventKind::Other { event_type } => {
            format!("Event {} on account {account}", short_type(event_type))
        }
    }
}

fn token_label(token: &TokenRef) -> String {
    match (token.name.is_empty(), token.collection.is_empty()) {
        (true, _) => "an unknown token".to_string(),
        (false, true) => token.name.clone(),
        (false, false) => format!("{} ({})", token.name, token.collection),
    }
}

/// `0x1234...abcd` for long addresses.
fn short_account(account: &str) -> String {
    if account.len() > 10 && account.is_char_boundary(6) && account.is_char_boundary(account.len() - 4) {
        format!("{}...{}", &account[..6], &account[account.len() - 4..])
    } else {
        account.to_string()
    }
}

/// Last path segment of a Move type, e.g. `MintTokenEvent`.
fn short_type(event_type: &str) -> &str {
    let base = strip_generics(event_type);
    if base.is_empty() {
        return "of unknown type";
    }
    base.rsplit("::").next().unwrap_or(base)
}

/// Id precedence: (version, sequence) qualified by stream, then
/// transaction version, then a content hash.
fn event_id(raw: &RawEvent) -> String {
    match (raw.version, raw.sequence_number) {
        (Some(version), Some(sequence)) => format!("{version}:{sequence}:{}", stream_key(raw)),
        (Some(version), None) => format!("tx:{version}"),
        _ => format!("h:{}", content_hash(raw)),
    }
}

fn stream_key(raw: &RawEvent) -> String {
    raw.guid
        .clone()
        .or_else(|| raw.handle.as_ref().map(|h| h.key()))
        .unwrap_or_else(|| raw.event_type.clone())
}

/// SHA-256 over a canonical (key-sorted) rendering of the identifying fields.
fn content_hash(raw: &RawEvent) -> String {
    let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
    fields.insert("account", Value::String(raw.account.clone()));
    fields.insert("event_type", Value::String(raw.event_type.clone()));
    fields.insert("data", raw.data.clone());
    if let Some(handle) = &raw.handle {
        fields.insert("resource_type", Value::String(handle.resource_type.clone()));
        fields.insert("field_name", Value::String(handle.field_name.clone()));
    }
    // serde_json maps are key-ordered without `preserve_order`, so nested
    // objects in `data` serialize deterministically too.
    let canonical = serde_json::to_string(&fields).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
