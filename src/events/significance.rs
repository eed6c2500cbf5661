//! Significance predicates deciding which events reach downstream sinks.

use super::CanonicalEvent;
use crate::config::FilterConfig;
use std::collections::HashSet;

/// Decides whether an event is surfaced downstream. Swappable on the
/// normalizer without touching classification.
pub trait SignificancePolicy: Send + Sync {
    fn is_significant(&self, event: &CanonicalEvent) -> bool;
}

impl<F> SignificancePolicy for F
where
    F: Fn(&CanonicalEvent) -> bool + Send + Sync,
{
    fn is_significant(&self, event: &CanonicalEvent) -> bool {
        self(event)
    }
}

/// Every event is significant.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSignificant;

impl SignificancePolicy for AlwaysSignificant {
    fn is_significant(&self, _event: &CanonicalEvent) -> bool {
        true
    }
}

/// Events touching an allow-listed account, token, or collection. An
/// account matches as the event's owner, a payload counterparty or the
/// token creator. With all three lists empty, everything passes.
#[derive(Debug, Clone, Default)]
pub struct WatchlistPolicy {
    accounts: HashSet<String>,
    tokens: HashSet<String>,
    collections: HashSet<String>,
}

impl WatchlistPolicy {
    pub fn from_filters(filters: &FilterConfig) -> Self {
        Self {
            accounts: filters.accounts.iter().map(|a| a.to_lowercase()).collect(),
            tokens: filters.tokens.iter().cloned().collect(),
            collections: filters.collections.iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.tokens.is_empty() && self.collections.is_empty()
    }
}

impl SignificancePolicy for WatchlistPolicy {
    fn is_significant(&self, event: &CanonicalEvent) -> bool {
        if self.is_empty() {
            return true;
        }
        if self.accounts.contains(&event.account.to_lowercase()) {
            return true;
        }
        if event
            .counterparties
            .iter()
            .any(|address| self.accounts.contains(&address.to_lowercase()))
        {
            return true;
        }
        if let Some(token) = event.token_name() {
            if self.tokens.contains(token) {
                return true;
            }
        }
        if let Some(collection) = event.collection_name() {
            if self.collections.contains(collection) {
                return true;
            }
        }
        match &event.kind {
            super::EventKind::TokenDeposit { token, .. }
            | super::EventKind::TokenWithdrawal { token, .. }
            | super::EventKind::NftSale { token, .. } => {
                !token.creator.is_empty() && self.accounts.contains(&token.creator.to_lowercase())
            }
            _ => false,
        }
    }
}
