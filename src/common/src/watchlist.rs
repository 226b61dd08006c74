//! Watchlist service: validated calls into the watchlist procedures plus a
//! client-side optimistic symbol set.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::WatchlistStock;
use crate::repository::WatchlistStore;

#[derive(Debug, Error, PartialEq)]
pub enum WatchlistError {
    #[error("User email is required")]
    MissingEmail,

    #[error("Symbol is required")]
    MissingSymbol,

    #[error("{0}")]
    Store(String),

    #[error("Failed to add {failed} stocks to watchlist")]
    BulkFailed { failed: usize },
}

impl WatchlistError {
    /// Caller mistakes as opposed to store failures.
    pub fn is_validation(&self) -> bool {
        matches!(self, WatchlistError::MissingEmail | WatchlistError::MissingSymbol)
    }
}

/// Trim and uppercase a ticker.
pub fn normalize_symbol(symbol: &str) -> Result<String, WatchlistError> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(WatchlistError::MissingSymbol);
    }
    Ok(symbol)
}

fn normalize_email(email: &str) -> Result<&str, WatchlistError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(WatchlistError::MissingEmail);
    }
    Ok(email)
}

#[derive(Clone)]
pub struct WatchlistService {
    store: Arc<dyn WatchlistStore>,
}

impl WatchlistService {
    pub fn new(store: Arc<dyn WatchlistStore>) -> Self {
        Self { store }
    }

    pub async fn add(&self, user_email: &str, symbol: &str, notes: Option<String>) -> Result<(), WatchlistError> {
        let email = normalize_email(user_email)?;
        let symbol = normalize_symbol(symbol)?;
        let notes = notes.filter(|n| !n.trim().is_empty());

        self.store
            .add_to_watchlist(email, &symbol, notes)
            .await
            .map_err(|e| {
                warn!("Error adding {} to watchlist: {}", symbol, e);
                WatchlistError::Store(e.to_string())
            })?;
        info!("Added {} to watchlist of {}", symbol, email);
        Ok(())
    }

    pub async fn remove(&self, user_email: &str, symbol: &str) -> Result<(), WatchlistError> {
        let email = normalize_email(user_email)?;
        let symbol = normalize_symbol(symbol)?;

        self.store
            .remove_from_watchlist(email, &symbol)
            .await
            .map_err(|e| {
                warn!("Error removing {} from watchlist: {}", symbol, e);
                WatchlistError::Store(e.to_string())
            })?;
        info!("Removed {} from watchlist of {}", symbol, email);
        Ok(())
    }

    /// Add every symbol with independent concurrent calls.
    ///
    /// Not transactional: symbols that succeeded stay added even when others
    /// fail. Returns how many distinct symbols were added.
    pub async fn bulk_add(&self, user_email: &str, symbols: &[String]) -> Result<usize, WatchlistError> {
        let email = normalize_email(user_email)?;
        let symbols: BTreeSet<String> = symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .collect::<Result<_, _>>()?;

        let calls = symbols
            .iter()
            .map(|symbol| self.store.add_to_watchlist(email, symbol, None));
        let outcomes = join_all(calls).await;

        let failed = outcomes.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            for err in outcomes.iter().filter_map(|r| r.as_ref().err()) {
                warn!("Bulk watchlist add failed: {}", err);
            }
            return Err(WatchlistError::BulkFailed { failed });
        }

        info!("Bulk-added {} symbols to watchlist of {}", symbols.len(), email);
        Ok(symbols.len())
    }

    pub async fn list(&self, user_email: &str) -> Result<Vec<WatchlistStock>, WatchlistError> {
        let email = normalize_email(user_email)?;
        self.store
            .watchlist_with_latest_data(email)
            .await
            .map_err(|e| WatchlistError::Store(e.to_string()))
    }

    pub async fn is_watched(&self, user_email: &str, symbol: &str) -> Result<bool, WatchlistError> {
        let email = normalize_email(user_email)?;
        let symbol = normalize_symbol(symbol)?;
        self.store
            .is_stock_watched(email, &symbol)
            .await
            .map_err(|e| WatchlistError::Store(e.to_string()))
    }
}

/// Undo token for an optimistic change.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct PendingChange {
    symbol: String,
    was_present: bool,
}

/// Locally tracked set of watched symbols, updated before the store confirms.
#[derive(Debug, Clone, Default)]
pub struct WatchedSymbols {
    symbols: BTreeSet<String>,
}

impl WatchedSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stocks(stocks: &[WatchlistStock]) -> Self {
        Self {
            symbols: stocks.iter().map(|s| s.symbol.to_uppercase()).collect(),
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(&symbol.trim().to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.symbols.iter()
    }

    /// Mark `symbol` watched. A no-op if it already is.
    pub fn apply_add(&mut self, symbol: &str) -> PendingChange {
        let symbol = symbol.trim().to_uppercase();
        let was_present = !self.symbols.insert(symbol.clone());
        PendingChange { symbol, was_present }
    }

    pub fn apply_remove(&mut self, symbol: &str) -> PendingChange {
        let symbol = symbol.trim().to_uppercase();
        let was_present = self.symbols.remove(&symbol);
        PendingChange { symbol, was_present }
    }

    /// Restore the state from before the change.
    pub fn revert(&mut self, change: PendingChange) {
        if change.was_present {
            self.symbols.insert(change.symbol);
        } else {
            self.symbols.remove(&change.symbol);
        }
    }

    /// Keep the changes whose call succeeded and revert the rest.
    /// Returns how many were reverted.
    pub fn settle(&mut self, outcomes: impl IntoIterator<Item = (PendingChange, bool)>) -> usize {
        let mut failed = 0;
        for (change, succeeded) in outcomes {
            if !succeeded {
                self.revert(change);
                failed += 1;
            }
        }
        failed
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, symbols: I) {
        self.symbols
            .extend(symbols.into_iter().map(|s| s.trim().to_uppercase()));
    }
}
