//! In-memory stores for tests and local runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{
    BarStore, CursorStore, InsertOutcome, StoreError, SymbolRegistry,
};
use crate::domain::market::{Bar, SeriesKey, Symbol, SymbolState};

/// In-memory implementation of [`BarStore`].
///
/// Suitable for testing and development. Not for production use.
#[derive(Debug, Default)]
pub struct InMemoryBarStore {
    series: RwLock<HashMap<SeriesKey, BTreeMap<i64, Bar>>>,
    inserted: RwLock<HashMap<SeriesKey, Vec<i64>>>,
    failing: RwLock<HashSet<i64>>,
}

impl InMemoryBarStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert of `id` fail with a query error.
    pub fn fail_on_insert(&self, id: i64) {
        self.failing.write().insert(id);
    }

    /// Let inserts of `id` succeed again.
    pub fn recover_insert(&self, id: i64) {
        self.failing.write().remove(&id);
    }

    /// Stored ids of a series, ascending.
    #[must_use]
    pub fn ids(&self, series: &SeriesKey) -> Vec<i64> {
        self.series
            .read()
            .get(series)
            .map(|bars| bars.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Ids of a series in the order they were first inserted.
    #[must_use]
    pub fn insertion_order(&self, series: &SeriesKey) -> Vec<i64> {
        self.inserted.read().get(series).cloned().unwrap_or_default()
    }

    /// Total number of stored bars across all series.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.read().values().map(BTreeMap::len).sum()
    }

    /// Check whether no bar is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn insert(&self, series: &SeriesKey, bar: &Bar) -> Result<InsertOutcome, StoreError> {
        if self.failing.read().contains(&bar.id) {
            return Err(StoreError::Query {
                message: format!("injected failure for bar {}", bar.id),
            });
        }

        let mut all = self.series.write();
        let bars = all.entry(series.clone()).or_default();
        if bars.contains_key(&bar.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        bars.insert(bar.id, bar.clone());
        self.inserted
            .write()
            .entry(series.clone())
            .or_default()
            .push(bar.id);
        Ok(InsertOutcome::Inserted)
    }

    async fn find_one(&self, series: &SeriesKey, id: i64) -> Result<Option<Bar>, StoreError> {
        Ok(self
            .series
            .read()
            .get(series)
            .and_then(|bars| bars.get(&id))
            .cloned())
    }
}

/// In-memory implementation of [`CursorStore`] and [`SymbolRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    symbols: RwLock<Vec<Symbol>>,
    states: RwLock<HashMap<Symbol, SymbolState>>,
    cursors: RwLock<HashMap<SeriesKey, i64>>,
}

impl InMemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a symbol to the registry with the given state.
    pub fn seed_symbol(&self, symbol: &str, state: SymbolState) {
        let mut symbols = self.symbols.write();
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
        self.states.write().insert(symbol.to_string(), state);
    }

    /// Initialize a cursor.
    pub fn seed_cursor(&self, series: &SeriesKey, value: i64) {
        self.cursors.write().insert(series.clone(), value);
    }

    /// Current cursor value.
    #[must_use]
    pub fn cursor_value(&self, series: &SeriesKey) -> Option<i64> {
        self.cursors.read().get(series).copied()
    }

    /// Current state of a symbol.
    #[must_use]
    pub fn state_of(&self, symbol: &str) -> SymbolState {
        self.states.read().get(symbol).copied().unwrap_or_default()
    }
}

#[async_trait]
impl CursorStore for InMemoryKeyStore {
    async fn cursor(&self, series: &SeriesKey) -> Result<Option<i64>, StoreError> {
        Ok(self.cursor_value(series))
    }

    async fn set_cursor(&self, series: &SeriesKey, value: i64) -> Result<(), StoreError> {
        self.seed_cursor(series, value);
        Ok(())
    }
}

#[async_trait]
impl SymbolRegistry for InMemoryKeyStore {
    async fn symbols(&self) -> Result<Vec<Symbol>, StoreError> {
        Ok(self.symbols.read().clone())
    }

    async fn state(&self, symbol: &str) -> Result<SymbolState, StoreError> {
        Ok(self.state_of(symbol))
    }

    async fn set_state(&self, symbol: &str, state: SymbolState) -> Result<(), StoreError> {
        self.states.write().insert(symbol.to_string(), state);
        Ok(())
    }
}
