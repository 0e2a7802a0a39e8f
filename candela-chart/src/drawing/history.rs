//! Per-symbol undo/redo stacks over drawing sets.

use crate::drawing::{Drawing, persist::DrawingStore};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::warn;

/// Undo/redo state for one symbol. Drawings here are timestamp-space; they
/// are converted to index-space only for rendering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub past: Vec<Vec<Drawing>>,
    pub present: Vec<Drawing>,
    pub future: Vec<Vec<Drawing>>,
}

/// All drawing histories, rehydrated from durable storage at construction
/// and written back synchronously after every mutation.
#[derive(Debug)]
pub struct DrawingHistory {
    entries: FnvHashMap<SmolStr, HistoryEntry>,
    store: DrawingStore,
}

impl DrawingHistory {
    /// Load the persisted history map; a missing or unreadable file starts
    /// empty.
    pub fn load(store: DrawingStore) -> Self {
        let entries = store.load();
        Self { entries, store }
    }

    /// Current drawing set for a symbol.
    pub fn present(&self, symbol: &str) -> &[Drawing] {
        self.entries
            .get(symbol)
            .map(|entry| entry.present.as_slice())
            .unwrap_or_default()
    }

    pub fn can_undo(&self, symbol: &str) -> bool {
        self.entries
            .get(symbol)
            .is_some_and(|entry| !entry.past.is_empty())
    }

    pub fn can_redo(&self, symbol: &str) -> bool {
        self.entries
            .get(symbol)
            .is_some_and(|entry| !entry.future.is_empty())
    }

    /// Replace the symbol's drawing set: the prior `present` moves onto the
    /// undo stack and any redo branch is discarded.
    pub fn record(&mut self, symbol: impl Into<SmolStr>, drawings: Vec<Drawing>) {
        let entry = self.entries.entry(symbol.into()).or_default();
        let prior = std::mem::replace(&mut entry.present, drawings);
        entry.past.push(prior);
        entry.future.clear();
        self.persist();
    }

    /// Step one mutation back. Returns false (and persists nothing) when
    /// there is nothing to undo.
    pub fn undo(&mut self, symbol: &str) -> bool {
        let Some(entry) = self.entries.get_mut(symbol) else {
            return false;
        };
        let Some(previous) = entry.past.pop() else {
            return false;
        };
        let current = std::mem::replace(&mut entry.present, previous);
        entry.future.push(current);
        self.persist();
        true
    }

    /// Step one undone mutation forward again.
    pub fn redo(&mut self, symbol: &str) -> bool {
        let Some(entry) = self.entries.get_mut(symbol) else {
            return false;
        };
        let Some(next) = entry.future.pop() else {
            return false;
        };
        let current = std::mem::replace(&mut entry.present, next);
        entry.past.push(current);
        self.persist();
        true
    }

    fn persist(&self) {
        if let Err(err) = self.store.save(&self.entries) {
            // losing a write is recoverable on the next mutation; losing the
            // in-memory state is not, so never propagate
            warn!(%err, "failed to persist drawing history");
        }
    }
}
