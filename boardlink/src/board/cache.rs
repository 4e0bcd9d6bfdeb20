//! Process-wide record of live boards.
//!
//! Every board is registered here when it attaches to a transport and
//! removed when its connection tears down. Insertion order is significant
//! to consumers that list boards, so removal drains the cache and
//! re-inserts every survivor in its original order.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use super::{BoardId, ConnectionId};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// One registered board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub board: BoardId,
    pub connection: ConnectionId,
    pub board_type: String,
}

/// Shared registry of live boards, passed explicitly to every connection.
#[derive(Debug, Clone, Default)]
pub struct BoardCache {
    entries: Arc<Mutex<Vec<CacheEntry>>>,
}

impl BoardCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a board. A connection may hold at most one board.
    pub fn insert(&self, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter().find(|e| e.connection == entry.connection) {
            return Err(Error::Config(format!(
                "connection {} already holds board {}",
                entry.connection, existing.board
            )));
        }
        debug!(board = %entry.board, connection = %entry.connection, "Board cached.");
        entries.push(entry);
        Ok(())
    }

    /// Remove a board, keeping the order of the rest.
    ///
    /// Returns whether the board was present. Removing an absent board is
    /// not an error.
    pub fn remove(&self, board: BoardId) -> bool {
        let mut entries = self.entries.lock();
        let drained: Vec<CacheEntry> = entries.drain(..).collect();
        let before = drained.len();
        for entry in drained {
            if entry.board != board {
                entries.push(entry);
            }
        }
        let removed = entries.len() != before;
        if removed {
            debug!(board = %board, remaining = entries.len(), "Board removed from cache.");
        }
        removed
    }

    pub fn contains(&self, board: BoardId) -> bool {
        self.entries.lock().iter().any(|e| e.board == board)
    }

    pub fn list(&self) -> Vec<CacheEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(connection: &str) -> CacheEntry {
        CacheEntry {
            board: BoardId::next(),
            connection: ConnectionId::new(connection),
            board_type: "firmata".into(),
        }
    }

    #[test]
    fn remove_keeps_survivor_order() {
        let cache = BoardCache::new();
        let entries: Vec<_> = ["a", "b", "c", "d"].into_iter().map(entry).collect();
        for e in &entries {
            cache.insert(e.clone()).unwrap();
        }

        assert!(cache.remove(entries[1].board));
        assert_eq!(
            cache.list(),
            vec![entries[0].clone(), entries[2].clone(), entries[3].clone()]
        );

        assert!(cache.remove(entries[3].board));
        assert_eq!(cache.list(), vec![entries[0].clone(), entries[2].clone()]);
    }

    #[test]
    fn removing_absent_board_is_harmless() {
        let cache = BoardCache::new();
        let kept = entry("a");
        cache.insert(kept.clone()).unwrap();

        assert!(!cache.remove(BoardId::next()));
        assert!(cache.remove(kept.board));
        assert!(!cache.remove(kept.board));
        assert!(cache.is_empty());
    }

    #[test]
    fn one_board_per_connection() {
        let cache = BoardCache::new();
        cache.insert(entry("a")).unwrap();
        assert!(matches!(cache.insert(entry("a")), Err(Error::Config(_))));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let cache = BoardCache::new();
        let other = cache.clone();
        let e = entry("a");
        other.insert(e.clone()).unwrap();
        assert!(cache.contains(e.board));
    }
}
