//! In-process substrate backend.
//!
//! One [`MemoryStore`] holds every data structure behind a single
//! `tokio::sync::RwLock`, which is what makes [`crate::store::Batch`]
//! atomic: a batch is applied under one write guard, so a multi-key
//! registration can never be observed half-done.
//!
//! TTLs are enforced lazily: every read path checks `expires_at` before
//! returning, and mutating paths drop dead entries they walk over. That
//! keeps behavior deterministic under test clocks and avoids a background
//! sweeper racing assertions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::pubsub::ChannelTable;

/// A value with an optional expiry.
#[derive(Debug, Clone)]
pub(crate) struct Entry<T> {
    pub value: T,
    pub expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    pub fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    pub fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// A bounded ring of sequenced byte payloads (recent frames).
#[derive(Debug, Default)]
pub(crate) struct Ring {
    pub entries: std::collections::VecDeque<(u64, Arc<Vec<u8>>)>,
}

/// All keyspaces of one logical store.
///
/// Keyspaces are typed separately; a key never changes type, it is deleted
/// and re-created by its owning component.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub kv: HashMap<String, Entry<String>>,
    pub hashes: HashMap<String, Entry<HashMap<String, String>>>,
    pub sets: HashMap<String, Entry<HashSet<String>>>,
    pub counters: HashMap<String, Entry<i64>>,
    pub rings: HashMap<String, Ring>,
}

impl Tables {
    /// Drop expired entries across all keyspaces. Called opportunistically
    /// from mutating paths; correctness never depends on it running.
    pub fn sweep(&mut self) {
        self.kv.retain(|_, e| e.live());
        self.hashes.retain(|_, e| e.live());
        self.sets.retain(|_, e| e.live());
        self.counters.retain(|_, e| e.live());
    }
}

/// The in-process backend shared by every handle with the same URL.
#[derive(Debug)]
pub struct MemoryStore {
    pub(crate) tables: RwLock<Tables>,
    pub(crate) channels: ChannelTable,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            channels: ChannelTable::new(),
        }
    }
}

/// Process-wide registry of named memory stores.
///
/// `mem://local` from two handles resolves to the same [`MemoryStore`],
/// which is the "single logical instance" contract of the substrate.
pub(crate) fn attach(name: &str) -> Arc<MemoryStore> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MemoryStore>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = registry.lock().expect("memory store registry poisoned");
    guard
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(MemoryStore::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_without_ttl_is_live() {
        let entry = Entry::new("v".to_string(), None);
        assert!(entry.live());
    }

    #[test]
    fn test_entry_with_elapsed_ttl_is_dead() {
        let entry = Entry::new("v".to_string(), Some(Duration::ZERO));
        assert!(!entry.live());
    }

    #[test]
    fn test_sweep_removes_dead_entries() {
        let mut tables = Tables::default();
        tables
            .kv
            .insert("dead".into(), Entry::new("x".into(), Some(Duration::ZERO)));
        tables.kv.insert("live".into(), Entry::new("y".into(), None));
        tables.sweep();
        assert!(!tables.kv.contains_key("dead"));
        assert!(tables.kv.contains_key("live"));
    }

    #[test]
    fn test_attach_same_name_shares_store() {
        let a = attach("memory-test-shared");
        let b = attach("memory-test-shared");
        assert!(Arc::ptr_eq(&a, &b));
        let c = attach("memory-test-other");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
