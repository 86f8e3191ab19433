//! In-memory TTL cache for slow-changing upstream resources
//!
//! Avoids repeated reads of subreddit metadata and account info within a
//! short horizon. Entries are evicted lazily when read past their TTL; there
//! is no background sweeper.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CachedEntry {
    value: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
}

/// TTL map owned by the orchestrator and shared by handle, never a global.
#[derive(Default)]
pub struct Cache {
    entries: Mutex<HashMap<String, CachedEntry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key, evicting it first if its TTL has elapsed.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get(key) {
            if entry.stored_at.elapsed() > entry.ttl {
                entries.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }

        None
    }

    pub fn put(&self, key: impl Into<String>, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.into(),
            CachedEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Number of entries currently held, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
