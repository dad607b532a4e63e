//! Keyed cache with per-entry expiry
//!
//! Stands in for ad-hoc "last known X per user" state. Each component that
//! needs one owns its own instance, so lifetime and sharing stay explicit.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Concurrent map whose entries expire `ttl` after insertion
pub struct TtlCache<K, V> {
    entries: DashMap<K, (Instant, V)>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Insert or replace a value, restarting its lifetime
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (Instant::now() + self.ttl, value));
    }

    /// Get a live value; an expired entry is dropped on the way
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.0 > now {
                return Some(entry.1.clone());
            }
        }
        self.entries.remove_if(key, |_, (expires, _)| *expires <= now);
        None
    }

    /// Remove a value
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, (_, v))| v)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (expires, _)| *expires > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries (expired ones included until purged)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
