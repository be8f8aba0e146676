//! Read cache fronting the replication protocols.
//!
//! Entries carry their insertion time; a lookup past the TTL removes the
//! entry and reports a miss. When the map grows past capacity the oldest
//! entry (by insertion time) is evicted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Default capacity bound.
pub const DEFAULT_CAPACITY: usize = 1000;

struct CacheEntry {
    value: String,
    inserted_at: Instant,
}

/// TTL + capacity bounded key/value cache.
pub struct ReadCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl ReadCache {
    pub fn new(ttl: Duration, capacity: usize) -> ReadCache {
        ReadCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Look up a live entry. Expired entries are removed on access.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an entry, evicting the oldest on overflow.
    pub fn insert(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                inserted_at: Instant::now(),
            },
        );

        if entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
            }
        }
    }

    /// Drop an entry. Called on the write path before dispatch so a
    /// successful write can never leave a stale value visible.
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        ReadCache::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}
