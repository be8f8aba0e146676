//! Local key-value store owned by the node.
//!
//! Protocols mutate the store only through these methods, which serialize
//! internally; no protocol lock is ever held across a store call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// In-memory map with operation counters.
#[derive(Default)]
pub struct KvStore {
    data: Mutex<HashMap<String, String>>,
    operations: AtomicU64,
    successes: AtomicU64,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore::default()
    }

    pub fn read(&self, key: &str) -> Option<String> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock().unwrap();
        let value = data.get(key).cloned();
        if value.is_some() {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn write(&self, key: &str, value: &str) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Remove a key. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let removed = self.data.lock().unwrap().remove(key).is_some();
        if removed {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        let ops = self.operation_count();
        if ops == 0 {
            return 0.0;
        }
        self.success_count() as f64 / ops as f64
    }
}
