//! Experiment tracking sink
//!
//! The framework reports a handful of values per run (the resolved
//! configuration and one cache-hit flag per action). Where they end up is the
//! host's business; `Tracker` is the only contract.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Opaque sink for run-level values
pub trait Tracker: Send + Sync {
    fn set(&self, key: &str, value: Value);
}

/// Flag reported after each action: `action_<Name>_cache_hit`
pub fn cache_hit_key(action_name: &str) -> String {
    format!("action_{}_cache_hit", action_name)
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn set(&self, _key: &str, _value: Value) {}
}

/// Keeps reported values in memory, last write wins
#[derive(Debug, Default)]
pub struct MemoryTracker {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Tracker for MemoryTracker {
    fn set(&self, key: &str, value: Value) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }
}
