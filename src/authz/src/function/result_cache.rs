//! Function result cache
//!
//! Results of cacheable custom functions are keyed by `name(arg1, arg2, ...)`.
//! Expired entries are dropped lazily on read and by a periodic sweep.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

/// A cached function result
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResult {
    /// Function return value
    pub result: Value,

    /// Absolute expiry in unix seconds; 0 never expires
    pub expires_at: i64,
}

impl FunctionResult {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at == 0 || now <= self.expires_at
    }
}

/// Thread-safe function result cache
#[derive(Debug, Default)]
pub struct FunctionResultCache {
    entries: DashMap<String, FunctionResult>,
}

impl FunctionResultCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for a call
    pub fn key(name: &str, args: &[Value]) -> String {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        format!("{}({})", name, args.join(", "))
    }

    /// Cached result, if present and not expired
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now().timestamp();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.result.clone());
            }
        } else {
            return None;
        }
        // Guard is released above, so removing cannot deadlock the shard.
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    /// Cache a result for `ttl_secs` seconds; 0 or less never expires
    pub fn insert(&self, key: String, result: Value, ttl_secs: i64) {
        let expires_at = if ttl_secs > 0 {
            Utc::now().timestamp() + ttl_secs
        } else {
            0
        };
        self.insert_entry(key, FunctionResult { result, expires_at });
    }

    /// Cache a result with an explicit expiry
    pub fn insert_entry(&self, key: String, entry: FunctionResult) {
        self.entries.insert(key, entry);
    }

    /// Drop every result of function `name`
    pub fn purge_function(&self, name: &str) {
        let prefix = format!("{}(", name);
        self.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop every expired result, returning how many were dropped
    pub fn clean_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Cleaned expired function results");
        }
        removed
    }

    /// Number of cached results
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
