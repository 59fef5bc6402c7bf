// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded LRU + TTL cache for read-heavy adapter endpoints.
//!
//! Keys are structured `<operation>:<arg1>:<arg2>` strings (see
//! [`cache_key`]); mutators invalidate by key *prefix*, declared alongside
//! their catalog entry (`CatalogEntry::invalidates`) rather than scattered
//! across call sites, per the adapter's cache-invalidation design note.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    value: Value,
    inserted_at: Instant,
    /// Position in the recency order; higher is more recently used.
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    max_entries: usize,
    ttl: Duration,
    clock: u64,
}

/// Thread-safe bounded LRU cache with TTL expiry, keyed by string.
pub struct AdapterCache {
    inner: Mutex<Inner>,
}

impl AdapterCache {
    /// Construct a cache holding at most `max_entries`, each entry valid for
    /// `ttl` from insertion.
    #[must_use]
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                max_entries: max_entries.max(1),
                ttl,
                clock: 0,
            }),
        }
    }

    /// Look up `key`. Returns `None` on miss or stale-TTL expiry (which also
    /// evicts the entry).
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let tick = inner.clock;
        let ttl = inner.ttl;
        let hit = match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => {
                entry.last_used = tick;
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => None,
        };
        if hit.is_none() {
            inner.entries.remove(key);
        }
        hit
    }

    /// Insert or overwrite `key`, evicting the least-recently-used entry if
    /// the cache is at capacity.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let tick = inner.clock;
        let key = key.into();
        let max_entries = inner.max_entries;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= max_entries {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                last_used: tick,
            },
        );
    }

    /// Remove every entry whose key starts with `prefix`. Used by write and
    /// command operations to invalidate stale reads after a mutation.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(prefix, removed, "cache: invalidated by prefix");
        }
    }

    /// Number of live entries (including not-yet-lazily-expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a structured cache key `<operation>:<arg1>:<arg2>` from a method
/// name and its JSON arguments.
///
/// Object arguments contribute their values in key-sorted order (since
/// `serde_json::Value::Object` is a `BTreeMap` under
/// `preserve_order`-less configurations used here); array and scalar
/// arguments are rendered directly. This keeps keys stable across calls
/// with identical semantic arguments regardless of field insertion order.
#[must_use]
pub fn cache_key(operation: &str, args: &Value) -> String {
    let mut parts = vec![operation.to_string()];
    match args {
        Value::Object(map) => {
            for (k, v) in map {
                parts.push(format!("{k}={}", compact(v)));
            }
        }
        Value::Null => {}
        other => parts.push(compact(other)),
    }
    parts.join(":")
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
