//! Bounded TTL caches.
//!
//! [`TokenCache`] sits in front of the token store so a processing burst
//! reads each account's token once instead of once per task. Entries are
//! never invalidated on writes: update finalization always re-reads the store
//! before writing, so a stale cached snapshot only affects task reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::core::Token;

struct Entry<V> {
    value: V,
    inserted: Instant,
    last_used: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    tick: u64,
}

/// Size- and age-bounded map with least-recently-used eviction.
///
/// Cloning yields another handle to the same storage.
pub struct LruTtlCache<V> {
    capacity: usize,
    ttl: Duration,
    inner: Arc<Mutex<Inner<V>>>,
}

impl<V> Clone for LruTtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            ttl: self.ttl,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> LruTtlCache<V> {
    /// Create a cache holding at most `capacity` entries for at most `ttl`.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                tick: 0,
            })),
        }
    }

    /// Fetch a live entry and mark it recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                entry.last_used = tick;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    /// Insert or replace an entry, evicting if the cache is full.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let ttl = self.ttl;
            inner.entries.retain(|_, e| e.inserted.elapsed() < ttl);
            if inner.entries.len() >= self.capacity {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    inner.entries.remove(&oldest);
                }
            }
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                last_used: tick,
            },
        );
    }

    /// Drop an entry.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().entries.remove(key).map(|e| e.value)
    }

    /// Number of stored entries, expired ones included until touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Last-known token snapshots keyed by access identifier.
pub type TokenCache = LruTtlCache<Token>;

/// Scratch cache handed to integrator task workers.
pub type ScratchCache = LruTtlCache<Value>;

impl TokenCache {
    /// Cache a token under its access identifier.
    pub fn put_token(&self, token: &Token) {
        self.insert(token.access_token.clone(), token.clone());
    }
}
