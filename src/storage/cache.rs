// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fast key-value store used for locks, rate counters, and the ledger cache.
//!
//! [`KeyValueStore`] exposes the handful of atomic primitives the webhook
//! pipeline needs. [`MemoryStore`] is the in-process implementation, an LRU
//! with per-entry expiry. A store shared between replicas can be plugged in
//! behind the same trait.
//!
//! Only plain [`KeyValueStore::set`] values may be evicted while live. Locks
//! and counters stay until they expire or are deleted; when the store is full
//! of them, new ones are refused with [`CacheError::Unavailable`].

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("value under {0} is not a counter")]
    NotACounter(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Atomic key-value primitives with expiry.
pub trait KeyValueStore: Send + Sync {
    /// Current value, or `None` if absent or expired.
    fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Unconditionally store `value` for `ttl`.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Store `value` only if no live entry exists. Returns whether it was stored.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Delete the entry only if it currently holds `expected`.
    fn delete_if_equals(&self, key: &str, expected: &str) -> CacheResult<bool>;

    /// Increment a counter, creating it with `window` expiry when absent.
    /// Returns the post-increment value.
    fn incr_with_expiry(&self, key: &str, window: Duration) -> CacheResult<u64>;

    /// Liveness check used by readiness.
    fn ping(&self) -> CacheResult<()> {
        self.get("__ping__").map(|_| ())
    }
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
    /// Plain cached value, safe to drop under pressure.
    evictable: bool,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process LRU store with per-entry TTL.
pub struct MemoryStore {
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryStore {
    /// Create a store holding at most `capacity` live keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, LruCache<String, CacheEntry>>> {
        self.cache
            .lock()
            .map_err(|_| CacheError::Unavailable("memory store lock poisoned".to_string()))
    }
}

/// Free a slot for `key` without dropping a live lock or counter.
fn make_room(cache: &mut LruCache<String, CacheEntry>, key: &str, now: Instant) -> CacheResult<()> {
    if cache.len() < cache.cap().get() || cache.contains(key) {
        return Ok(());
    }

    let victim = cache
        .iter()
        .rev()
        .find(|(_, entry)| !entry.is_live(now))
        .or_else(|| cache.iter().rev().find(|(_, entry)| entry.evictable))
        .map(|(k, _)| k.clone());

    match victim {
        Some(victim) => {
            cache.pop(&victim);
            Ok(())
        }
        None => Err(CacheError::Unavailable(
            "memory store is full of live locks and counters".to_string(),
        )),
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut cache = self.lock()?;
        let now = Instant::now();
        if let Some(entry) = cache.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
            // Expired, drop it
            cache.pop(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut cache = self.lock()?;
        let now = Instant::now();
        make_room(&mut cache, key, now)?;
        cache.put(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: now + ttl,
                evictable: true,
            },
        );
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut cache = self.lock()?;
        let now = Instant::now();
        if cache.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        make_room(&mut cache, key, now)?;
        cache.put(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: now + ttl,
                evictable: false,
            },
        );
        Ok(true)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let mut cache = self.lock()?;
        let now = Instant::now();
        let matches = cache
            .peek(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            cache.pop(key);
        }
        Ok(matches)
    }

    fn incr_with_expiry(&self, key: &str, window: Duration) -> CacheResult<u64> {
        let mut cache = self.lock()?;
        let now = Instant::now();
        if let Some(entry) = cache.get_mut(key) {
            if entry.is_live(now) {
                let current: u64 = entry
                    .value
                    .parse()
                    .map_err(|_| CacheError::NotACounter(key.to_string()))?;
                let next = current.saturating_add(1);
                entry.value = next.to_string();
                return Ok(next);
            }
        }
        make_room(&mut cache, key, now)?;
        cache.put(
            key.to_string(),
            CacheEntry {
                value: "1".to_string(),
                expires_at: now + window,
                evictable: false,
            },
        );
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(300);

    #[test]
    fn set_if_absent_only_once() {
        let store = MemoryStore::new(10);
        assert!(store.set_if_absent("k", "a", LONG).unwrap());
        assert!(!store.set_if_absent("k", "b", LONG).unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn expired_entry_can_be_reacquired() {
        let store = MemoryStore::new(10);
        assert!(store.set_if_absent("k", "a", Duration::from_millis(1)).unwrap());

        // Wait for TTL to expire
        std::thread::sleep(Duration::from_millis(5));

        assert!(store.get("k").unwrap().is_none());
        assert!(store.set_if_absent("k", "b", LONG).unwrap());
    }

    #[test]
    fn delete_if_equals_checks_owner() {
        let store = MemoryStore::new(10);
        store.set("k", "owner-1", LONG).unwrap();
        assert!(!store.delete_if_equals("k", "owner-2").unwrap());
        assert!(store.get("k").unwrap().is_some());
        assert!(store.delete_if_equals("k", "owner-1").unwrap());
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn counter_resets_after_window() {
        let store = MemoryStore::new(10);
        assert_eq!(store.incr_with_expiry("c", Duration::from_millis(1)).unwrap(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.incr_with_expiry("c", LONG).unwrap(), 1);
        assert_eq!(store.incr_with_expiry("c", LONG).unwrap(), 2);
        assert_eq!(store.incr_with_expiry("c", LONG).unwrap(), 3);
    }

    #[test]
    fn incr_on_non_counter_fails() {
        let store = MemoryStore::new(10);
        store.set("k", "text", LONG).unwrap();
        assert!(matches!(
            store.incr_with_expiry("k", LONG),
            Err(CacheError::NotACounter(_))
        ));
    }

    #[test]
    fn live_lock_survives_key_pressure() {
        let store = MemoryStore::new(2);
        assert!(store.set_if_absent("lock:a", "owner-1", LONG).unwrap());
        assert_eq!(store.incr_with_expiry("rate:1", LONG).unwrap(), 1);

        // Full of live pinned entries: refuse rather than evict
        assert!(matches!(
            store.incr_with_expiry("rate:2", LONG),
            Err(CacheError::Unavailable(_))
        ));
        assert!(!store.set_if_absent("lock:a", "owner-2", LONG).unwrap());
        assert_eq!(store.get("lock:a").unwrap().as_deref(), Some("owner-1"));
        assert_eq!(store.incr_with_expiry("rate:1", LONG).unwrap(), 2);
    }

    #[test]
    fn cached_values_make_way_for_locks() {
        let store = MemoryStore::new(2);
        store.set("idem:1", "completed:h1", LONG).unwrap();
        store.set("idem:2", "completed:h2", LONG).unwrap();

        assert!(store.set_if_absent("lock:a", "owner-1", LONG).unwrap());
        assert!(store.get("idem:1").unwrap().is_none());

        // Next write evicts the other cached value, never the lock
        store.set("idem:3", "completed:h3", LONG).unwrap();
        assert_eq!(store.get("lock:a").unwrap().as_deref(), Some("owner-1"));
        assert!(store.get("idem:2").unwrap().is_none());
    }

    #[test]
    fn expired_entries_are_reclaimed_first() {
        let store = MemoryStore::new(2);
        assert!(store
            .set_if_absent("lock:old", "owner-1", Duration::from_millis(1))
            .unwrap());
        store.set("idem:1", "completed:h1", LONG).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(store.set_if_absent("lock:new", "owner-2", LONG).unwrap());
        assert_eq!(store.get("idem:1").unwrap().as_deref(), Some("completed:h1"));
    }
}
