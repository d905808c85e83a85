//! A fixed-capacity least-recently-used cache whose entries expire.
//!
//! Used to memoize short-lived lookups, e.g. recent validation verdicts or
//! per-proxy HTTP clients. Expired entries are treated as absent even while
//! they still occupy a slot.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// LRU cache with a per-entry time to live
pub struct TtlCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    /// Create a cache holding at most `capacity` entries, each valid for `ttl`.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Look up `key`, marking it as most recently used.
    ///
    /// Expired entries are dropped and reported as missing.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.lock();
        let expired = match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    /// Whether a live entry exists, without touching its recency
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.lock()
            .peek(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Insert with the default time to live.
    ///
    /// Returns the least recently used entry if it had to make room.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        self.put_with_ttl(key, value, self.ttl)
    }

    /// Insert with a custom time to live.
    ///
    /// Returns the least recently used entry if it had to make room.
    /// Replacing the value of an existing key evicts nothing.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) -> Option<(K, V)> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.lock()
            .push(key.clone(), entry)
            .filter(|(evicted, _)| *evicted != key)
            .map(|(evicted, entry)| (evicted, entry.value))
    }

    /// Remove `key`, returning its value if it was still live
    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock()
            .pop(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.lock();
        let expired: Vec<K> = cache
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired.len()
    }

    /// Number of occupied slots, including expired entries not yet purged
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no slot is occupied
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Entry<V>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Hash + Eq, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, capacity) = self
            .inner
            .lock()
            .map(|cache| (cache.len(), cache.cap().get()))
            .unwrap_or_default();
        f.debug_struct("TtlCache")
            .field("len", &len)
            .field("capacity", &capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let cache = TtlCache::new(3, TTL);
        assert_eq!(cache.put("a", 1), None);
        assert_eq!(cache.put("b", 2), None);
        assert_eq!(cache.put("c", 3), None);

        assert_eq!(cache.put("d", 4), Some(("a", 1)));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let cache = TtlCache::new(3, TTL);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.put("d", 4), Some(("b", 2)));
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_replacing_a_key_evicts_nothing() {
        let cache = TtlCache::new(2, TTL);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.put("a", 10), None);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn test_contains_key_does_not_refresh() {
        let cache = TtlCache::new(2, TTL);
        cache.put("a", 1);
        cache.put("b", 2);
        assert!(cache.contains_key(&"a"));
        assert_eq!(cache.put("c", 3), Some(("a", 1)));
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let cache = TtlCache::new(0, TTL);
        cache.put("a", 1);
        assert_eq!(cache.put("b", 2), Some(("a", 1)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_absent() {
        let cache = TtlCache::new(10, TTL);
        cache.put("a", 1);
        cache.put_with_ttl("b", 2, TTL * 3);

        tokio::time::advance(TTL).await;

        assert_eq!(cache.get(&"a"), None);
        assert!(!cache.contains_key(&"a"));
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = TtlCache::new(10, TTL);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put_with_ttl("c", 3, TTL * 2);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove(&"c"), Some(3));
        assert!(cache.is_empty());
    }
}
