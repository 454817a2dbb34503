//! Time- and size-bounded cache
//!
//! Shared by the idempotency table and the rules decision cache. Entries
//! expire after a fixed TTL and the least recently used entry is evicted when
//! the table is full. The cache is not synchronized; owners wrap it in their
//! own lock.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Cache statistics. Passive only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because the table was full
    pub evictions: u64,
    /// Entries dropped because their TTL passed
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct Timed<V> {
    value: V,
    inserted_at: Instant,
}

/// LRU table whose entries also expire after `ttl`.
#[derive(Debug)]
pub struct TtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, Timed<V>>,
    ttl: Duration,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Look up a live entry, dropping it if it has expired.
    pub fn get(&mut self, key: &K, now: Instant) -> Option<V> {
        let expired = match self.entries.peek(key) {
            Some(entry) => self.is_expired(entry, now),
            None => {
                self.stats.misses += 1;
                return None;
            }
        };

        if expired {
            self.entries.pop(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        self.stats.hits += 1;
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace an entry. Returns the key of a live entry evicted
    /// to make room, if any.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Option<K> {
        let inserted = key.clone();
        let displaced = self.entries.push(
            key,
            Timed {
                value,
                inserted_at: now,
            },
        );

        match displaced {
            Some((old, entry)) if old != inserted => {
                if self.is_expired(&entry, now) {
                    self.stats.expirations += 1;
                    None
                } else {
                    self.stats.evictions += 1;
                    Some(old)
                }
            }
            _ => None,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_expired(&self, entry: &Timed<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) >= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let mut cache = TtlCache::new(10, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(cache.get(&"a", now), None);
        cache.insert("a", 1, now);
        assert_eq!(cache.get(&"a", now), Some(1));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_entries_expire() {
        let mut cache = TtlCache::new(10, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert("a", 1, now);

        let later = now + Duration::from_secs(61);
        assert_eq!(cache.get(&"a", later), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let mut cache = TtlCache::new(10, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert("old", 1, now);
        cache.insert("new", 2, now + Duration::from_secs(30));

        let removed = cache.sweep(now + Duration::from_secs(70));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"new", now + Duration::from_secs(70)), Some(2));
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let mut cache = TtlCache::new(2, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert("a", 1, now);
        cache.insert("b", 2, now);
        // Touch "a" so "b" is the LRU entry.
        assert_eq!(cache.get(&"a", now), Some(1));
        assert_eq!(cache.insert("c", 3, now), Some("b"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b", now), None);
        assert_eq!(cache.get(&"a", now), Some(1));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_does_not_count_as_eviction() {
        let mut cache = TtlCache::new(1, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert("a", 1, now);
        assert_eq!(cache.insert("a", 2, now), None);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get(&"a", now), Some(2));
    }

    #[test]
    fn test_displacing_expired_entry_is_not_an_eviction() {
        let mut cache = TtlCache::new(1, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert("a", 1, now);
        assert_eq!(cache.insert("b", 2, now + Duration::from_secs(61)), None);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().expirations, 1);
    }
}
