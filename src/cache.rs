//! Bounded in-memory memoization cache with per-entry TTL.
//!
//! Eviction is by insertion order: when the cache is full, inserting a new key
//! drops the oldest-inserted entry. Overwriting an existing key re-inserts it,
//! so it becomes the newest entry and is the last to be evicted.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Insertion sequence number -> key, oldest first
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn remove<Q>(&mut self, key: &Q) -> Option<CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
        }
    }
}

/// Thread-safe memoization cache bounded by `max_size` entries, each valid for `ttl`.
pub struct TimestampedCache<K, V> {
    name: &'static str,
    max_size: usize,
    ttl: Duration,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> TimestampedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_size` entries (at least one).
    #[must_use]
    pub fn new(name: &'static str, max_size: usize, ttl: Duration) -> Self {
        Self {
            name,
            max_size: max_size.max(1),
            ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Returns the value if present and younger than the TTL.
    /// An expired entry is removed on access.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            None => return None,
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };

        if expired {
            state.remove(key);
            tracing::debug!(cache = self.name, "entry expired");
            None
        } else {
            state.entries.get(key).map(|entry| entry.value.clone())
        }
    }

    /// Insert or overwrite a value, evicting the oldest-inserted entry when full.
    pub fn set(&self, key: K, value: V) {
        let mut state = self.state.lock();
        let replaced = state.remove(&key).is_some();
        if !replaced && state.entries.len() >= self.max_size {
            state.evict_oldest();
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().remove(key).map(|entry| entry.value)
    }

    /// Whether a live (non-expired) entry exists for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Number of stored entries, including expired ones not yet accessed.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WeatherSnapshot;
    use rstest::rstest;

    fn cache(max_size: usize, ttl_secs: u64) -> TimestampedCache<String, u32> {
        TimestampedCache::new("test", max_size, Duration::from_secs(ttl_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_set_returns_value() {
        let cache = cache(10, 60);
        cache.set("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[rstest]
    #[case(1)]
    #[case(60)]
    #[case(600)]
    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl(#[case] ttl_secs: u64) {
        let cache = cache(10, ttl_secs);
        cache.set("a".to_string(), 1);

        tokio::time::advance(Duration::from_secs(ttl_secs) - Duration::from_millis(1)).await;
        assert_eq!(cache.get("a"), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_evicts_oldest_inserted() {
        let cache = cache(3, 60);
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            cache.set(key.to_string(), i as u32);
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(1));
        assert_eq!(cache.get("d"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_do_not_change_eviction_order() {
        let cache = cache(2, 60);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        assert_eq!(cache.get("a"), Some(1));

        cache.set("c".to_string(), 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_reinserts_as_newest() {
        let cache = cache(2, 60);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        cache.set("a".to_string(), 10);
        assert_eq!(cache.len(), 2);

        cache.set("c".to_string(), 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_restarts_ttl() {
        let cache = cache(2, 10);
        cache.set("a".to_string(), 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("a".to_string(), 2);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_remove() {
        let cache = cache(5, 60);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        assert_eq!(cache.remove("a"), Some(1));
        assert!(!cache.contains_key("a"));

        cache.clear();
        assert!(cache.is_empty());
        cache.set("c".to_string(), 3);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = cache(0, 60);
        assert_eq!(cache.max_size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_round_trip() {
        let cache = TimestampedCache::new("weather", 1000, Duration::from_secs(600));
        let snapshot = WeatherSnapshot {
            temperature: 14.2,
            weathercode: 2,
            time: "2025-03-01T10:00".to_string(),
        };
        cache.set("London|51.5074|-0.1278".to_string(), snapshot.clone());
        assert_eq!(cache.get("London|51.5074|-0.1278"), Some(snapshot));
    }
}
