//! Bounded cache with a time-to-live and an injectable clock.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted: u64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion order; stale `(key, seq)` pairs left by overwrites are skipped.
    order: VecDeque<(K, u64)>,
    next_seq: u64,
    stats: CacheStats,
}

/// Overflow evicts the oldest insertion. Expired entries are dropped lazily
/// when looked up.
pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match inner.entries.get(key) {
            None => None,
            Some(entry) => Some(now.saturating_duration_since(entry.inserted_at) < self.ttl),
        };
        match fresh {
            Some(true) => {
                inner.stats.hits += 1;
                inner.entries.get(key).map(|e| e.value.clone())
            }
            Some(false) => {
                inner.entries.remove(key);
                inner.stats.expired += 1;
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((key.clone(), seq));
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                seq,
            },
        );

        while inner.entries.len() > self.capacity {
            let Some((oldest, oldest_seq)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&oldest).is_some_and(|e| e.seq == oldest_seq) {
                inner.entries.remove(&oldest);
                inner.stats.evicted += 1;
            }
        }
        // Drop stale order slots once they dominate the queue.
        if inner.order.len() > self.capacity * 2 {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, s)| entries.get(k).is_some_and(|e| e.seq == *s));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, clock: Arc<ManualClock>) -> TtlCache<&'static str, u32> {
        TtlCache::new(capacity, Duration::from_secs(300), clock)
    }

    #[test]
    fn entries_expire_lazily_after_ttl() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache(10, clock.clone());
        cache.insert("a", 1);

        clock.advance(Duration::from_secs(240));
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.len(), 1);

        clock.advance(Duration::from_secs(120));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                expired: 1,
                evicted: 0
            }
        );
    }

    #[test]
    fn overflow_evicts_oldest_insertion_even_if_recently_read() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache(2, clock);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.stats().evicted, 1);
    }

    #[test]
    fn reinserting_a_key_refreshes_its_position() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache(2, clock);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        cache.insert("c", 3);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"c"), Some(3));
    }
}
