//! Bounded, time-expiring cache with FIFO eviction.
//!
//! Reads go straight to the concurrent map and never take the cache lock.
//! The lock guards only structural mutation: inserting, evicting, and lazily
//! deleting an entry that a reader found expired. Eviction follows insertion
//! order; reading an entry does not make it younger.

use std::borrow::Borrow;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Stand-in expiry for TTLs too large to add to `Instant::now()`.
const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Insertion-order queues shorter than this are never compacted.
const COMPACT_MIN: usize = 64;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_size: usize,
    /// Time-to-live applied by callers that do not pick their own.
    #[serde(rename = "ttl_secs", with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(ttl.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    /// Insertion sequence; identifies this particular write of the key.
    seq: u64,
}

struct InsertionOrder<K> {
    /// One record per `put`. A record is stale once its key was overwritten
    /// or removed, i.e. when the live entry carries a different `seq`.
    queue: VecDeque<(K, u64)>,
    next_seq: u64,
}

/// Bounded cache mapping keys to values that expire after a TTL.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    order: Mutex<InsertionOrder<K>>,
    max_size: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(max_size.min(4096)),
            order: Mutex::new(InsertionOrder {
                queue: VecDeque::new(),
                next_seq: 0,
            }),
            max_size,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Look up `key`, returning `None` if it is absent or expired.
    ///
    /// An expired entry is deleted under the cache lock, but only if it is
    /// still the same write that was observed without the lock.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let observed = {
            let entry = self.entries.get(key)?;
            if Instant::now() < entry.expires_at {
                return Some(entry.value.clone());
            }
            entry.seq
        };

        self.remove_expired(key, observed);
        None
    }

    /// Delete `key` if its live entry is still the write with sequence `seq`.
    fn remove_expired<Q>(&self, key: &Q, seq: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _order = self.lock_order();
        self.entries
            .remove_if(key, |_, entry| entry.seq == seq)
            .is_some()
    }

    /// Insert or overwrite `key`, then evict until the cache is within
    /// bounds and its oldest entry is unexpired.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + FOREVER);

        let mut order = self.lock_order();
        let seq = order.next_seq;
        order.next_seq += 1;

        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                expires_at,
                seq,
            },
        );
        order.queue.push_back((key, seq));

        self.evict(&mut order, now);
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _order = self.lock_order();
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn clear(&self) {
        let mut order = self.lock_order();
        self.entries.clear();
        order.queue.clear();
    }

    /// Number of stored entries, including expired ones not yet deleted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self, order: &mut InsertionOrder<K>, now: Instant) {
        while let Some((key, seq)) = order.queue.front() {
            let live_expiry = self
                .entries
                .get(key)
                .filter(|entry| entry.seq == *seq)
                .map(|entry| entry.expires_at);

            match live_expiry {
                // Stale record: the key was overwritten or already deleted.
                None => {}
                Some(expires_at) if self.entries.len() > self.max_size || expires_at <= now => {
                    self.entries.remove(key);
                }
                Some(_) => break,
            }
            order.queue.pop_front();
        }

        if order.queue.len() > self.max_size.saturating_mul(2).max(COMPACT_MIN) {
            let before = order.queue.len();
            order.queue.retain(|(key, seq)| {
                self.entries
                    .get(key)
                    .is_some_and(|entry| entry.seq == *seq)
            });
            tracing::trace!(before, after = order.queue.len(), "Compacted cache insertion order");
        }
    }

    fn lock_order(&self) -> MutexGuard<'_, InsertionOrder<K>> {
        match self.order.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Cache lock poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}
