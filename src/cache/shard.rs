//! Sharded LRU Map
//!
//! Bounded concurrent map split into independently locked shards.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Recency is a global access tick stored per slot, so hits only need the
//!   read lock
//! - Capacity is divided evenly across shards; a full shard evicts its own
//!   least-recently-used slot, which makes the policy approximate LRU
//!   globally and exact LRU per shard
//! - A caller may flag values as stale; a stale slot is evicted before any
//!   live one

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Value plus its last-use tick
struct Slot<V> {
    value: V,
    last_used: AtomicU64,
}

/// Result of an insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    /// An existing value for the key was replaced
    pub replaced: bool,
    /// Key evicted to make room, if any
    pub evicted: Option<String>,
    /// The evicted value was stale rather than least recently used
    pub evicted_stale: bool,
}

/// Single shard containing a bounded hashmap
struct LruShard<V> {
    map: RwLock<HashMap<String, Slot<V>>>,
    capacity: usize,
}

impl<V: Clone> LruShard<V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn get(&self, key: &str, tick: u64) -> Option<V> {
        let guard = self.map.read();
        guard.get(key).map(|slot| {
            slot.last_used.store(tick, Ordering::Relaxed);
            slot.value.clone()
        })
    }

    fn insert<F>(&self, key: String, value: V, tick: u64, is_stale: F) -> InsertOutcome
    where
        F: Fn(&V) -> bool,
    {
        let mut guard = self.map.write();

        if let Some(slot) = guard.get_mut(&key) {
            slot.value = value;
            slot.last_used.store(tick, Ordering::Relaxed);
            return InsertOutcome {
                replaced: true,
                evicted: None,
                evicted_stale: false,
            };
        }

        let mut evicted = None;
        let mut evicted_stale = false;
        if guard.len() >= self.capacity {
            let stale = guard
                .iter()
                .find(|(_, slot)| is_stale(&slot.value))
                .map(|(k, _)| k.clone());
            evicted_stale = stale.is_some();
            let victim = stale.or_else(|| {
                guard
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                    .map(|(k, _)| k.clone())
            });
            if let Some(victim) = victim {
                guard.remove(&victim);
                evicted = Some(victim);
            }
        }

        guard.insert(
            key,
            Slot {
                value,
                last_used: AtomicU64::new(tick),
            },
        );

        InsertOutcome {
            replaced: false,
            evicted,
            evicted_stale,
        }
    }

    fn remove_if<F>(&self, key: &str, pred: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.map.write();
        // Re-check under the write lock: a writer may have replaced the value
        match guard.get(key) {
            Some(slot) if pred(&slot.value) => {
                guard.remove(key);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn clear(&self) {
        self.map.write().clear();
    }
}

/// Bounded sharded map with per-shard LRU eviction
pub struct ShardedLru<V> {
    shards: Box<[LruShard<V>]>,
    /// Global recency counter
    tick: AtomicU64,
    capacity: usize,
}

impl<V: Clone> ShardedLru<V> {
    /// Create a map holding at most `capacity` entries.
    ///
    /// `shard_count` is rounded up to a power of two and then reduced until
    /// every shard can hold at least one entry.
    pub fn new(capacity: usize, shard_count: usize) -> Self {
        let capacity = capacity.max(1);
        let mut shard_count = shard_count.max(1).next_power_of_two();
        while shard_count > 1 && shard_count > capacity {
            shard_count /= 2;
        }
        let per_shard = capacity / shard_count;

        let shards: Vec<LruShard<V>> = (0..shard_count).map(|_| LruShard::new(per_shard)).collect();

        Self {
            shards: shards.into_boxed_slice(),
            tick: AtomicU64::new(0),
            capacity: per_shard * shard_count,
        }
    }

    /// Effective capacity (never above the requested one)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_for(&self, key: &str) -> &LruShard<V> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) & (self.shards.len() - 1);
        &self.shards[idx]
    }

    #[inline]
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get a value and mark it most recently used
    pub fn get(&self, key: &str) -> Option<V> {
        let tick = self.next_tick();
        self.shard_for(key).get(key, tick)
    }

    /// Insert or replace a value, evicting the shard's LRU slot when full
    pub fn insert(&self, key: impl Into<String>, value: V) -> InsertOutcome {
        self.insert_with(key, value, |_| false)
    }

    /// Like [`ShardedLru::insert`], but a full shard first evicts any slot
    /// whose value `is_stale` flags, falling back to the LRU slot
    pub fn insert_with<F>(&self, key: impl Into<String>, value: V, is_stale: F) -> InsertOutcome
    where
        F: Fn(&V) -> bool,
    {
        let key = key.into();
        let tick = self.next_tick();
        self.shard_for(&key).insert(key, value, tick, is_stale)
    }

    /// Remove the value for `key` if `pred` holds for the current value
    pub fn remove_if<F>(&self, key: &str, pred: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        self.shard_for(key).remove_if(key, pred)
    }

    /// Total entries across shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
