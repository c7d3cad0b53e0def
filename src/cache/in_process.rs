//! In-Process Layer - RAM-based Hot Tier
//!
//! Bounded sharded map living for the life of the process.
//!
//! # Design
//!
//! - [`ShardedLru`] with a lock per shard; locks are never held across an
//!   await point
//! - Lazy expiration: an expired entry is dropped when a `get` finds it
//! - Fixed entry capacity with per-shard LRU eviction; a full shard drops an
//!   expired entry before touching a live one

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::clock::SharedClock;
use super::entry::CacheEntry;
use super::layer::{validate_ttl, CacheLayer};
use super::shard::ShardedLru;
use crate::error::Result;

/// Default entry capacity
pub const DEFAULT_IN_PROCESS_CAPACITY: usize = 10_000;

/// Default shard count
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// In-process layer configuration
#[derive(Debug, Clone)]
pub struct InProcessConfig {
    /// Entry time-to-live
    pub ttl: Duration,
    /// Maximum number of entries
    pub capacity: usize,
    /// Number of lock shards
    pub shard_count: usize,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            capacity: DEFAULT_IN_PROCESS_CAPACITY,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

/// In-process cache layer
pub struct InProcessLayer {
    storage: ShardedLru<CacheEntry>,
    ttl: Duration,
    clock: SharedClock,
    /// Entries dropped for capacity
    evictions: AtomicU64,
    /// Entries dropped because they were found expired
    expirations: AtomicU64,
}

impl InProcessLayer {
    /// Create a new in-process layer
    pub fn new(config: InProcessConfig, clock: SharedClock) -> Result<Self> {
        let ttl = validate_ttl("inapp", config.ttl)?;
        Ok(Self {
            storage: ShardedLru::new(config.capacity, config.shard_count),
            ttl,
            clock,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    /// Number of stored slots, including expired ones not yet dropped
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Effective capacity
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Clear the layer
    pub fn clear(&self) {
        self.storage.clear();
    }
}

impl std::fmt::Debug for InProcessLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLayer")
            .field("ttl", &self.ttl)
            .field("capacity", &self.storage.capacity())
            .field("len", &self.storage.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheLayer for InProcessLayer {
    fn name(&self) -> &str {
        "inapp"
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.storage.get(key)?;
        let now = self.clock.now();

        if entry.is_expired(self.ttl, now) {
            let ttl = self.ttl;
            if self.storage.remove_if(key, |current| current.is_expired(ttl, now)) {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                trace!(key, "dropped expired in-process entry");
            }
            return None;
        }

        Some(entry)
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let (ttl, now) = (self.ttl, self.clock.now());
        let outcome = self
            .storage
            .insert_with(key, entry.clone(), |current| current.is_expired(ttl, now));
        match outcome.evicted {
            Some(evicted) if outcome.evicted_stale => {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                trace!(key = %evicted, "dropped expired in-process entry to make room");
            }
            Some(evicted) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %evicted, "evicted in-process entry");
            }
            None => {}
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
