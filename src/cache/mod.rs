//! Multi-Tier Read-Through Cache
//!
//! An ordered chain of cache layers in front of an authoritative origin.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Cache Manager                                      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  In-Process (inapp)   │ Shared (memcache)   │ Persistent (redis)         │
//! │  ┌────────────────┐   │ ┌────────────────┐  │ ┌────────────────────┐     │
//! │  │ ShardedLru     │   │ │ Text protocol  │  │ │ deadpool-redis     │     │
//! │  │ (16-way)       │   │ │ over TCP       │  │ │ SET EX / GET       │     │
//! │  │ TTL: 10s       │   │ │ TTL: 50s       │  │ │ TTL: 250s          │     │
//! │  └────────────────┘   │ └────────────────┘  │ └────────────────────┘     │
//! │         ▲             │         ▲           │           │                │
//! │         └─────────────┴─────────┴── backfill ◄──────────┘                │
//! │                                                                          │
//! │                   all miss ──► Origin fetch ──► fill all                 │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Layers are consulted fastest first; the first hit wins
//! - A layer failure is a miss (reads) or a logged soft failure (writes)
//! - The origin is called only on a total miss, and a failed fetch writes
//!   nothing
//! - Entries carry their own store time; every layer enforces its own TTL
//!   against an injectable [`Clock`]

mod clock;
mod entry;
mod in_process;
mod layer;
mod manager;
mod memcache;
mod metrics;
mod redis;
mod settings;
mod shard;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use entry::{CacheEntry, MAX_CONTENT_TYPE_LEN};
pub use in_process::{InProcessConfig, InProcessLayer, DEFAULT_IN_PROCESS_CAPACITY, DEFAULT_SHARD_COUNT};
pub use layer::{CacheLayer, LayerKind};
pub use manager::{CacheManager, CacheManagerBuilder, CacheResult, Source};
pub use memcache::{
    is_valid_key, MemcacheConfig, MemcacheLayer, DEFAULT_MAX_ITEM_SIZE, DEFAULT_POOL_SIZE, MAX_KEY_LEN,
};
pub use metrics::{CacheMetrics, CacheObserver, LookupOutcome, NoopObserver, WriteKind};
pub use self::redis::{RedisConfig, RedisLayer};
pub use settings::{build_layers, default_ttl, parse_layer_list, plan_layers, CacheSettings, DEFAULT_LAYERS};
pub use shard::{InsertOutcome, ShardedLru};
