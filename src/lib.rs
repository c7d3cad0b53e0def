//! Tiercache - Multi-Tier Read-Through Cache
//!
//! Serves values for opaque string keys from an ordered chain of cache
//! layers, falling back to an authoritative origin on a total miss.
//!
//! # Architecture
//!
//! ```text
//! HTTP front end → Cache Manager → [in-process → memcached → Redis] → Origin
//! ```
//!
//! A hit in a slower layer is backfilled into every faster layer that
//! missed; an origin result is written to all layers.
//!
//! # Modules
//!
//! - [`cache`] - Layer contract, layer implementations and the manager
//! - [`error`] - Error types
//! - [`origin`] - Origin fetcher contract and the HTTP fetcher
//! - [`server`] - HTTP/1.1 front end

pub mod cache;
pub mod error;
pub mod origin;
pub mod server;

// Re-export commonly used types
pub use cache::{
    build_layers, CacheEntry, CacheLayer, CacheManager, CacheMetrics, CacheResult, CacheSettings,
    Source,
};
pub use error::{Error, Result};
pub use origin::{HttpOriginConfig, HttpOriginFetcher, OriginFetcher, OriginResponse};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
