//! Layer Chain Configuration
//!
//! Turns an ordered list of layer tokens (`inapp,memcache,redis`) plus
//! per-kind overrides into a concrete layer chain.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::clock::SharedClock;
use super::in_process::{InProcessConfig, InProcessLayer, DEFAULT_IN_PROCESS_CAPACITY, DEFAULT_SHARD_COUNT};
use super::layer::{CacheLayer, LayerKind};
use super::memcache::{MemcacheConfig, MemcacheLayer};
use super::redis::{RedisConfig, RedisLayer};
use crate::error::{Error, Result};

/// TTL of the first layer when none is configured
const BASE_TTL_SECS: u64 = 10;

/// Each later position lives this many times longer
const TTL_GROWTH: u64 = 5;

/// Default layer order
pub const DEFAULT_LAYERS: &str = "inapp,memcache,redis";

/// Configuration for building the layer chain
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Layer tokens, fastest first
    pub layers: Vec<String>,
    pub inapp_ttl: Option<Duration>,
    pub memcache_ttl: Option<Duration>,
    pub redis_ttl: Option<Duration>,
    /// In-process entry capacity
    pub inapp_capacity: usize,
    pub memcache_addr: String,
    pub redis_url: String,
    pub redis_prefix: String,
    /// Per-operation timeout for networked layers
    pub layer_timeout: Duration,
    /// Reject unknown layer tokens instead of skipping them
    pub strict_layers: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let redis = RedisConfig::default();
        Self {
            layers: parse_layer_list(DEFAULT_LAYERS),
            inapp_ttl: None,
            memcache_ttl: None,
            redis_ttl: None,
            inapp_capacity: DEFAULT_IN_PROCESS_CAPACITY,
            memcache_addr: MemcacheConfig::default().addr,
            redis_url: redis.url,
            redis_prefix: redis.key_prefix,
            layer_timeout: Duration::from_millis(500),
            strict_layers: false,
        }
    }
}

impl CacheSettings {
    fn ttl_override(&self, kind: LayerKind) -> Option<Duration> {
        match kind {
            LayerKind::InProcess => self.inapp_ttl,
            LayerKind::SharedMemory => self.memcache_ttl,
            LayerKind::Persistent => self.redis_ttl,
        }
    }
}

/// Split a comma-separated token list, dropping empty items
pub fn parse_layer_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// TTL used for a layer at `position` when none is configured
pub fn default_ttl(position: usize) -> Duration {
    let factor = u32::try_from(position)
        .ok()
        .and_then(|p| TTL_GROWTH.checked_pow(p))
        .unwrap_or(u64::MAX);
    Duration::from_secs(BASE_TTL_SECS.saturating_mul(factor))
}

/// Resolve tokens to layer kinds and TTLs without building anything
pub fn plan_layers(settings: &CacheSettings) -> Result<Vec<(LayerKind, Duration)>> {
    let mut plan = Vec::with_capacity(settings.layers.len());

    for (position, token) in settings.layers.iter().enumerate() {
        let kind = match token.parse::<LayerKind>() {
            Ok(kind) => kind,
            Err(e) if settings.strict_layers => return Err(e),
            Err(_) => {
                warn!(token = %token, position, "skipping unknown cache layer");
                continue;
            }
        };
        let ttl = settings
            .ttl_override(kind)
            .unwrap_or_else(|| default_ttl(position));
        plan.push((kind, ttl));
    }

    Ok(plan)
}

/// Build the layer chain described by `settings`
pub fn build_layers(
    settings: &CacheSettings,
    clock: SharedClock,
) -> Result<Vec<Arc<dyn CacheLayer>>> {
    let plan = plan_layers(settings)?;
    let mut layers: Vec<Arc<dyn CacheLayer>> = Vec::with_capacity(plan.len());

    for (kind, ttl) in plan {
        let layer: Arc<dyn CacheLayer> = match kind {
            LayerKind::InProcess => {
                if settings.inapp_capacity == 0 {
                    return Err(Error::Config(
                        "in-process capacity must be greater than zero".to_string(),
                    ));
                }
                Arc::new(InProcessLayer::new(
                    InProcessConfig {
                        ttl,
                        capacity: settings.inapp_capacity,
                        shard_count: DEFAULT_SHARD_COUNT,
                    },
                    clock.clone(),
                )?)
            }
            LayerKind::SharedMemory => Arc::new(MemcacheLayer::new(
                MemcacheConfig {
                    addr: settings.memcache_addr.clone(),
                    ttl,
                    op_timeout: settings.layer_timeout,
                    ..MemcacheConfig::default()
                },
                clock.clone(),
            )?),
            LayerKind::Persistent => Arc::new(RedisLayer::new(
                RedisConfig {
                    url: settings.redis_url.clone(),
                    key_prefix: settings.redis_prefix.clone(),
                    ttl,
                    op_timeout: settings.layer_timeout,
                },
                clock.clone(),
            )?),
        };

        info!(layer = %kind, ttl_secs = ttl.as_secs(), "cache layer configured");
        layers.push(layer);
    }

    Ok(layers)
}
