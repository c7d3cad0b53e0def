//! Persistent Layer - Redis client
//!
//! Pooled async Redis connections via `deadpool-redis`. Values are written
//! with `SET key value EX ttl` so Redis expires them on its own; reads are a
//! plain `GET`. Pool, command and timeout failures read as misses and fail
//! writes softly.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::clock::SharedClock;
use super::entry::CacheEntry;
use super::layer::{validate_ttl, CacheLayer};
use crate::error::{Error, Result};

const LAYER_NAME: &str = "redis";

/// Redis layer configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL
    pub url: String,
    /// Prefix prepended to every key
    pub key_prefix: String,
    /// Entry time-to-live
    pub ttl: Duration,
    /// Bound on pool checkout plus command round-trip
    pub op_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "tiercache:".to_string(),
            ttl: Duration::from_secs(250),
            op_timeout: Duration::from_millis(500),
        }
    }
}

/// Redis-backed cache layer
pub struct RedisLayer {
    pool: Pool,
    config: RedisConfig,
    clock: SharedClock,
}

impl RedisLayer {
    /// Create a new layer. The pool connects lazily.
    pub fn new(config: RedisConfig, clock: SharedClock) -> Result<Self> {
        validate_ttl(LAYER_NAME, config.ttl)?;
        let pool = deadpool_redis::Config::from_url(config.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("invalid Redis configuration: {e}")))?;

        Ok(Self::with_pool(pool, config, clock))
    }

    /// Create from an existing pool
    pub fn with_pool(pool: Pool, config: RedisConfig, clock: SharedClock) -> Self {
        Self {
            pool,
            config,
            clock,
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let op = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| Error::layer(LAYER_NAME, format!("pool: {e}")))?;
            conn.get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(|e| Error::layer(LAYER_NAME, format!("GET: {e}")))
        };

        tokio::time::timeout(self.config.op_timeout, op)
            .await
            .map_err(|_| Error::layer(LAYER_NAME, "GET timed out"))?
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let ttl_secs = self.config.ttl.as_secs();
        let op = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| Error::layer(LAYER_NAME, format!("pool: {e}")))?;
            conn.set_ex::<_, _, ()>(key, value, ttl_secs)
                .await
                .map_err(|e| Error::layer(LAYER_NAME, format!("SET: {e}")))
        };

        tokio::time::timeout(self.config.op_timeout, op)
            .await
            .map_err(|_| Error::layer(LAYER_NAME, "SET timed out"))?
    }

    /// Check if Redis answers (for readiness checks)
    pub async fn is_available(&self) -> bool {
        let ping = async {
            match self.pool.get().await {
                Ok(mut conn) => {
                    let pong: redis::RedisResult<String> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    pong.is_ok()
                }
                Err(_) => false,
            }
        };
        tokio::time::timeout(self.config.op_timeout, ping)
            .await
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for RedisLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheLayer for RedisLayer {
    fn name(&self) -> &str {
        LAYER_NAME
    }

    fn ttl(&self) -> Duration {
        self.config.ttl
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let redis_key = self.namespaced(key);
        let raw = match self.get_raw(&redis_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %redis_key, error = %e, "Redis GET failed");
                return None;
            }
        };

        match CacheEntry::decode(&raw) {
            Ok(entry) if entry.is_expired(self.config.ttl, self.clock.now()) => {
                debug!(key = %redis_key, "Redis value older than layer TTL");
                None
            }
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %redis_key, error = %e, "discarding undecodable Redis value");
                None
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let redis_key = self.namespaced(key);
        let raw = entry.encode().map_err(|e| Error::layer(LAYER_NAME, e))?;
        self.set_raw(&redis_key, raw.to_vec()).await
    }

    async fn is_ready(&self) -> bool {
        self.is_available().await
    }
}

// =============================================================================
// Tests
// =============================================================================
