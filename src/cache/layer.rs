//! Cache Layer Contract
//!
//! Every tier in the chain implements [`CacheLayer`]. Reads never fail: a
//! missing, expired, unreachable or undecodable value is simply absent.
//! Writes may fail softly; the manager logs the failure and carries on.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use super::entry::CacheEntry;
use crate::error::{Error, Result};

/// Uniform get/set contract over an opaque string key
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Short name used in logs and metric labels
    fn name(&self) -> &str;

    /// Maximum age of an entry this layer will return
    fn ttl(&self) -> Duration;

    /// Look up a fresh entry
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Store an entry, overwriting whatever is there
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;

    /// Whether the backing store currently answers. Local layers always do.
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Validate a layer TTL at construction time
pub(crate) fn validate_ttl(layer: &str, ttl: Duration) -> Result<Duration> {
    if ttl.as_secs() == 0 {
        return Err(Error::Config(format!(
            "{layer} TTL must be at least one second, got {ttl:?}"
        )));
    }
    Ok(ttl)
}

/// Kind of layer a configuration token names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// Bounded map inside this process
    InProcess,
    /// memcached
    SharedMemory,
    /// Redis
    Persistent,
}

impl LayerKind {
    /// Canonical configuration token
    pub fn token(&self) -> &'static str {
        match self {
            LayerKind::InProcess => "inapp",
            LayerKind::SharedMemory => "memcache",
            LayerKind::Persistent => "redis",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::InProcess => write!(f, "in-process"),
            LayerKind::SharedMemory => write!(f, "shared-memory (memcached)"),
            LayerKind::Persistent => write!(f, "persistent (redis)"),
        }
    }
}

impl FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inapp" | "in-process" | "memory" => Ok(LayerKind::InProcess),
            "memcache" | "memcached" | "shared-memory" => Ok(LayerKind::SharedMemory),
            "redis" | "persistent" => Ok(LayerKind::Persistent),
            other => Err(Error::Config(format!("unknown cache layer '{other}'"))),
        }
    }
}
