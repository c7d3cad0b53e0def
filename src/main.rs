//! Tiercache Server
//!
//! Multi-tier read-through cache in front of an HTTP origin.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Tiercache                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐      │
//! │  │  inapp   │──▶│ memcache │──▶│  redis   │──▶│  origin  │      │
//! │  │  (10s)   │   │  (50s)   │   │  (250s)  │   │  (HTTP)  │      │
//! │  └──────────┘   └──────────┘   └──────────┘   └──────────┘      │
//! │        ▲              ▲              │                           │
//! │        └──────────────┴── backfill ──┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{
    build_layers, parse_layer_list, CacheManager, CacheMetrics, CacheSettings, SharedClock,
    SystemClock, DEFAULT_LAYERS,
};
use tiercache::origin::{HttpOriginConfig, HttpOriginFetcher, DEFAULT_ORIGIN_URL};
use tiercache::server::{self, AppState};
use tiercache::Result;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiercache - multi-tier read-through cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma-separated layer list, fastest first
    #[arg(long, env = "CACHE_LAYERS", default_value = DEFAULT_LAYERS)]
    cache_layers: String,

    /// In-process layer TTL in seconds
    #[arg(long, env = "INAPP_TTL")]
    inapp_ttl: Option<u64>,

    /// memcached layer TTL in seconds
    #[arg(long, env = "MEMCACHE_TTL")]
    memcache_ttl: Option<u64>,

    /// Redis layer TTL in seconds
    #[arg(long, env = "REDIS_TTL")]
    redis_ttl: Option<u64>,

    /// In-process layer entry capacity
    #[arg(long, env = "INAPP_CAPACITY", default_value = "10000")]
    inapp_capacity: usize,

    /// memcached server address
    #[arg(long, env = "MEMCACHE_ADDR", default_value = "127.0.0.1:11211")]
    memcache_addr: String,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Prefix for Redis keys
    #[arg(long, env = "REDIS_PREFIX", default_value = "tiercache:")]
    redis_prefix: String,

    /// Per-operation timeout for networked layers in milliseconds
    #[arg(long, env = "LAYER_TIMEOUT_MS", default_value = "500")]
    layer_timeout_ms: u64,

    /// Fail startup on unknown layer names
    #[arg(long, env = "STRICT_LAYERS")]
    strict_layers: bool,

    /// Origin base URL; the key is appended
    #[arg(long = "api-url", env = "API_URL_TO_CACHE", default_value = DEFAULT_ORIGIN_URL)]
    api_url: String,

    /// Origin request timeout in seconds
    #[arg(long, env = "ORIGIN_TIMEOUT_SECS", default_value = "10")]
    origin_timeout_secs: u64,

    /// Whole-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// HTTP server bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    listen_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            layers: parse_layer_list(&self.cache_layers),
            inapp_ttl: self.inapp_ttl.map(Duration::from_secs),
            memcache_ttl: self.memcache_ttl.map(Duration::from_secs),
            redis_ttl: self.redis_ttl.map(Duration::from_secs),
            inapp_capacity: self.inapp_capacity,
            memcache_addr: self.memcache_addr.clone(),
            redis_url: self.redis_url.clone(),
            redis_prefix: self.redis_prefix.clone(),
            layer_timeout: Duration::from_millis(self.layer_timeout_ms),
            strict_layers: self.strict_layers,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting tiercache {}", tiercache::VERSION);
    info!("  Layers: {}", args.cache_layers);
    info!("  Origin URL: {}", args.api_url);
    info!("  Request timeout: {} seconds", args.request_timeout_secs);

    let clock: SharedClock = Arc::new(SystemClock);
    let metrics = CacheMetrics::new()?;

    let layers = build_layers(&args.cache_settings(), clock.clone()).map_err(|e| {
        error!("Invalid cache configuration: {}", e);
        e
    })?;

    let origin = HttpOriginFetcher::new(HttpOriginConfig {
        base_url: args.api_url.clone(),
        timeout: Duration::from_secs(args.origin_timeout_secs),
    })?;

    let manager = CacheManager::builder()
        .layers(layers)
        .origin(Arc::new(origin))
        .clock(clock)
        .observer(Arc::new(metrics.clone()))
        .build()?;

    info!("Cache chain: {}", manager.layer_names().join(" -> "));

    let state = Arc::new(
        AppState::new(
            Arc::new(manager),
            Duration::from_secs(args.request_timeout_secs),
        )
        .with_metrics(metrics),
    );

    tokio::select! {
        result = server::run_server(&args.listen_addr, state) => {
            if let Err(e) = &result {
                error!("Server error: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
