//! Cache Metrics Collection
//!
//! The manager reports every lookup, write and origin fetch to a
//! [`CacheObserver`]. [`CacheMetrics`] is the Prometheus-backed observer the
//! service exposes on `/metrics`.

use std::fmt;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Outcome of a single layer lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Hit,
    Miss,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Hit => "hit",
            LookupOutcome::Miss => "miss",
        }
    }
}

/// Why a layer was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Origin result written to every layer
    Fill,
    /// Value found lower in the chain copied into a faster layer
    Backfill,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Fill => "fill",
            WriteKind::Backfill => "backfill",
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability hook. All methods default to no-ops.
pub trait CacheObserver: Send + Sync {
    /// A layer was queried
    fn on_lookup(&self, _layer: &str, _outcome: LookupOutcome) {}

    /// A layer was written
    fn on_write(&self, _layer: &str, _kind: WriteKind, _ok: bool) {}

    /// The origin was called
    fn on_origin(&self, _ok: bool) {}

    /// A `get` finished; `source` is a layer name or `origin`
    fn on_complete(&self, _source: &str, _elapsed: Duration) {}
}

/// Observer that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {}

fn result_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

/// Prometheus-backed cache metrics
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    lookups: IntCounterVec,
    writes: IntCounterVec,
    origin_fetches: IntCounterVec,
    get_duration: HistogramVec,
}

impl CacheMetrics {
    /// Create a collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector registering into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let lookups = IntCounterVec::new(
            Opts::new(
                "tiercache_layer_lookups_total",
                "Layer lookups by layer and outcome",
            ),
            &["layer", "outcome"],
        )
        .map_err(metrics_error)?;
        let writes = IntCounterVec::new(
            Opts::new(
                "tiercache_layer_writes_total",
                "Layer writes by layer, kind and result",
            ),
            &["layer", "kind", "result"],
        )
        .map_err(metrics_error)?;
        let origin_fetches = IntCounterVec::new(
            Opts::new("tiercache_origin_fetches_total", "Origin fetches by result"),
            &["result"],
        )
        .map_err(metrics_error)?;
        let get_duration = HistogramVec::new(
            HistogramOpts::new(
                "tiercache_get_duration_seconds",
                "Latency of cache gets by answering source",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
            ]),
            &["source"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(lookups.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(writes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(origin_fetches.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(get_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            lookups,
            writes,
            origin_fetches,
            get_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn hits(&self, layer: &str) -> u64 {
        self.lookups
            .with_label_values(&[layer, LookupOutcome::Hit.as_str()])
            .get()
    }

    pub fn misses(&self, layer: &str) -> u64 {
        self.lookups
            .with_label_values(&[layer, LookupOutcome::Miss.as_str()])
            .get()
    }

    /// Hit ratio for one layer
    pub fn hit_ratio(&self, layer: &str) -> f64 {
        let hits = self.hits(layer) as f64;
        let total = hits + self.misses(layer) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn writes(&self, layer: &str, kind: WriteKind, ok: bool) -> u64 {
        self.writes
            .with_label_values(&[layer, kind.as_str(), result_label(ok)])
            .get()
    }

    pub fn origin_fetches(&self, ok: bool) -> u64 {
        self.origin_fetches
            .with_label_values(&[result_label(ok)])
            .get()
    }

    /// Number of completed gets answered by `source`
    pub fn completed(&self, source: &str) -> u64 {
        self.get_duration
            .with_label_values(&[source])
            .get_sample_count()
    }

    /// Render in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl CacheObserver for CacheMetrics {
    fn on_lookup(&self, layer: &str, outcome: LookupOutcome) {
        self.lookups
            .with_label_values(&[layer, outcome.as_str()])
            .inc();
    }

    fn on_write(&self, layer: &str, kind: WriteKind, ok: bool) {
        self.writes
            .with_label_values(&[layer, kind.as_str(), result_label(ok)])
            .inc();
    }

    fn on_origin(&self, ok: bool) {
        self.origin_fetches
            .with_label_values(&[result_label(ok)])
            .inc();
    }

    fn on_complete(&self, source: &str, elapsed: Duration) {
        self.get_duration
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());
    }
}

impl fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMetrics").finish_non_exhaustive()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registry: {e}"))
}

// =============================================================================
// Tests
// =============================================================================
