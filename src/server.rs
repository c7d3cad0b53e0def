//! HTTP Front End
//!
//! Serves cached values over HTTP/1.1:
//!
//! - `GET /<key>` - value for `key` with its stored content type
//! - `GET /healthz`, `/livez` - liveness, always `ok`
//! - `GET /readyz` - 200 when every layer's store answers, 503 naming the
//!   layers that do not
//! - `GET /metrics` - Prometheus text exposition
//!
//! The four service paths are matched on the raw request path, so they are
//! reserved. A key with one of those names is still reachable by
//! percent-encoding any character, e.g. `/%6Detrics` reads key `metrics`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheManager, CacheMetrics};
use crate::error::{Error, Result};
use crate::origin::DEFAULT_CONTENT_TYPE;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Shared handler state
pub struct AppState {
    manager: Arc<CacheManager>,
    metrics: Option<CacheMetrics>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(manager: Arc<CacheManager>, request_timeout: Duration) -> Self {
        Self {
            manager,
            metrics: None,
            request_timeout,
        }
    }

    /// Expose `metrics` on `/metrics`
    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }
}

/// Route a request to its response
pub async fn route(state: &AppState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => readiness_response(state).await,
        "/metrics" => metrics_response(state),
        _ => cache_response(state, path).await,
    }
}

async fn cache_response(state: &AppState, path: &str) -> Response<Full<Bytes>> {
    let raw = path.trim_start_matches('/');
    if raw.is_empty() {
        return text(StatusCode::NOT_FOUND, "not found");
    }

    let key = match urlencoding::decode(raw) {
        Ok(key) => key.into_owned(),
        Err(e) => {
            debug!(path, error = %e, "rejecting undecodable key");
            return text(StatusCode::BAD_REQUEST, "invalid key encoding");
        }
    };

    match tokio::time::timeout(state.request_timeout, state.manager.get(&key)).await {
        Ok(Ok(result)) => {
            debug!(key = %key, source = %result.source, latency_us = result.latency.as_micros() as u64, "served");
            respond(StatusCode::OK, &result.content_type, result.payload)
        }
        Ok(Err(e)) if e.is_origin() => {
            warn!(key = %key, error = %e, "origin unavailable");
            text(StatusCode::BAD_GATEWAY, "origin unavailable")
        }
        Ok(Err(e)) => {
            error!(key = %key, error = %e, "cache lookup failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
        Err(_) => {
            warn!(key = %key, timeout = ?state.request_timeout, "request timed out");
            text(StatusCode::GATEWAY_TIMEOUT, "timed out")
        }
    }
}

async fn readiness_response(state: &AppState) -> Response<Full<Bytes>> {
    let down: Vec<String> = state
        .manager
        .readiness()
        .await
        .into_iter()
        .filter(|(_, ready)| !ready)
        .map(|(name, _)| name)
        .collect();

    if down.is_empty() {
        return text(StatusCode::OK, "ok");
    }

    warn!(layers = ?down, "cache layers not ready");
    respond(
        StatusCode::SERVICE_UNAVAILABLE,
        TEXT_PLAIN,
        Bytes::from(format!("not ready: {}", down.join(","))),
    )
}

fn metrics_response(state: &AppState) -> Response<Full<Bytes>> {
    let Some(metrics) = &state.metrics else {
        return text(StatusCode::NOT_FOUND, "not found");
    };

    match metrics.encode_text() {
        Ok((content_type, body)) => respond(StatusCode::OK, &content_type, Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, TEXT_PLAIN, Bytes::from_static(body.as_bytes()))
}

fn respond(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    let value = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    response.headers_mut().insert(CONTENT_TYPE, value);
    response
}

/// Bind `addr` and serve until the listener fails
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address '{}': {}", addr, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind server: {}", e)))?;

    info!("Cache server listening on {}", addr);
    serve(listener, state).await
}

/// Serve connections accepted from `listener`
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let state = state.clone();
                async move {
                    let response = route(&state, req.method(), req.uri().path()).await;
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, "connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLayer, InProcessConfig, InProcessLayer, ManualClock};
    use crate::origin::{OriginFetcher, OriginResponse};
    use async_trait::async_trait;
    use http_body_util::BodyExt;

    struct FixedOrigin;

    #[async_trait]
    impl OriginFetcher for FixedOrigin {
        async fn fetch(&self, key: &str) -> Result<OriginResponse> {
            match key {
                "missing" => Err(Error::OriginStatus {
                    status: 404,
                    url: format!("http://origin/{key}"),
                }),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(OriginResponse::new(Bytes::from_static(b"late"), "text/plain"))
                }
                _ => Ok(OriginResponse::new(
                    Bytes::from(format!("{{\"id\":\"{key}\"}}")),
                    "application/json",
                )),
            }
        }
    }

    fn state() -> AppState {
        let clock = Arc::new(ManualClock::starting_now());
        let layer: Arc<dyn CacheLayer> =
            Arc::new(InProcessLayer::new(InProcessConfig::default(), clock.clone()).unwrap());
        let metrics = CacheMetrics::new().unwrap();
        let manager = CacheManager::builder()
            .layer(layer)
            .origin(Arc::new(FixedOrigin))
            .clock(clock)
            .observer(Arc::new(metrics.clone()))
            .build()
            .unwrap();
        AppState::new(Arc::new(manager), Duration::from_millis(200)).with_metrics(metrics)
    }

    async fn body(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn content_type(response: &Response<Full<Bytes>>) -> &str {
        response.headers()[CONTENT_TYPE].to_str().unwrap()
    }

    #[tokio::test]
    async fn test_get_key() {
        let state = state();
        let response = route(&state, &Method::GET, "/42").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(content_type(&response), "application/json");
        assert_eq!(body(response).await.as_ref(), b"{\"id\":\"42\"}");
    }

    #[tokio::test]
    async fn test_percent_encoded_key() {
        let state = state();
        let response = route(&state, &Method::GET, "/a%20b").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await.as_ref(), b"{\"id\":\"a b\"}");
    }

    #[tokio::test]
    async fn test_origin_failure_is_bad_gateway() {
        let state = state();
        let response = route(&state, &Method::GET, "/missing").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_timeout_is_gateway_timeout() {
        let state = state();
        let response = route(&state, &Method::GET, "/slow").await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_empty_key_and_method() {
        let state = state();
        assert_eq!(route(&state, &Method::GET, "/").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            route(&state, &Method::POST, "/42").await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    /// Layer whose backing store never answers
    struct DownLayer;

    #[async_trait]
    impl CacheLayer for DownLayer {
        fn name(&self) -> &str {
            "redis"
        }

        fn ttl(&self) -> Duration {
            Duration::from_secs(250)
        }

        async fn get(&self, _key: &str) -> Option<crate::cache::CacheEntry> {
            None
        }

        async fn set(&self, _key: &str, _entry: &crate::cache::CacheEntry) -> Result<()> {
            Err(Error::layer("redis", "down"))
        }

        async fn is_ready(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_readyz_reports_down_layer() {
        let clock = Arc::new(ManualClock::starting_now());
        let inapp: Arc<dyn CacheLayer> =
            Arc::new(InProcessLayer::new(InProcessConfig::default(), clock.clone()).unwrap());
        let manager = CacheManager::builder()
            .layer(inapp)
            .layer(Arc::new(DownLayer))
            .origin(Arc::new(FixedOrigin))
            .clock(clock)
            .build()
            .unwrap();
        let state = AppState::new(Arc::new(manager), Duration::from_secs(1));

        let response = route(&state, &Method::GET, "/readyz").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(response).await.as_ref(), b"not ready: redis");

        // Liveness does not depend on the stores
        let response = route(&state, &Method::GET, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_reserved_names_reachable_when_encoded() {
        let state = state();
        let response = route(&state, &Method::GET, "/%68ealthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await.as_ref(), b"{\"id\":\"healthz\"}");

        let response = route(&state, &Method::GET, "/%6Detrics").await;
        assert_eq!(content_type(&response), "application/json");
        assert_eq!(body(response).await.as_ref(), b"{\"id\":\"metrics\"}");
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let state = state();
        for path in ["/healthz", "/livez", "/readyz"] {
            let response = route(&state, &Method::GET, path).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body(response).await.as_ref(), b"ok");
        }
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = state();
        route(&state, &Method::GET, "/42").await;
        route(&state, &Method::GET, "/42").await;

        let response = route(&state, &Method::GET, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body(response).await.to_vec()).unwrap();
        assert!(text.contains("tiercache_origin_fetches_total{result=\"ok\"} 1"));
        assert!(text.contains("tiercache_layer_lookups_total{layer=\"inapp\",outcome=\"hit\"} 1"));
    }

    #[tokio::test]
    async fn test_metrics_absent_without_collector() {
        let state = AppState::new(
            Arc::new(CacheManager::new(Vec::new(), Arc::new(FixedOrigin))),
            Duration::from_secs(1),
        );
        let response = route(&state, &Method::GET, "/metrics").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_invalid_content_type_falls_back() {
        let response = respond(StatusCode::OK, "bad\nvalue", Bytes::new());
        assert_eq!(content_type(&response), DEFAULT_CONTENT_TYPE);
    }
}
