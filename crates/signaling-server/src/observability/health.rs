//! Health endpoints for the signaling server.
//!
//! - `GET /health` - Liveness probe, backed by the worker pool health check
//! - `GET /ready` - Readiness probe (can we accept signaling connections?)
//!
//! The `/metrics` endpoint is served separately via `metrics-exporter-prometheus`.
//!
//! # Health State
//!
//! The `HealthState` tracks:
//! - `live`: true after startup (process is running)
//! - `ready`: true once the listener is bound, false again during shutdown
//! - `started_at`: process start, for uptime reporting

use crate::actors::{ActorMetrics, WorkerPoolHandle};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health state for the signaling server.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    started_at: Instant,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Everything the liveness probe looks at.
#[derive(Clone)]
pub struct HealthContext {
    pub state: Arc<HealthState>,
    pub pool: WorkerPoolHandle,
    pub metrics: Arc<ActorMetrics>,
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(context: HealthContext) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(context)
}

/// Liveness probe handler.
///
/// Returns 200 iff the process is live and at least one media worker is alive,
/// 503 otherwise. The body is returned either way.
async fn liveness_handler(State(context): State<HealthContext>) -> (StatusCode, Json<Value>) {
    let healthy = context.state.is_live() && context.pool.health_check().await;

    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": Utc::now().to_rfc3339(),
        "uptimeSeconds": context.state.uptime().as_secs(),
        "rooms": context.metrics.room_count(),
        "peers": context.metrics.peer_count(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Readiness probe handler.
async fn readiness_handler(State(context): State<HealthContext>) -> StatusCode {
    if context.state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::{LocalEngine, WorkerLogLevel, WorkerSettings};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn context() -> HealthContext {
        let metrics = ActorMetrics::new();
        let (pool, _task) = WorkerPoolHandle::initialize(
            Arc::new(LocalEngine::new()),
            1,
            WorkerSettings {
                log_level: WorkerLogLevel::None,
                rtc_min_port: 45000,
                rtc_max_port: 45100,
            },
            CancellationToken::new(),
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        HealthContext {
            state: Arc::new(HealthState::new()),
            pool,
            metrics,
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_set_ready() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready(), "Should be ready after set_ready()");

        state.set_not_ready();
        assert!(
            !state.is_ready(),
            "Should not be ready after set_not_ready()"
        );
    }

    #[tokio::test]
    async fn test_health_reports_healthy_pool() {
        let context = context().await;
        context.metrics.room_created();
        context.metrics.peer_joined();

        let (status, body) = get(health_router(context), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["rooms"], 1);
        assert_eq!(body["peers"], 1);
        assert!(body["uptimeSeconds"].is_u64());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_health_unavailable_after_pool_closed() {
        let context = context().await;
        context.pool.close_all().await.unwrap();

        let (status, body) = get(health_router(context), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_readiness_follows_state() {
        let context = context().await;
        let state = Arc::clone(&context.state);
        let app = health_router(context);

        let (status, _) = get(app.clone(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "/ready should return 503 when not ready");

        state.set_ready();
        let (status, _) = get(app, "/ready").await;
        assert_eq!(status, StatusCode::OK, "/ready should return 200 when ready");
    }

    #[tokio::test]
    async fn test_health_router_unknown_path_returns_404() {
        let (status, _) = get(health_router(context().await), "/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND, "Unknown paths should return 404");
    }
}
