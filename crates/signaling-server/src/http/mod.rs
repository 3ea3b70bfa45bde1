//! HTTP surface of the signaling server.
//!
//! Defines the Axum router and application state.

pub mod status;

use crate::actors::{RoomRegistryHandle, WorkerPoolHandle};
use crate::observability::{health_router, HealthContext, HealthState};
use crate::signaling::{ws_handler, SignalingDispatcher};

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// State shared by the status API handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: RoomRegistryHandle,
    pub pool: WorkerPoolHandle,
    pub health: Arc<HealthState>,
}

/// Status API routes.
pub fn status_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/rooms", get(status::list_rooms))
        .route(
            "/api/rooms/:room_id",
            get(status::get_room).delete(status::close_room),
        )
        .route("/api/workers", get(status::list_workers))
        .route("/api/stats", get(status::server_stats))
        .with_state(state)
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/ws` - Signaling WebSocket
/// - `/api/*` - Status API
/// - `/health` - Liveness probe (worker pool health)
/// - `/ready` - Readiness probe
/// - `/metrics` - Prometheus metrics endpoint
/// - TraceLayer for request logging
pub fn build_routes(
    state: Arc<AppState>,
    dispatcher: Arc<SignalingDispatcher>,
    health: HealthContext,
    metrics_handle: PrometheusHandle,
) -> Router {
    let signaling_routes = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(dispatcher);

    let metrics_routes = Router::new().route(
        "/metrics",
        get(move || {
            let handle = metrics_handle.clone();
            async move { handle.render() }
        }),
    );

    signaling_routes
        .merge(status_router(state))
        .merge(health_router(health))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}
