//! SFU Signaling Server
//!
//! WebSocket signaling and room orchestration over a pool of media workers.
//!
//! # Servers
//!
//! One HTTP listener (default: 0.0.0.0:3000) serves:
//! - `GET /ws` - signaling WebSocket
//! - `/api/*` - status API
//! - `/health`, `/ready` - probes
//! - `/metrics` - Prometheus exposition
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Initialize the worker pool (fatal on failure)
//! 5. Spawn the room registry
//! 6. Bind the HTTP listener (fatal on failure) and serve
//! 7. Wait for a shutdown signal or pool exhaustion

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use signaling_server::actors::{ActorMetrics, RegistrySettings, RoomRegistryHandle, WorkerPoolHandle};
use signaling_server::config::Config;
use signaling_server::engine::LocalEngine;
use signaling_server::http::{build_routes, AppState};
use signaling_server::observability::{init_metrics_recorder, HealthContext, HealthState};
use signaling_server::signaling::SignalingDispatcher;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the HTTP server to drain after shutdown starts.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signaling_server=debug,sfu=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU signaling server");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        worker_count = config.worker_count,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        announced_ip = %config.announced_ip,
        max_peers = config.max_peers,
        room_close_grace_seconds = config.room_close_grace.as_secs(),
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let actor_metrics = ActorMetrics::new();
    let root_token = CancellationToken::new();

    // Worker pool (MUST succeed - no media without workers)
    info!(worker_count = config.worker_count, "Initializing media worker pool...");
    let (pool, pool_task) = WorkerPoolHandle::initialize(
        Arc::new(LocalEngine::new()),
        config.worker_count,
        config.worker_settings(),
        root_token.child_token(),
        Arc::clone(&actor_metrics),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to initialize media worker pool");
        e
    })?;
    info!("Media worker pool initialized");

    let (registry, registry_task) = RoomRegistryHandle::spawn(
        pool.clone(),
        RegistrySettings {
            max_peers: config.max_peers,
            close_grace: config.room_close_grace,
            transport_options: config.transport_options(),
        },
        root_token.child_token(),
        Arc::clone(&actor_metrics),
    );
    info!("Room registry started");

    let dispatcher = Arc::new(SignalingDispatcher::new(registry.clone()));
    let app_state = Arc::new(AppState {
        registry: registry.clone(),
        pool: pool.clone(),
        health: Arc::clone(&health_state),
    });
    let health_context = HealthContext {
        state: Arc::clone(&health_state),
        pool: pool.clone(),
        metrics: Arc::clone(&actor_metrics),
    };
    let app = build_routes(app_state, dispatcher, health_context, prometheus_handle);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind HTTP server");
            format!("Failed to bind HTTP server to {}: {e}", config.bind_address)
        })?;
    info!(addr = %config.bind_address, "HTTP server bound successfully");

    let server_token = root_token.child_token();
    let bind_address = config.bind_address;
    let server_task = tokio::spawn(async move {
        info!(addr = %bind_address, "HTTP server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!("SFU signaling server running - press Ctrl+C to shutdown");

    // Wait for shutdown signal or for the pool to run out of workers
    let exhausted = pool.exhausted_token();
    let pool_exhausted = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = exhausted.cancelled() => {
            error!("All media workers are gone, shutting down");
            true
        }
    };

    // Mark as not ready immediately so no new traffic is routed here
    health_state.set_not_ready();

    // Rooms first (peers get room-closed), then the workers under them
    if let Err(e) = registry.close_all().await {
        warn!(error = %e, "Failed to close rooms");
    }
    if let Err(e) = pool.close_all().await {
        warn!(error = %e, "Failed to close media workers");
    }

    root_token.cancel();

    if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server_task)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = SERVER_DRAIN_TIMEOUT.as_secs(),
            "HTTP server did not drain in time"
        );
    }
    for (name, task) in [("registry", registry_task), ("pool", pool_task)] {
        if let Err(e) = task.await {
            warn!(actor = name, error = %e, "Actor task ended abnormally");
        }
    }

    if pool_exhausted {
        return Err("media worker pool exhausted".into());
    }

    info!("SFU signaling server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
