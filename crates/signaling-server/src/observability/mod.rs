//! Observability module for the signaling server.
//!
//! # Privacy by Default
//!
//! Actor instrumentation uses `#[instrument(skip_all)]` with explicit ids only.
//! Peer metadata (names, avatars) is never logged or used as a metric label.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Current rooms |
//! | `sfu_peers_active` | Gauge | none | Current peers across rooms |
//! | `sfu_workers_alive` | Gauge | none | Media workers in the pool |
//! | `sfu_worker_deaths_total` | Counter | none | Unexpected worker exits |
//! | `sfu_signaling_requests_total` | Counter | `method`, `status` | Signaling requests handled |
//! | `sfu_signaling_latency_seconds` | Histogram | `method` | Signaling request latency |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator per actor type |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor tasks that panicked |
//! | `sfu_errors_total` | Counter | `error_type` | Errors returned to clients |

pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use health::{health_router, HealthContext, HealthState};
pub use metrics::init_metrics_recorder;
