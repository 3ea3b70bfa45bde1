//! Status API handlers.
//!
//! - `GET /api/rooms` - stats of every room
//! - `GET /api/rooms/:room_id` - stats of one room (404 when unknown)
//! - `DELETE /api/rooms/:room_id` - close a room (idempotent)
//! - `GET /api/workers` - media workers and their resource usage
//! - `GET /api/stats` - server, room, peer and worker aggregates
//!
//! Successful replies use the `{"success": true, "data": ...}` envelope;
//! failures are rendered by `SignalingError`'s `IntoResponse`.

use crate::actors::registry::REASON_CLOSED_BY_ADMIN;
use crate::errors::SignalingError;

use super::AppState;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Handler for GET /api/rooms
pub async fn list_rooms(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, SignalingError> {
    let rooms = state.registry.list_rooms().await?;
    Ok(envelope(rooms))
}

/// Handler for GET /api/rooms/:room_id
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, SignalingError> {
    let stats = state.registry.room_stats(room_id).await?;
    Ok(envelope(stats))
}

/// Handler for DELETE /api/rooms/:room_id
///
/// Peers in the room receive `room-closed` with reason `closed-by-admin`.
/// Closing an unknown room succeeds.
pub async fn close_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, SignalingError> {
    let existed = state
        .registry
        .close_room(room_id.clone(), REASON_CLOSED_BY_ADMIN.to_string())
        .await?;

    if existed {
        info!(target: "sfu.http", room_id = %room_id, "Room closed via status API");
    }
    Ok(Json(json!({ "success": true })))
}

/// Handler for GET /api/workers
pub async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, SignalingError> {
    let workers = state.pool.list_workers().await?;
    let usage = state.pool.resource_usage().await?;

    Ok(envelope(json!({
        "count": workers.len(),
        "workers": workers,
        "usage": usage,
    })))
}

/// Handler for GET /api/stats
pub async fn server_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, SignalingError> {
    let rooms = state.registry.list_rooms().await?;
    let workers = state.pool.list_workers().await?;
    let usage = state.pool.resource_usage().await?;

    let active = rooms.iter().filter(|room| room.is_active).count();
    let peers: usize = rooms.iter().map(|room| room.peer_count).sum();

    Ok(envelope(json!({
        "server": {
            "uptime": state.health.uptime().as_secs_f64(),
            "timestamp": Utc::now().to_rfc3339(),
        },
        "rooms": {
            "total": rooms.len(),
            "active": active,
            "details": rooms,
        },
        "peers": {
            "total": peers,
        },
        "workers": {
            "count": workers.len(),
            "details": workers,
            "usage": usage,
        },
    })))
}
