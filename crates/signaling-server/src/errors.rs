//! Signaling server error types.
//!
//! Every error carries an [`ErrorKind`] that is sent to clients in signaling
//! replies and maps to an HTTP status on the status API. Engine and internal
//! details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Client-visible error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Room is full.
    Capacity,
    /// Room, peer, transport, producer or consumer unknown in the expected scope.
    NotFound,
    /// Consumer capabilities cannot receive the producer.
    Incompatibility,
    /// Request requires a room the connection has not joined.
    NotInRoom,
    /// Media engine rejected the call or its worker died.
    EngineFailure,
    /// No healthy media workers remain.
    PoolExhausted,
    /// Malformed or out-of-sequence request.
    InvalidRequest,
    /// Actor mailbox or other internal failure.
    Internal,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Capacity => "capacity",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Incompatibility => "incompatibility",
            ErrorKind::NotInRoom => "not-in-room",
            ErrorKind::EngineFailure => "engine-failure",
            ErrorKind::PoolExhausted => "pool-exhausted",
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Signaling server error type.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Room has reached its peer limit.
    #[error("Room {room_id} has reached maximum capacity of {max_peers} peers")]
    RoomCapacityExceeded { room_id: String, max_peers: usize },

    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Peer {0} not found")]
    PeerNotFound(String),

    #[error("Transport {0} not found")]
    TransportNotFound(String),

    #[error("Producer {0} not found")]
    ProducerNotFound(String),

    #[error("Consumer {0} not found")]
    ConsumerNotFound(String),

    /// Router reports the consumer cannot receive this producer.
    #[error("Cannot consume producer {0}")]
    Incompatible(String),

    #[error("Not in a room")]
    NotInRoom,

    #[error("Already in room {0}")]
    AlreadyInRoom(String),

    /// Transport exists but has the wrong direction for the operation.
    #[error("Transport {transport_id} is not a {expected} transport")]
    WrongTransportDirection {
        transport_id: String,
        expected: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Media engine call failed.
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    /// No healthy workers left in the pool.
    #[error("No media workers available")]
    PoolExhausted,

    /// Server is shutting down.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Returns the client-visible error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalingError::RoomCapacityExceeded { .. } => ErrorKind::Capacity,
            SignalingError::RoomNotFound(_)
            | SignalingError::PeerNotFound(_)
            | SignalingError::TransportNotFound(_)
            | SignalingError::ProducerNotFound(_)
            | SignalingError::ConsumerNotFound(_) => ErrorKind::NotFound,
            SignalingError::Incompatible(_) => ErrorKind::Incompatibility,
            SignalingError::NotInRoom => ErrorKind::NotInRoom,
            SignalingError::AlreadyInRoom(_)
            | SignalingError::WrongTransportDirection { .. }
            | SignalingError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SignalingError::Engine(EngineError::CannotConsume(_)) => ErrorKind::Incompatibility,
            SignalingError::Engine(EngineError::ProducerNotFound(_)) => ErrorKind::NotFound,
            SignalingError::Engine(_) => ErrorKind::EngineFailure,
            SignalingError::PoolExhausted => ErrorKind::PoolExhausted,
            SignalingError::ShuttingDown | SignalingError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SignalingError::RoomCapacityExceeded { .. } => "room_capacity_exceeded",
            SignalingError::RoomNotFound(_) => "room_not_found",
            SignalingError::PeerNotFound(_) => "peer_not_found",
            SignalingError::TransportNotFound(_) => "transport_not_found",
            SignalingError::ProducerNotFound(_) => "producer_not_found",
            SignalingError::ConsumerNotFound(_) => "consumer_not_found",
            SignalingError::Incompatible(_) => "incompatible",
            SignalingError::NotInRoom => "not_in_room",
            SignalingError::AlreadyInRoom(_) => "already_in_room",
            SignalingError::WrongTransportDirection { .. } => "wrong_transport_direction",
            SignalingError::InvalidRequest(_) => "invalid_request",
            SignalingError::Engine(_) => "engine",
            SignalingError::PoolExhausted => "pool_exhausted",
            SignalingError::ShuttingDown => "shutting_down",
            SignalingError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Engine(EngineError::CannotConsume(_))
            | SignalingError::Engine(EngineError::ProducerNotFound(_)) => self.to_string(),
            SignalingError::Engine(_) => "Media engine error".to_string(),
            SignalingError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// HTTP status used by the status API.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Capacity => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Incompatibility | ErrorKind::InvalidRequest | ErrorKind::NotInRoom => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::EngineFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Structured error body sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SignalingError> for ErrorBody {
    fn from(err: &SignalingError) -> Self {
        Self {
            kind: err.kind(),
            message: err.client_message(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HttpErrorResponse {
    success: bool,
    error: ErrorBody,
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            // Log actual error server-side, return generic message to client
            tracing::error!(target: "sfu.http", error = %self, "Status API request failed");
        }

        let body = HttpErrorResponse {
            success: false,
            error: ErrorBody::from(&self),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message_names_room_and_limit() {
        let err = SignalingError::RoomCapacityExceeded {
            room_id: "standup".to_string(),
            max_peers: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(
            err.client_message(),
            "Room standup has reached maximum capacity of 2 peers"
        );
    }

    #[test]
    fn test_not_found_variants_share_kind() {
        for err in [
            SignalingError::RoomNotFound("r".to_string()),
            SignalingError::PeerNotFound("p".to_string()),
            SignalingError::TransportNotFound("t".to_string()),
            SignalingError::ProducerNotFound("p".to_string()),
            SignalingError::ConsumerNotFound("c".to_string()),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
            assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn test_engine_errors_map_to_engine_failure() {
        let err = SignalingError::from(EngineError::WorkerClosed);
        assert_eq!(err.kind(), ErrorKind::EngineFailure);
        assert_eq!(err.client_message(), "Media engine error");

        let err = SignalingError::from(EngineError::CannotConsume("p1".to_string()));
        assert_eq!(err.kind(), ErrorKind::Incompatibility);
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = SignalingError::Internal("channel send failed: closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
        assert_eq!(err.error_type_label(), "internal");
    }

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(ErrorKind::NotInRoom.as_str(), "not-in-room");
        assert_eq!(
            serde_json::to_value(ErrorKind::PoolExhausted).ok(),
            Some(serde_json::json!("pool-exhausted"))
        );
    }
}
