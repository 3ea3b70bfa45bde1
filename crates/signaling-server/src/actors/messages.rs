//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::engine::{MediaKind, Router, RtpCapabilities, RtpParameters, Worker};
use crate::errors::SignalingError;
use crate::media::{PeerInfo, TransportDirection};

use super::room::RoomActorHandle;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Messages sent to `WorkerPoolActor`.
pub enum PoolMessage {
    /// Pick the next healthy worker (round-robin).
    Acquire {
        respond_to: oneshot::Sender<Result<AcquiredWorker, SignalingError>>,
    },

    /// Whether at least one worker is alive.
    HealthCheck { respond_to: oneshot::Sender<bool> },

    ListWorkers {
        respond_to: oneshot::Sender<Vec<WorkerInfo>>,
    },

    /// Engine-reported usage for every live worker.
    ResourceUsage {
        respond_to: oneshot::Sender<Vec<WorkerUsage>>,
    },

    /// Close every worker (shutdown).
    CloseAll { respond_to: oneshot::Sender<()> },

    /// Raised by a worker's death watcher.
    WorkerDied { worker_id: String, generation: u64 },
}

/// Messages sent to `RoomRegistryActor`.
pub enum RegistryMessage {
    /// Return the existing room or create one on a pooled worker.
    GetOrCreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SignalingError>>,
    },

    /// Add a peer to an existing room.
    AddPeer {
        room_id: String,
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
        respond_to: oneshot::Sender<Result<JoinResult, SignalingError>>,
    },

    /// Get-or-create plus add-peer in one step, so a pending closure
    /// cannot fire between the two.
    JoinRoom {
        room_id: String,
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
        respond_to: oneshot::Sender<Result<(RoomActorHandle, JoinResult), SignalingError>>,
    },

    /// Remove a peer; schedules closure when the room becomes empty.
    RemovePeer {
        room_id: String,
        peer_id: String,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Close a room (idempotent). Responds with whether the room existed.
    CloseRoom {
        room_id: String,
        reason: String,
        respond_to: oneshot::Sender<bool>,
    },

    GetRoomStats {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomStats, SignalingError>>,
    },

    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomStats>>,
    },

    /// Close every room (shutdown).
    CloseAll { respond_to: oneshot::Sender<()> },

    /// Grace timer fired for an empty room.
    GraceExpired { room_id: String, generation: u64 },

    /// Router creation for a new room finished.
    RoomCreated {
        room_id: String,
        result: Result<CreatedRouter, SignalingError>,
    },

    /// A join handed to a room actor completed. `membership` is `None` when
    /// the join was rejected.
    JoinSettled {
        room_id: String,
        instance: u64,
        membership: Option<Membership>,
    },

    /// A peer removal handed to a room actor completed.
    PeerRemoved {
        room_id: String,
        instance: u64,
        membership: Membership,
    },

    /// A room's router was found closed underneath it.
    RouterLost { room_id: String, instance: u64 },
}

/// Messages sent to `RoomActor`.
pub enum RoomMessage {
    AddPeer {
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
        respond_to: oneshot::Sender<Result<(JoinResult, Membership), SignalingError>>,
    },

    /// Remove a peer. Responds with the membership left behind.
    RemovePeer {
        peer_id: String,
        respond_to: oneshot::Sender<Membership>,
    },

    GetCapabilities {
        peer_id: String,
        respond_to: oneshot::Sender<Result<RtpCapabilities, SignalingError>>,
    },

    CreateTransport {
        peer_id: String,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportInfo, SignalingError>>,
    },

    ConnectTransport {
        peer_id: String,
        transport_id: String,
        dtls_parameters: Value,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    Produce {
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<String, SignalingError>>,
    },

    Consume {
        peer_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerInfo, SignalingError>>,
    },

    /// Pause, resume or close a producer or consumer owned by the peer.
    Media {
        peer_id: String,
        action: MediaAction,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Engine stats for a transport, producer or consumer owned by the peer.
    GetStats {
        peer_id: String,
        target: StatsTarget,
        respond_to: oneshot::Sender<Result<Vec<Value>, SignalingError>>,
    },

    GetRoomStats {
        respond_to: oneshot::Sender<RoomStats>,
    },

    /// Close the room: remove every peer, then close the router.
    Close {
        reason: String,
        respond_to: oneshot::Sender<()>,
    },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Worker handed out by the pool.
#[derive(Clone)]
pub struct AcquiredWorker {
    /// Logical id (`worker_{index}`).
    pub id: String,
    /// Distinguishes a replacement from the worker it replaced.
    pub generation: u64,
    pub worker: Arc<dyn Worker>,
}

/// Peer count of a room, stamped with the room's membership version.
///
/// Snapshots from one room are totally ordered by `version`, so the registry
/// can drop one that arrives after a newer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub peers: usize,
    pub version: u64,
}

/// Router created on a pooled worker for a new room.
pub struct CreatedRouter {
    pub worker: AcquiredWorker,
    pub router: Arc<dyn Router>,
}

/// Broadcast by the pool when a worker is removed after dying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    WorkerLost { worker_id: String, generation: u64 },
}

/// Per-resource operation dispatched to the room actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaAction {
    PauseProducer(String),
    ResumeProducer(String),
    CloseProducer(String),
    PauseConsumer(String),
    ResumeConsumer(String),
    CloseConsumer(String),
}

/// Resource whose engine stats are requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsTarget {
    Transport(String),
    Producer(String),
    Consumer(String),
}

/// Domain event fanned out to peers in a room.
///
/// Serializes directly as a signaling push: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RoomEvent {
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String, peer_info: PeerInfo },

    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },

    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },

    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_peer_id: String,
        producer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    RoomClosed { room_id: String, reason: String },
}

/// Producer already published in a room when a peer joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingProducer {
    pub peer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
}

/// Reply to a successful join.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResult {
    pub room_id: String,
    pub peer_id: String,
    pub router_rtp_capabilities: RtpCapabilities,
    pub existing_producers: Vec<ExistingProducer>,
}

/// Connection parameters for a new transport, passed through from the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Reply to a successful consume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Room statistics (status API and `get-room-stats`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: String,
    pub peer_count: usize,
    pub connected_peer_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub router_id: String,
    pub worker_id: String,
    pub is_active: bool,
    pub total_producers: usize,
    pub total_consumers: usize,
    pub total_transports: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    pub pid: u32,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUsage {
    pub id: String,
    pub pid: u32,
    pub usage: Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_event_serializes_as_push() {
        let event = RoomEvent::NewProducer {
            producer_peer_id: "peer-a".to_string(),
            producer_id: "prod-1".to_string(),
            kind: MediaKind::Video,
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "new-producer",
                "data": {"producerPeerId": "peer-a", "producerId": "prod-1", "kind": "video"}
            })
        );
    }

    #[test]
    fn test_room_closed_event_carries_reason() {
        let event = RoomEvent::RoomClosed {
            room_id: "standup".to_string(),
            reason: "worker-died".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "room-closed");
        assert_eq!(value["data"]["reason"], "worker-died");
    }

    #[test]
    fn test_peer_joined_event_includes_info() {
        let event = RoomEvent::PeerJoined {
            peer_id: "peer-b".to_string(),
            peer_info: PeerInfo {
                name: Some("Bea".to_string()),
                avatar: None,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["peerInfo"]["name"], "Bea");
    }
}
