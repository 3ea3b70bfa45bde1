//! Per-peer session state and its media resources.

use crate::actors::messages::RoomEvent;
use crate::engine::{Consumer, Producer, Transport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Display metadata supplied by the client on join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Direction of a WebRTC transport from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends media (producers).
    Send,
    /// Client receives media (consumers).
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// A transport together with the direction it was created for.
#[derive(Clone)]
pub struct PeerTransport {
    pub transport: Arc<dyn Transport>,
    pub direction: TransportDirection,
}

/// One participant in a room.
pub struct Peer {
    pub id: String,
    pub info: PeerInfo,
    /// Push channel to the peer's connection.
    events: mpsc::Sender<RoomEvent>,
    pub transports: HashMap<String, PeerTransport>,
    pub producers: HashMap<String, Arc<dyn Producer>>,
    pub consumers: HashMap<String, Arc<dyn Consumer>>,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub connected: bool,
}

impl Peer {
    #[must_use]
    pub fn new(id: String, info: PeerInfo, events: mpsc::Sender<RoomEvent>) -> Self {
        let now = Utc::now();
        Self {
            id,
            info,
            events,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            joined_at: now,
            last_seen: now,
            connected: true,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Push an event to the peer's connection without blocking the room.
    ///
    /// A closed sink marks the peer disconnected; a full sink drops the event.
    pub fn notify(&mut self, event: RoomEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    target: "sfu.actor.room",
                    peer_id = %self.id,
                    event = ?event,
                    "Peer event channel full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.connected = false;
            }
        }
    }

    /// Close every media resource: consumers, then producers, then transports.
    ///
    /// Returns the ids of the producers that were closed so the caller can
    /// clean up remote consumers and notify other peers.
    pub async fn close_media(&mut self) -> Vec<String> {
        for (_, consumer) in self.consumers.drain() {
            consumer.close().await;
        }

        let mut closed_producers = Vec::with_capacity(self.producers.len());
        for (producer_id, producer) in self.producers.drain() {
            producer.close().await;
            closed_producers.push(producer_id);
        }

        for (_, peer_transport) in self.transports.drain() {
            peer_transport.transport.close().await;
        }

        closed_producers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_info_omits_missing_fields() {
        let info = PeerInfo {
            name: Some("Ada".to_string()),
            avatar: None,
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            serde_json::json!({"name": "Ada"})
        );

        let parsed: PeerInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, PeerInfo::default());
    }

    #[test]
    fn test_notify_marks_peer_disconnected_when_sink_closed() {
        let (tx, rx) = mpsc::channel(1);
        let mut peer = Peer::new("peer-1".to_string(), PeerInfo::default(), tx);
        drop(rx);

        peer.notify(RoomEvent::PeerLeft {
            peer_id: "peer-2".to_string(),
        });
        assert!(!peer.connected);
    }

    #[test]
    fn test_notify_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut peer = Peer::new("peer-1".to_string(), PeerInfo::default(), tx);

        for n in 0..3 {
            peer.notify(RoomEvent::PeerLeft {
                peer_id: format!("peer-{n}"),
            });
        }

        assert!(peer.connected);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_direction_wire_names() {
        let direction: TransportDirection = serde_json::from_str("\"recv\"").unwrap();
        assert_eq!(direction, TransportDirection::Recv);
        assert_eq!(TransportDirection::Send.as_str(), "send");
    }
}
