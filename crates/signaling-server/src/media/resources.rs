//! `MediaResourceManager` - transports, producers and consumers of the peers in one room.
//!
//! Runs inside the owning `RoomActor`, so every call is serialized per room. The
//! manager borrows the room's peer map for the duration of a call; events are pushed
//! only after the map reflects the change.
//!
//! Ids are scoped to their owning peer. A consumer id looked up under another peer
//! is not found, even if it exists in the room.

use crate::actors::messages::{ConsumerInfo, MediaAction, RoomEvent, StatsTarget, TransportInfo};
use crate::engine::{MediaKind, Router, RtpCapabilities, RtpParameters, TransportOptions};
use crate::errors::SignalingError;

use super::peer::{Peer, PeerTransport, TransportDirection};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Peers of one room, keyed by peer id.
pub type PeerMap = HashMap<String, Peer>;

pub struct MediaResourceManager {
    router: Arc<dyn Router>,
    transport_options: TransportOptions,
}

impl MediaResourceManager {
    #[must_use]
    pub fn new(router: Arc<dyn Router>, transport_options: TransportOptions) -> Self {
        Self {
            router,
            transport_options,
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Create a WebRTC transport for the peer and return its connection parameters.
    pub async fn create_transport(
        &self,
        peers: &mut PeerMap,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportInfo, SignalingError> {
        require_peer(peers, peer_id)?;

        let transport = self
            .router
            .create_webrtc_transport(&self.transport_options)
            .await?;

        let Some(peer) = peers.get_mut(peer_id) else {
            transport.close().await;
            return Err(SignalingError::PeerNotFound(peer_id.to_string()));
        };

        let info = TransportInfo {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        };
        peer.transports.insert(
            info.id.clone(),
            PeerTransport {
                transport,
                direction,
            },
        );

        debug!(
            target: "sfu.actor.room",
            peer_id = %peer_id,
            transport_id = %info.id,
            direction = direction.as_str(),
            "Transport created"
        );
        Ok(info)
    }

    /// Apply the client's DTLS parameters to one of the peer's transports.
    pub async fn connect_transport(
        &self,
        peers: &mut PeerMap,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), SignalingError> {
        let transport = lookup_transport(peers, peer_id, transport_id, None)?;
        transport.transport.connect(dtls_parameters).await?;
        Ok(())
    }

    /// Publish a producer on a send transport and announce it to the other peers.
    pub async fn produce(
        &self,
        peers: &mut PeerMap,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SignalingError> {
        let transport = lookup_transport(
            peers,
            peer_id,
            transport_id,
            Some(TransportDirection::Send),
        )?;

        let producer = transport.transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().to_string();

        let Some(peer) = peers.get_mut(peer_id) else {
            producer.close().await;
            return Err(SignalingError::PeerNotFound(peer_id.to_string()));
        };
        peer.producers.insert(producer_id.clone(), producer);

        // Registered first, so a consume triggered by this event finds the producer
        notify_others(
            peers,
            peer_id,
            &RoomEvent::NewProducer {
                producer_peer_id: peer_id.to_string(),
                producer_id: producer_id.clone(),
                kind,
            },
        );

        debug!(
            target: "sfu.actor.room",
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Create a paused consumer of `producer_id` on one of the peer's recv transports.
    pub async fn consume(
        &self,
        peers: &mut PeerMap,
        peer_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo, SignalingError> {
        let transport = lookup_transport(
            peers,
            peer_id,
            transport_id,
            Some(TransportDirection::Recv),
        )?;

        let producer_open = peers.values().any(|p| {
            p.producers
                .get(producer_id)
                .is_some_and(|producer| !producer.closed())
        });
        if !producer_open {
            return Err(SignalingError::ProducerNotFound(producer_id.to_string()));
        }

        if !self.router.can_consume(producer_id, rtp_capabilities) {
            return Err(SignalingError::Incompatible(producer_id.to_string()));
        }

        let consumer = transport
            .transport
            .consume(producer_id, rtp_capabilities, true)
            .await?;

        let Some(peer) = peers.get_mut(peer_id) else {
            consumer.close().await;
            return Err(SignalingError::PeerNotFound(peer_id.to_string()));
        };

        let info = ConsumerInfo {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        peer.consumers.insert(info.id.clone(), consumer);

        debug!(
            target: "sfu.actor.room",
            peer_id = %peer_id,
            consumer_id = %info.id,
            producer_id = %producer_id,
            "Consumer created (paused)"
        );
        Ok(info)
    }

    /// Pause, resume or close a producer or consumer owned by the peer.
    pub async fn apply(
        &self,
        peers: &mut PeerMap,
        peer_id: &str,
        action: MediaAction,
    ) -> Result<(), SignalingError> {
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalingError::PeerNotFound(peer_id.to_string()))?;

        match action {
            MediaAction::PauseProducer(id) => {
                let producer = peer
                    .producers
                    .get(&id)
                    .ok_or(SignalingError::ProducerNotFound(id))?;
                producer.pause().await?;
            }
            MediaAction::ResumeProducer(id) => {
                let producer = peer
                    .producers
                    .get(&id)
                    .ok_or(SignalingError::ProducerNotFound(id))?;
                producer.resume().await?;
            }
            MediaAction::CloseProducer(id) => {
                let producer = peer
                    .producers
                    .remove(&id)
                    .ok_or_else(|| SignalingError::ProducerNotFound(id.clone()))?;
                producer.close().await;
                close_remote_consumers(peers, peer_id, &id).await;
            }
            MediaAction::PauseConsumer(id) => {
                let consumer = peer
                    .consumers
                    .get(&id)
                    .ok_or(SignalingError::ConsumerNotFound(id))?;
                consumer.pause().await?;
            }
            MediaAction::ResumeConsumer(id) => {
                let consumer = peer
                    .consumers
                    .get(&id)
                    .ok_or(SignalingError::ConsumerNotFound(id))?;
                consumer.resume().await?;
            }
            MediaAction::CloseConsumer(id) => {
                let consumer = peer
                    .consumers
                    .remove(&id)
                    .ok_or(SignalingError::ConsumerNotFound(id))?;
                consumer.close().await;
            }
        }
        Ok(())
    }

    /// Engine stats for a resource owned by the peer.
    pub async fn stats(
        &self,
        peers: &PeerMap,
        peer_id: &str,
        target: StatsTarget,
    ) -> Result<Vec<Value>, SignalingError> {
        let peer = require_peer(peers, peer_id)?;

        let stats = match target {
            StatsTarget::Transport(id) => {
                let transport = peer
                    .transports
                    .get(&id)
                    .ok_or(SignalingError::TransportNotFound(id))?;
                transport.transport.stats().await?
            }
            StatsTarget::Producer(id) => {
                let producer = peer
                    .producers
                    .get(&id)
                    .ok_or(SignalingError::ProducerNotFound(id))?;
                producer.stats().await?
            }
            StatsTarget::Consumer(id) => {
                let consumer = peer
                    .consumers
                    .get(&id)
                    .ok_or(SignalingError::ConsumerNotFound(id))?;
                consumer.stats().await?
            }
        };
        Ok(stats)
    }

    /// Remove a peer and close all of its media.
    ///
    /// Remote consumers of the peer's producers are closed and their owners
    /// receive `producer-closed`. Returns `None` if the peer is unknown.
    pub async fn close_peer(&self, peers: &mut PeerMap, peer_id: &str) -> Option<Peer> {
        let mut peer = peers.remove(peer_id)?;
        let closed_producers = peer.close_media().await;

        for producer_id in &closed_producers {
            close_remote_consumers(peers, peer_id, producer_id).await;
        }

        debug!(
            target: "sfu.actor.room",
            peer_id = %peer_id,
            producers_closed = closed_producers.len(),
            "Peer media closed"
        );
        Some(peer)
    }

    /// Drop transports, producers and consumers the engine closed on its own.
    ///
    /// Remote consumers of a dropped producer are closed and their owners
    /// receive `producer-closed`, as for an explicit close.
    pub async fn prune_closed(&self, peers: &mut PeerMap) {
        let mut closed_producers = Vec::new();
        let mut dropped = 0usize;

        for (peer_id, peer) in peers.iter_mut() {
            let before = peer.transports.len() + peer.producers.len() + peer.consumers.len();
            peer.transports.retain(|_, t| !t.transport.closed());
            peer.producers.retain(|producer_id, producer| {
                if producer.closed() {
                    closed_producers.push((peer_id.clone(), producer_id.clone()));
                    return false;
                }
                true
            });
            peer.consumers.retain(|_, consumer| !consumer.closed());
            dropped += before - (peer.transports.len() + peer.producers.len() + peer.consumers.len());
        }

        for (owner_id, producer_id) in &closed_producers {
            close_remote_consumers(peers, owner_id, producer_id).await;
        }

        if dropped > 0 {
            debug!(
                target: "sfu.actor.room",
                dropped,
                producers_closed = closed_producers.len(),
                "Pruned engine-closed media"
            );
        }
    }
}

/// Push an event to every peer except `origin`.
pub fn notify_others(peers: &mut PeerMap, origin: &str, event: &RoomEvent) {
    for (id, peer) in peers.iter_mut() {
        if id != origin {
            peer.notify(event.clone());
        }
    }
}

fn require_peer<'a>(peers: &'a PeerMap, peer_id: &str) -> Result<&'a Peer, SignalingError> {
    peers
        .get(peer_id)
        .ok_or_else(|| SignalingError::PeerNotFound(peer_id.to_string()))
}

fn lookup_transport(
    peers: &PeerMap,
    peer_id: &str,
    transport_id: &str,
    expected: Option<TransportDirection>,
) -> Result<PeerTransport, SignalingError> {
    let peer = require_peer(peers, peer_id)?;
    let transport = peer
        .transports
        .get(transport_id)
        .ok_or_else(|| SignalingError::TransportNotFound(transport_id.to_string()))?;

    if let Some(direction) = expected {
        if transport.direction != direction {
            return Err(SignalingError::WrongTransportDirection {
                transport_id: transport_id.to_string(),
                expected: direction.as_str(),
            });
        }
    }
    Ok(transport.clone())
}

/// Close every consumer of `producer_id` held by other peers and tell them.
async fn close_remote_consumers(peers: &mut PeerMap, owner_id: &str, producer_id: &str) {
    for (id, peer) in peers.iter_mut() {
        if id == owner_id {
            continue;
        }

        let orphaned: Vec<String> = peer
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.producer_id() == producer_id)
            .map(|(consumer_id, _)| consumer_id.clone())
            .collect();
        for consumer_id in orphaned {
            if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                consumer.close().await;
            }
        }

        peer.notify(RoomEvent::ProducerClosed {
            producer_peer_id: owner_id.to_string(),
            producer_id: producer_id.to_string(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::{
        ListenIp, LocalEngine, MediaEngine, RtpCodecParameters, WorkerLogLevel, WorkerSettings,
    };
    use crate::media::{supported_codecs, PeerInfo};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn transport_options() -> TransportOptions {
        TransportOptions {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some("127.0.0.1".to_string()),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            max_incoming_bitrate: None,
            max_outgoing_bitrate: None,
        }
    }

    async fn manager() -> MediaResourceManager {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings {
                log_level: WorkerLogLevel::None,
                rtc_min_port: 41000,
                rtc_max_port: 41100,
            })
            .await
            .unwrap();
        let router = worker.create_router(&supported_codecs()).await.unwrap();
        MediaResourceManager::new(router, transport_options())
    }

    fn add_peer(peers: &mut PeerMap, id: &str) -> mpsc::Receiver<RoomEvent> {
        let (tx, rx) = mpsc::channel(16);
        peers.insert(
            id.to_string(),
            Peer::new(id.to_string(), PeerInfo::default(), tx),
        );
        rx
    }

    fn vp8() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Map::new(),
                extra: serde_json::Map::new(),
            }],
            extra: serde_json::Map::new(),
        }
    }

    fn caps(mime_types: &[&str]) -> RtpCapabilities {
        serde_json::from_value(json!({
            "codecs": mime_types
                .iter()
                .map(|m| json!({
                    "kind": if m.starts_with("audio") { "audio" } else { "video" },
                    "mimeType": m,
                    "clockRate": if m.starts_with("audio") { 48000 } else { 90000 },
                }))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_produce_notifies_only_other_peers() {
        let manager = manager().await;
        let mut peers = PeerMap::new();
        let mut rx_a = add_peer(&mut peers, "a");
        let mut rx_b = add_peer(&mut peers, "b");

        let send = manager
            .create_transport(&mut peers, "a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .produce(&mut peers, "a", &send.id, MediaKind::Video, vp8())
            .await
            .unwrap();

        assert_eq!(
            rx_b.try_recv().unwrap(),
            RoomEvent::NewProducer {
                producer_peer_id: "a".to_string(),
                producer_id: producer_id.clone(),
                kind: MediaKind::Video,
            }
        );
        assert!(rx_a.try_recv().is_err());
        assert!(peers["a"].producers.contains_key(&producer_id));
    }

    #[tokio::test]
    async fn test_produce_requires_send_transport() {
        let manager = manager().await;
        let mut peers = PeerMap::new();
        let _rx = add_peer(&mut peers, "a");

        let recv = manager
            .create_transport(&mut peers, "a", TransportDirection::Recv)
            .await
            .unwrap();
        let result = manager
            .produce(&mut peers, "a", &recv.id, MediaKind::Video, vp8())
            .await;
        assert!(matches!(
            result,
            Err(SignalingError::WrongTransportDirection { .. })
        ));
    }

    #[tokio::test]
    async fn test_consume_is_paused_and_incompatible_creates_nothing() {
        let manager = manager().await;
        let mut peers = PeerMap::new();
        let _rx_a = add_peer(&mut peers, "a");
        let _rx_b = add_peer(&mut peers, "b");

        let send = manager
            .create_transport(&mut peers, "a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .produce(&mut peers, "a", &send.id, MediaKind::Video, vp8())
            .await
            .unwrap();
        let recv = manager
            .create_transport(&mut peers, "b", TransportDirection::Recv)
            .await
            .unwrap();

        let result = manager
            .consume(&mut peers, "b", &recv.id, &producer_id, &caps(&["audio/opus"]))
            .await;
        assert!(matches!(result, Err(SignalingError::Incompatible(_))));
        assert!(peers["b"].consumers.is_empty());

        let info = manager
            .consume(&mut peers, "b", &recv.id, &producer_id, &caps(&["video/vp8"]))
            .await
            .unwrap();
        assert!(peers["b"].consumers[&info.id].paused());

        manager
            .apply(&mut peers, "b", MediaAction::ResumeConsumer(info.id.clone()))
            .await
            .unwrap();
        assert!(!peers["b"].consumers[&info.id].paused());
    }

    #[tokio::test]
    async fn test_consumer_ids_are_scoped_to_owner() {
        let manager = manager().await;
        let mut peers = PeerMap::new();
        let _rx_a = add_peer(&mut peers, "a");
        let _rx_b = add_peer(&mut peers, "b");

        let send = manager
            .create_transport(&mut peers, "a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .produce(&mut peers, "a", &send.id, MediaKind::Video, vp8())
            .await
            .unwrap();
        let recv = manager
            .create_transport(&mut peers, "b", TransportDirection::Recv)
            .await
            .unwrap();
        let info = manager
            .consume(&mut peers, "b", &recv.id, &producer_id, &caps(&["video/VP8"]))
            .await
            .unwrap();

        let result = manager
            .apply(&mut peers, "a", MediaAction::ResumeConsumer(info.id))
            .await;
        assert!(matches!(result, Err(SignalingError::ConsumerNotFound(_))));
    }

    #[tokio::test]
    async fn test_close_peer_cascades_to_remote_consumers() {
        let manager = manager().await;
        let mut peers = PeerMap::new();
        let _rx_a = add_peer(&mut peers, "a");
        let mut rx_b = add_peer(&mut peers, "b");

        let send = manager
            .create_transport(&mut peers, "a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .produce(&mut peers, "a", &send.id, MediaKind::Video, vp8())
            .await
            .unwrap();
        let recv = manager
            .create_transport(&mut peers, "b", TransportDirection::Recv)
            .await
            .unwrap();
        let info = manager
            .consume(&mut peers, "b", &recv.id, &producer_id, &caps(&["video/VP8"]))
            .await
            .unwrap();
        let consumer = std::sync::Arc::clone(&peers["b"].consumers[&info.id]);
        let _ = rx_b.try_recv(); // new-producer

        let removed = manager.close_peer(&mut peers, "a").await.unwrap();
        assert!(removed.producers.is_empty());
        assert!(removed.transports.is_empty());
        assert!(consumer.closed());
        assert!(peers["b"].consumers.is_empty());
        assert_eq!(
            rx_b.try_recv().unwrap(),
            RoomEvent::ProducerClosed {
                producer_peer_id: "a".to_string(),
                producer_id,
            }
        );

        assert!(manager.close_peer(&mut peers, "a").await.is_none());
    }

    #[tokio::test]
    async fn test_engine_closed_media_is_pruned_and_announced() {
        let manager = manager().await;
        let mut peers = PeerMap::new();
        let _rx_a = add_peer(&mut peers, "a");
        let mut rx_b = add_peer(&mut peers, "b");

        let send = manager
            .create_transport(&mut peers, "a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .produce(&mut peers, "a", &send.id, MediaKind::Video, vp8())
            .await
            .unwrap();
        let recv = manager
            .create_transport(&mut peers, "b", TransportDirection::Recv)
            .await
            .unwrap();
        manager
            .consume(&mut peers, "b", &recv.id, &producer_id, &caps(&["video/VP8"]))
            .await
            .unwrap();
        let _ = rx_b.try_recv(); // new-producer

        // Engine-side teardown: the manager is not told.
        let transport = std::sync::Arc::clone(&peers["a"].transports[&send.id].transport);
        transport.close().await;

        manager.prune_closed(&mut peers).await;
        assert!(peers["a"].transports.is_empty());
        assert!(peers["a"].producers.is_empty());
        assert!(peers["b"].consumers.is_empty());
        assert_eq!(peers["b"].transports.len(), 1);
        assert_eq!(
            rx_b.try_recv().unwrap(),
            RoomEvent::ProducerClosed {
                producer_peer_id: "a".to_string(),
                producer_id,
            }
        );

        // Nothing left to prune.
        manager.prune_closed(&mut peers).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_unknown_id_is_not_found() {
        let manager = manager().await;
        let mut peers = PeerMap::new();
        let _rx = add_peer(&mut peers, "a");

        let result = manager
            .stats(&peers, "a", StatsTarget::Producer("missing".to_string()))
            .await;
        assert!(matches!(result, Err(SignalingError::ProducerNotFound(_))));

        let transport = manager
            .create_transport(&mut peers, "a", TransportDirection::Send)
            .await
            .unwrap();
        let stats = manager
            .stats(&peers, "a", StatsTarget::Transport(transport.id))
            .await
            .unwrap();
        assert!(!stats.is_empty());
    }
}
