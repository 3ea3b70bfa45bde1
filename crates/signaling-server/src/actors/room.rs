//! `RoomActor` - per-room actor that owns the room's peers and router.
//!
//! Each `RoomActor`:
//! - Owns the peer map and the router obtained from a pooled worker
//! - Enforces the peer capacity limit
//! - Runs every media operation through the `MediaResourceManager`, one at a time
//! - Fans out domain events to the peers' connections after state is committed
//!
//! The actor never calls back into the registry. Joins and removals return a
//! versioned [`Membership`] snapshot that the registry's caller relays, so the
//! registry can decide deferred closure without waiting on the room.

use crate::engine::{MediaKind, Router, RtpCapabilities, RtpParameters, TransportOptions};
use crate::errors::SignalingError;
use crate::media::{notify_others, MediaResourceManager, Peer, PeerInfo, PeerMap, TransportDirection};

use super::messages::{
    ConsumerInfo, ExistingProducer, JoinResult, MediaAction, Membership, RoomEvent, RoomMessage,
    RoomStats, StatsTarget, TransportInfo,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Reason sent to peers when the room is torn down by a shutdown.
pub const REASON_SHUTDOWN: &str = "server-shutdown";

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Send a request and wait for the reply.
    ///
    /// A stopped actor means the room has been closed.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SignalingError::RoomNotFound(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SignalingError::RoomNotFound(self.room_id.clone()))
    }

    /// Add a peer (idempotent for an existing peer id).
    pub async fn add_peer(
        &self,
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<JoinResult, SignalingError> {
        self.add_peer_tracked(peer_id, info, events)
            .await
            .map(|(joined, _)| joined)
    }

    /// Add a peer and return the membership snapshot taken right after.
    pub async fn add_peer_tracked(
        &self,
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(JoinResult, Membership), SignalingError> {
        self.request(|respond_to| RoomMessage::AddPeer {
            peer_id,
            info,
            events,
            respond_to,
        })
        .await?
    }

    /// Remove a peer and close its media. Returns the number of peers left.
    pub async fn remove_peer(&self, peer_id: String) -> Result<usize, SignalingError> {
        self.remove_peer_tracked(peer_id)
            .await
            .map(|membership| membership.peers)
    }

    pub async fn remove_peer_tracked(&self, peer_id: String) -> Result<Membership, SignalingError> {
        self.request(|respond_to| RoomMessage::RemovePeer {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn get_capabilities(
        &self,
        peer_id: String,
    ) -> Result<RtpCapabilities, SignalingError> {
        self.request(|respond_to| RoomMessage::GetCapabilities {
            peer_id,
            respond_to,
        })
        .await?
    }

    pub async fn create_transport(
        &self,
        peer_id: String,
        direction: TransportDirection,
    ) -> Result<TransportInfo, SignalingError> {
        self.request(|respond_to| RoomMessage::CreateTransport {
            peer_id,
            direction,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        peer_id: String,
        transport_id: String,
        dtls_parameters: Value,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            peer_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    /// Publish a producer. Returns the producer id.
    pub async fn produce(
        &self,
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SignalingError> {
        self.request(|respond_to| RoomMessage::Produce {
            peer_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    /// Create a paused consumer.
    pub async fn consume(
        &self,
        peer_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, SignalingError> {
        self.request(|respond_to| RoomMessage::Consume {
            peer_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    /// Pause, resume or close a producer or consumer.
    pub async fn media(&self, peer_id: String, action: MediaAction) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::Media {
            peer_id,
            action,
            respond_to,
        })
        .await?
    }

    pub async fn stats(
        &self,
        peer_id: String,
        target: StatsTarget,
    ) -> Result<Vec<Value>, SignalingError> {
        self.request(|respond_to| RoomMessage::GetStats {
            peer_id,
            target,
            respond_to,
        })
        .await?
    }

    pub async fn room_stats(&self) -> Result<RoomStats, SignalingError> {
        self.request(|respond_to| RoomMessage::GetRoomStats { respond_to })
            .await
    }

    /// Close the room and wait until every peer is removed and the router closed.
    pub async fn close(&self, reason: String) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::Close { reason, respond_to })
            .await
    }

    /// Cancel the actor; it closes the room with reason `server-shutdown`.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    /// Logical id of the worker hosting the router.
    worker_id: String,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    media: MediaResourceManager,
    peers: PeerMap,
    /// Bumped on every peer insert or removal.
    membership_version: u64,
    max_peers: usize,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    is_active: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor around an already-created router.
    #[must_use]
    pub fn spawn(
        room_id: String,
        worker_id: String,
        router: Arc<dyn Router>,
        transport_options: TransportOptions,
        max_peers: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let now = Utc::now();

        let actor = Self {
            room_id: room_id.clone(),
            worker_id,
            receiver,
            cancel_token: cancel_token.clone(),
            media: MediaResourceManager::new(router, transport_options),
            peers: PeerMap::new(),
            membership_version: 0,
            max_peers,
            created_at: now,
            last_activity: now,
            is_active: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            worker_id = %self.worker_id,
            router_id = %self.media.router().id(),
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.close(REASON_SHUTDOWN).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RoomMessage::Close { reason, respond_to }) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.close(&reason).await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message).await;
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.close(REASON_SHUTDOWN).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        self.media.prune_closed(&mut self.peers).await;

        match message {
            RoomMessage::AddPeer {
                peer_id,
                info,
                events,
                respond_to,
            } => {
                let result = self
                    .add_peer(peer_id, info, events)
                    .map(|joined| (joined, self.membership()));
                let _ = respond_to.send(result);
            }

            RoomMessage::RemovePeer {
                peer_id,
                respond_to,
            } => {
                self.remove_peer(&peer_id).await;
                let _ = respond_to.send(self.membership());
            }

            RoomMessage::GetCapabilities {
                peer_id,
                respond_to,
            } => {
                let result = self
                    .touch(&peer_id)
                    .map(|()| self.media.router().rtp_capabilities());
                let _ = respond_to.send(result);
            }

            RoomMessage::CreateTransport {
                peer_id,
                direction,
                respond_to,
            } => {
                let result = match self.touch(&peer_id) {
                    Ok(()) => {
                        self.media
                            .create_transport(&mut self.peers, &peer_id, direction)
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = match self.touch(&peer_id) {
                    Ok(()) => {
                        self.media
                            .connect_transport(
                                &mut self.peers,
                                &peer_id,
                                &transport_id,
                                dtls_parameters,
                            )
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = match self.touch(&peer_id) {
                    Ok(()) => {
                        self.media
                            .produce(&mut self.peers, &peer_id, &transport_id, kind, rtp_parameters)
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::Consume {
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = match self.touch(&peer_id) {
                    Ok(()) => {
                        self.media
                            .consume(
                                &mut self.peers,
                                &peer_id,
                                &transport_id,
                                &producer_id,
                                &rtp_capabilities,
                            )
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::Media {
                peer_id,
                action,
                respond_to,
            } => {
                let result = match self.touch(&peer_id) {
                    Ok(()) => self.media.apply(&mut self.peers, &peer_id, action).await,
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::GetStats {
                peer_id,
                target,
                respond_to,
            } => {
                let result = match self.touch(&peer_id) {
                    Ok(()) => self.media.stats(&self.peers, &peer_id, target).await,
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::GetRoomStats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }

            // Handled in the run loop
            RoomMessage::Close { respond_to, .. } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn membership(&self) -> Membership {
        Membership {
            peers: self.peers.len(),
            version: self.membership_version,
        }
    }

    /// Record activity for a room-scoped request from `peer_id`.
    fn touch(&mut self, peer_id: &str) -> Result<(), SignalingError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalingError::PeerNotFound(peer_id.to_string()))?;
        peer.touch();
        self.last_activity = Utc::now();
        Ok(())
    }

    fn add_peer(
        &mut self,
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<JoinResult, SignalingError> {
        if self.peers.contains_key(&peer_id) {
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                "Peer already in room"
            );
            self.touch(&peer_id)?;
            return Ok(self.join_result(&peer_id));
        }

        if self.peers.len() >= self.max_peers {
            warn!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                max_peers = self.max_peers,
                "Room at capacity, rejecting join"
            );
            return Err(SignalingError::RoomCapacityExceeded {
                room_id: self.room_id.clone(),
                max_peers: self.max_peers,
            });
        }

        self.peers.insert(
            peer_id.clone(),
            Peer::new(peer_id.clone(), info.clone(), events),
        );
        self.membership_version += 1;
        self.last_activity = Utc::now();
        self.metrics.peer_joined();

        notify_others(
            &mut self.peers,
            &peer_id,
            &RoomEvent::PeerJoined {
                peer_id: peer_id.clone(),
                peer_info: info,
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            "Peer joined"
        );

        Ok(self.join_result(&peer_id))
    }

    fn join_result(&self, peer_id: &str) -> JoinResult {
        let existing_producers = self
            .peers
            .values()
            .filter(|peer| peer.id != peer_id)
            .flat_map(|peer| {
                peer.producers
                    .values()
                    .filter(|producer| !producer.closed())
                    .map(|producer| ExistingProducer {
                        peer_id: peer.id.clone(),
                        producer_id: producer.id().to_string(),
                        kind: producer.kind(),
                    })
            })
            .collect();

        JoinResult {
            room_id: self.room_id.clone(),
            peer_id: peer_id.to_string(),
            router_rtp_capabilities: self.media.router().rtp_capabilities(),
            existing_producers,
        }
    }

    /// Remove a peer (no-op if unknown) and tell the others.
    async fn remove_peer(&mut self, peer_id: &str) {
        let Some(_peer) = self.media.close_peer(&mut self.peers, peer_id).await else {
            return;
        };

        self.membership_version += 1;
        self.last_activity = Utc::now();
        self.metrics.peer_left();

        notify_others(
            &mut self.peers,
            peer_id,
            &RoomEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            "Peer left"
        );
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            room_id: self.room_id.clone(),
            peer_count: self.peers.len(),
            connected_peer_count: self.peers.values().filter(|p| p.connected).count(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            router_id: self.media.router().id().to_string(),
            worker_id: self.worker_id.clone(),
            is_active: self.is_active && !self.media.router().closed(),
            total_producers: self.peers.values().map(|p| p.producers.len()).sum(),
            total_consumers: self.peers.values().map(|p| p.consumers.len()).sum(),
            total_transports: self.peers.values().map(|p| p.transports.len()).sum(),
        }
    }

    /// Remove every peer, then close the router.
    async fn close(&mut self, reason: &str) {
        if !self.is_active {
            return;
        }

        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            if let Some(mut peer) = self.media.close_peer(&mut self.peers, &peer_id).await {
                peer.notify(RoomEvent::RoomClosed {
                    room_id: self.room_id.clone(),
                    reason: reason.to_string(),
                });
                self.metrics.peer_left();
            }
        }

        self.media.router().close().await;
        self.is_active = false;

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            reason = %reason,
            "Room closed"
        );
    }
}
