//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! - Creates rooms on first join, on a worker acquired from the pool
//! - Serializes room creation, so concurrent joins for one id share a room
//! - Schedules deferred closure when a room empties, and cancels it on rejoin
//! - Closes every room bound to a worker the pool reports lost
//! - Monitors room actors for panics (via `JoinHandle`)
//!
//! # Non-blocking Mailbox
//!
//! The registry never awaits a room actor or the media engine while handling
//! a message. Router creation, joins, removals, stats and closes run on
//! spawned tasks that report back through internal messages (`RoomCreated`,
//! `JoinSettled`, `PeerRemoved`) before answering their caller. A room stuck
//! in an engine call only holds up requests for that room.
//!
//! # Deferred Closure
//!
//! The registry mirrors each room's peer count from the [`Membership`]
//! snapshots those tasks relay, keeping the newest by version. A room with no
//! peers and no join in flight is closed after the grace delay. Each scheduled
//! closure carries a generation number; a join aborts the pending timer, and an
//! expiry whose generation no longer matches (or whose room is no longer idle)
//! is ignored.

use crate::engine::{EngineError, Router, TransportOptions};
use crate::errors::SignalingError;
use crate::media::{supported_codecs, PeerInfo};

use super::messages::{
    CreatedRouter, JoinResult, Membership, PoolEvent, RegistryMessage, RoomEvent, RoomStats,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::pool::WorkerPoolHandle;
use super::room::{RoomActor, RoomActorHandle, REASON_SHUTDOWN};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long `list_rooms` waits on each room for its stats.
const ROOM_STATS_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on each step of closing a room actor.
const ROOM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason sent to peers of a room whose worker died.
pub const REASON_WORKER_DIED: &str = "worker-died";

/// Reason sent to peers when a room is closed through the status API.
pub const REASON_CLOSED_BY_ADMIN: &str = "closed-by-admin";

/// Room policy applied by the registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_peers: usize,
    /// Delay before an empty room is closed.
    pub close_grace: Duration,
    pub transport_options: TransportOptions,
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor.
    #[must_use]
    pub fn spawn(
        pool: WorkerPoolHandle,
        settings: RegistrySettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = RoomRegistryActor {
            receiver,
            sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            pool_events: pool.subscribe(),
            pool_events_open: true,
            pool,
            settings,
            rooms: HashMap::new(),
            creating: HashMap::new(),
            pending_closures: HashMap::new(),
            next_generation: 0,
            next_instance: 0,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        let task_handle = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    /// Return the room, creating it on a pooled worker if it does not exist.
    pub async fn get_or_create_room(
        &self,
        room_id: String,
    ) -> Result<RoomActorHandle, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Add a peer to an existing room.
    pub async fn add_peer(
        &self,
        room_id: String,
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<JoinResult, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::AddPeer {
                room_id,
                peer_id,
                info,
                events,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get-or-create the room and add the peer to it.
    pub async fn join(
        &self,
        room_id: String,
        peer_id: String,
        info: PeerInfo,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(RoomActorHandle, JoinResult), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::JoinRoom {
                room_id,
                peer_id,
                info,
                events,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a peer. No-op if the room or peer is unknown.
    pub async fn remove_peer(&self, room_id: String, peer_id: String) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RemovePeer {
                room_id,
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Close a room. Returns whether the room existed.
    pub async fn close_room(&self, room_id: String, reason: String) -> Result<bool, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CloseRoom {
                room_id,
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn room_stats(&self, room_id: String) -> Result<RoomStats, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoomStats {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomStats>, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::ListRooms { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Close every room. Used at shutdown, before the pool closes its workers.
    pub async fn close_all(&self) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CloseAll { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    /// Closed directly if the room actor has to be aborted.
    router: Arc<dyn Router>,
    /// Distinguishes this room from an earlier room with the same id.
    instance: u64,
    worker_id: String,
    worker_generation: u64,
    /// Latest snapshot relayed from the room actor.
    membership: Membership,
    joins_in_flight: usize,
}

impl ManagedRoom {
    fn observe(&mut self, membership: Membership) {
        if membership.version >= self.membership.version {
            self.membership = membership;
        }
    }

    /// Empty, and no join is on its way in.
    fn is_idle(&self) -> bool {
        self.membership.peers == 0 && self.joins_in_flight == 0
    }
}

/// Scheduled closure of an empty room.
struct PendingClosure {
    generation: u64,
    timer: JoinHandle<()>,
}

/// Where the outcome of a join is delivered.
enum JoinReply {
    Join(oneshot::Sender<Result<(RoomActorHandle, JoinResult), SignalingError>>),
    AddPeer(oneshot::Sender<Result<JoinResult, SignalingError>>),
}

impl JoinReply {
    fn send(self, handle: RoomActorHandle, result: Result<JoinResult, SignalingError>) {
        match self {
            JoinReply::Join(tx) => {
                let _ = tx.send(result.map(|joined| (handle, joined)));
            }
            JoinReply::AddPeer(tx) => {
                let _ = tx.send(result);
            }
        }
    }

    fn fail(self, error: SignalingError) {
        match self {
            JoinReply::Join(tx) => {
                let _ = tx.send(Err(error));
            }
            JoinReply::AddPeer(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct PendingJoin {
    peer_id: String,
    info: PeerInfo,
    events: mpsc::Sender<RoomEvent>,
    reply: JoinReply,
}

/// Request parked while its room is being created.
enum Waiter {
    Handle(oneshot::Sender<Result<RoomActorHandle, SignalingError>>),
    Join(PendingJoin),
}

impl Waiter {
    fn fail(self, error: SignalingError) {
        match self {
            Waiter::Handle(tx) => {
                let _ = tx.send(Err(error));
            }
            Waiter::Join(join) => join.reply.fail(error),
        }
    }
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed to grace timers and room tasks; weak so they do not keep the
    /// mailbox open.
    sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    pool: WorkerPoolHandle,
    pool_events: broadcast::Receiver<PoolEvent>,
    pool_events_open: bool,
    settings: RegistrySettings,
    rooms: HashMap<String, ManagedRoom>,
    /// Rooms whose router is being created, with the requests waiting on them.
    creating: HashMap<String, Vec<Waiter>>,
    pending_closures: HashMap<String, PendingClosure>,
    next_generation: u64,
    next_instance: u64,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "sfu.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            max_peers = self.settings.max_peers,
            close_grace_secs = self.settings.close_grace.as_secs(),
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.close_all().await;
                    break;
                }

                event = self.pool_events.recv(), if self.pool_events_open => {
                    match event {
                        Ok(PoolEvent::WorkerLost { worker_id, generation }) => {
                            self.handle_worker_lost(&worker_id, generation);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Fall back to the routers' own state
                            warn!(
                                target: "sfu.actor.registry",
                                skipped = skipped,
                                "Missed worker events, sweeping rooms"
                            );
                            self.sweep_dead_rooms();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!(
                                target: "sfu.actor.registry",
                                "Worker event stream closed"
                            );
                            self.pool_events_open = false;
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message);
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.close_all().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle one message. Never awaits: work that waits on a room actor or
    /// the engine is spawned.
    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => match self.rooms.get(&room_id) {
                Some(managed) => {
                    let _ = respond_to.send(Ok(managed.handle.clone()));
                }
                None => self.park(room_id, Waiter::Handle(respond_to)),
            },

            RegistryMessage::AddPeer {
                room_id,
                peer_id,
                info,
                events,
                respond_to,
            } => {
                let join = PendingJoin {
                    peer_id,
                    info,
                    events,
                    reply: JoinReply::AddPeer(respond_to),
                };
                self.dispatch_join(&room_id, join);
            }

            RegistryMessage::JoinRoom {
                room_id,
                peer_id,
                info,
                events,
                respond_to,
            } => {
                let join = PendingJoin {
                    peer_id,
                    info,
                    events,
                    reply: JoinReply::Join(respond_to),
                };
                if self.rooms.contains_key(&room_id) {
                    self.dispatch_join(&room_id, join);
                } else {
                    self.park(room_id, Waiter::Join(join));
                }
            }

            RegistryMessage::RemovePeer {
                room_id,
                peer_id,
                respond_to,
            } => self.remove_peer(room_id, peer_id, respond_to),

            RegistryMessage::CloseRoom {
                room_id,
                reason,
                respond_to,
            } => match self.take_room(&room_id, &reason) {
                Some(managed) => {
                    tokio::spawn(async move {
                        close_room_actor(room_id, managed, reason).await;
                        let _ = respond_to.send(true);
                    });
                }
                None => {
                    let _ = respond_to.send(false);
                }
            },

            RegistryMessage::GetRoomStats {
                room_id,
                respond_to,
            } => match self.rooms.get(&room_id) {
                Some(managed) => {
                    let handle = managed.handle.clone();
                    tokio::spawn(async move {
                        let _ = respond_to.send(handle.room_stats().await);
                    });
                }
                None => {
                    let _ = respond_to.send(Err(SignalingError::RoomNotFound(room_id)));
                }
            },

            RegistryMessage::ListRooms { respond_to } => {
                let handles: Vec<RoomActorHandle> = self
                    .rooms
                    .values()
                    .map(|managed| managed.handle.clone())
                    .collect();
                tokio::spawn(async move {
                    // A stalled room is left out rather than holding up the list
                    let requests = handles
                        .iter()
                        .map(|handle| tokio::time::timeout(ROOM_STATS_TIMEOUT, handle.room_stats()));
                    let stats = futures::future::join_all(requests)
                        .await
                        .into_iter()
                        .filter_map(|result| result.ok().and_then(Result::ok))
                        .collect();
                    let _ = respond_to.send(stats);
                });
            }

            RegistryMessage::CloseAll { respond_to } => {
                let rooms = self.take_all();
                tokio::spawn(async move {
                    close_rooms(rooms, REASON_SHUTDOWN).await;
                    let _ = respond_to.send(());
                });
            }

            RegistryMessage::GraceExpired {
                room_id,
                generation,
            } => self.handle_grace_expired(&room_id, generation),

            RegistryMessage::RoomCreated { room_id, result } => {
                self.handle_room_created(room_id, result);
            }

            RegistryMessage::JoinSettled {
                room_id,
                instance,
                membership,
            } => {
                let Some(managed) = self.live_room(&room_id, instance) else {
                    return;
                };
                managed.joins_in_flight = managed.joins_in_flight.saturating_sub(1);
                if let Some(membership) = membership {
                    managed.observe(membership);
                }
                self.schedule_closure_if_idle(&room_id);
            }

            RegistryMessage::PeerRemoved {
                room_id,
                instance,
                membership,
            } => {
                let Some(managed) = self.live_room(&room_id, instance) else {
                    return;
                };
                managed.observe(membership);
                self.schedule_closure_if_idle(&room_id);
            }

            RegistryMessage::RouterLost { room_id, instance } => {
                if self.live_room(&room_id, instance).is_some() {
                    if let Some(managed) = self.take_room(&room_id, REASON_WORKER_DIED) {
                        tokio::spawn(close_room_actor(
                            room_id,
                            managed,
                            REASON_WORKER_DIED.to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// The room, if it is still the instance a spawned task reported on.
    fn live_room(&mut self, room_id: &str, instance: u64) -> Option<&mut ManagedRoom> {
        self.rooms
            .get_mut(room_id)
            .filter(|managed| managed.instance == instance)
    }

    /// Queue a request behind the creation of `room_id`, starting it if needed.
    fn park(&mut self, room_id: String, waiter: Waiter) {
        if let Some(waiters) = self.creating.get_mut(&room_id) {
            waiters.push(waiter);
            return;
        }
        self.creating.insert(room_id.clone(), vec![waiter]);

        let pool = self.pool.clone();
        let registry = self.sender.clone();
        tokio::spawn(async move {
            let result = create_router(&pool).await;
            let message = RegistryMessage::RoomCreated { room_id, result };
            let undelivered = match registry.upgrade() {
                Some(registry) => registry.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };
            // Registry is gone; release the router
            if let Some(RegistryMessage::RoomCreated {
                result: Ok(created),
                ..
            }) = undelivered
            {
                created.router.close().await;
            }
        });
    }

    fn handle_room_created(
        &mut self,
        room_id: String,
        result: Result<CreatedRouter, SignalingError>,
    ) {
        let Some(waiters) = self.creating.remove(&room_id) else {
            // Waiters were failed at shutdown
            if let Ok(created) = result {
                tokio::spawn(async move { created.router.close().await });
            }
            return;
        };

        let created = match result {
            Ok(created) if created.router.closed() => {
                Err(SignalingError::Engine(EngineError::RouterClosed))
            }
            other => other,
        };

        let created = match created {
            Ok(created) => created,
            Err(e) => {
                warn!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    error = %e,
                    waiting = waiters.len(),
                    "Room creation failed"
                );
                for waiter in waiters {
                    waiter.fail(creation_failure(&e));
                }
                return;
            }
        };

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            created.worker.id.clone(),
            Arc::clone(&created.router),
            self.settings.transport_options.clone(),
            self.settings.max_peers,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        let instance = self.next_instance;
        self.next_instance += 1;
        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                router: created.router,
                instance,
                worker_id: created.worker.id.clone(),
                worker_generation: created.worker.generation,
                membership: Membership {
                    peers: 0,
                    version: 0,
                },
                joins_in_flight: 0,
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            worker_id = %created.worker.id,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        for waiter in waiters {
            match waiter {
                Waiter::Handle(tx) => {
                    let _ = tx.send(Ok(handle.clone()));
                }
                Waiter::Join(join) => self.dispatch_join(&room_id, join),
            }
        }

        // A room nobody joins is reclaimed like any other empty room
        self.schedule_closure_if_idle(&room_id);
    }

    /// Hand a join to the room actor on a spawned task.
    fn dispatch_join(&mut self, room_id: &str, join: PendingJoin) {
        let Some(managed) = self.rooms.get_mut(room_id) else {
            join.reply
                .fail(SignalingError::RoomNotFound(room_id.to_string()));
            return;
        };
        managed.joins_in_flight += 1;
        let handle = managed.handle.clone();
        let instance = managed.instance;
        self.cancel_pending_closure(room_id);

        let registry = self.sender.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            let PendingJoin {
                peer_id,
                info,
                events,
                reply,
            } = join;
            let result = handle.add_peer_tracked(peer_id, info, events).await;
            let membership = result.as_ref().ok().map(|(_, membership)| *membership);

            // Bookkeeping is queued before the caller can send its next request
            report(
                &registry,
                RegistryMessage::JoinSettled {
                    room_id,
                    instance,
                    membership,
                },
            )
            .await;
            reply.send(handle, result.map(|(joined, _)| joined));
        });
    }

    fn remove_peer(
        &mut self,
        room_id: String,
        peer_id: String,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    ) {
        let Some(managed) = self.rooms.get(&room_id) else {
            let _ = respond_to.send(Ok(()));
            return;
        };
        let handle = managed.handle.clone();
        let instance = managed.instance;

        let registry = self.sender.clone();
        tokio::spawn(async move {
            match handle.remove_peer_tracked(peer_id).await {
                Ok(membership) => {
                    report(
                        &registry,
                        RegistryMessage::PeerRemoved {
                            room_id,
                            instance,
                            membership,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = %e,
                        "Room actor unavailable during peer removal"
                    );
                }
            }
            let _ = respond_to.send(Ok(()));
        });
    }

    fn schedule_closure_if_idle(&mut self, room_id: &str) {
        let idle = self.rooms.get(room_id).is_some_and(ManagedRoom::is_idle);
        if idle && !self.pending_closures.contains_key(room_id) {
            self.schedule_closure(room_id);
        }
    }

    fn schedule_closure(&mut self, room_id: &str) {
        self.cancel_pending_closure(room_id);

        let generation = self.next_generation;
        self.next_generation += 1;

        let delay = self.settings.close_grace;
        let registry = self.sender.clone();
        let expired_room = room_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            report(
                &registry,
                RegistryMessage::GraceExpired {
                    room_id: expired_room,
                    generation,
                },
            )
            .await;
        });

        self.pending_closures
            .insert(room_id.to_string(), PendingClosure { generation, timer });

        debug!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            delay_secs = delay.as_secs(),
            "Room empty, closure scheduled"
        );
    }

    fn cancel_pending_closure(&mut self, room_id: &str) {
        if let Some(pending) = self.pending_closures.remove(room_id) {
            pending.timer.abort();
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                "Pending room closure cancelled"
            );
        }
    }

    fn handle_grace_expired(&mut self, room_id: &str, generation: u64) {
        match self.pending_closures.get(room_id) {
            Some(pending) if pending.generation == generation => {
                self.pending_closures.remove(room_id);
            }
            _ => {
                // Superseded by a rejoin or a later schedule
                return;
            }
        }

        let Some(managed) = self.rooms.get(room_id) else {
            return;
        };
        if !managed.is_idle() {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                peer_count = managed.membership.peers,
                joins_in_flight = managed.joins_in_flight,
                "Room no longer empty, skipping closure"
            );
            return;
        }

        if let Some(managed) = self.take_room(room_id, "empty") {
            tokio::spawn(close_room_actor(
                room_id.to_string(),
                managed,
                "empty".to_string(),
            ));
        }
    }

    /// Unregister a room. The caller closes its actor.
    fn take_room(&mut self, room_id: &str, reason: &str) -> Option<ManagedRoom> {
        self.cancel_pending_closure(room_id);
        let managed = self.rooms.remove(room_id)?;
        self.metrics.room_removed();

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            reason = %reason,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
        Some(managed)
    }

    fn take_all(&mut self) -> Vec<(String, ManagedRoom)> {
        let room_ids: Vec<String> = self.rooms.keys().cloned().collect();
        info!(
            target: "sfu.actor.registry",
            room_count = room_ids.len(),
            "Closing all rooms"
        );
        for (room_id, waiters) in self.creating.drain() {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                waiting = waiters.len(),
                "Abandoning room creation"
            );
            for waiter in waiters {
                waiter.fail(SignalingError::ShuttingDown);
            }
        }
        room_ids
            .into_iter()
            .filter_map(|room_id| {
                let managed = self.take_room(&room_id, REASON_SHUTDOWN)?;
                Some((room_id, managed))
            })
            .collect()
    }

    fn handle_worker_lost(&mut self, worker_id: &str, generation: u64) {
        let affected: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| {
                managed.worker_id == worker_id && managed.worker_generation == generation
            })
            .map(|(room_id, _)| room_id.clone())
            .collect();

        if affected.is_empty() {
            return;
        }
        warn!(
            target: "sfu.actor.registry",
            worker_id = %worker_id,
            rooms = affected.len(),
            "Closing rooms bound to dead worker"
        );

        let rooms: Vec<(String, ManagedRoom)> = affected
            .into_iter()
            .filter_map(|room_id| {
                let managed = self.take_room(&room_id, REASON_WORKER_DIED)?;
                Some((room_id, managed))
            })
            .collect();
        tokio::spawn(async move { close_rooms(rooms, REASON_WORKER_DIED).await });
    }

    /// Report rooms whose router was closed underneath them.
    fn sweep_dead_rooms(&self) {
        let rooms: Vec<(String, u64, RoomActorHandle)> = self
            .rooms
            .iter()
            .map(|(room_id, managed)| (room_id.clone(), managed.instance, managed.handle.clone()))
            .collect();

        let registry = self.sender.clone();
        tokio::spawn(async move {
            for (room_id, instance, handle) in rooms {
                if let Ok(stats) = handle.room_stats().await {
                    if !stats.is_active {
                        report(&registry, RegistryMessage::RouterLost { room_id, instance }).await;
                    }
                }
            }
        });
    }

    async fn close_all(&mut self) {
        let rooms = self.take_all();
        close_rooms(rooms, REASON_SHUTDOWN).await;
    }

    /// Drop room actors whose task ended without being closed.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            self.cancel_pending_closure(&room_id);
            if let Some(managed) = self.rooms.remove(&room_id) {
                if let Err(join_error) = managed.task_handle.await {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
                self.metrics.room_removed();
            }
        }
    }
}

/// Acquire a worker and create a router on it for a new room.
async fn create_router(pool: &WorkerPoolHandle) -> Result<CreatedRouter, SignalingError> {
    let worker = pool.acquire_worker().await?;
    let router = worker.worker.create_router(&supported_codecs()).await?;
    Ok(CreatedRouter { worker, router })
}

/// Error handed to each request that waited on a failed room creation.
fn creation_failure(error: &SignalingError) -> SignalingError {
    match error {
        SignalingError::PoolExhausted => SignalingError::PoolExhausted,
        SignalingError::ShuttingDown => SignalingError::ShuttingDown,
        SignalingError::Engine(e) => SignalingError::Engine(EngineError::Rejected(e.to_string())),
        other => SignalingError::Internal(other.to_string()),
    }
}

/// Send an internal message from a spawned task. Dropped once the registry
/// has stopped.
async fn report(registry: &mpsc::WeakSender<RegistryMessage>, message: RegistryMessage) {
    if let Some(registry) = registry.upgrade() {
        let _ = registry.send(message).await;
    }
}

/// Close a room actor and wait for its task, aborting it if the room is stuck.
async fn close_room_actor(room_id: String, managed: ManagedRoom, reason: String) {
    let ManagedRoom {
        handle,
        mut task_handle,
        router,
        ..
    } = managed;

    match tokio::time::timeout(ROOM_CLOSE_TIMEOUT, handle.close(reason)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                error = %e,
                "Room actor already stopped"
            );
        }
        Err(_) => {
            warn!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                "Room close timed out, aborting room actor"
            );
            task_handle.abort();
        }
    }

    match tokio::time::timeout(ROOM_CLOSE_TIMEOUT, &mut task_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => {
            warn!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                error = ?e,
                "Room actor task panicked during removal"
            );
        }
        Err(_) => {
            warn!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                "Room actor task cleanup timed out"
            );
            task_handle.abort();
        }
    }

    // An aborted actor never closed its router
    if !router.closed() {
        router.close().await;
    }
}

async fn close_rooms(rooms: Vec<(String, ManagedRoom)>, reason: &str) {
    let closes = rooms
        .into_iter()
        .map(|(room_id, managed)| close_room_actor(room_id, managed, reason.to_string()));
    futures::future::join_all(closes).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::{ListenIp, LocalEngine, WorkerLogLevel, WorkerSettings};

    fn settings(max_peers: usize, close_grace: Duration) -> RegistrySettings {
        RegistrySettings {
            max_peers,
            close_grace,
            transport_options: TransportOptions {
                listen_ips: vec![ListenIp {
                    ip: "0.0.0.0".to_string(),
                    announced_ip: Some("127.0.0.1".to_string()),
                }],
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                max_incoming_bitrate: None,
                max_outgoing_bitrate: None,
            },
        }
    }

    async fn registry(
        engine: Arc<LocalEngine>,
        workers: usize,
        max_peers: usize,
        close_grace: Duration,
    ) -> RoomRegistryHandle {
        let token = CancellationToken::new();
        let metrics = ActorMetrics::new();
        let (pool, _pool_task) = WorkerPoolHandle::initialize(
            engine,
            workers,
            WorkerSettings {
                log_level: WorkerLogLevel::None,
                rtc_min_port: 43000,
                rtc_max_port: 43100,
            },
            token.child_token(),
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        let (registry, _task) = RoomRegistryHandle::spawn(
            pool,
            settings(max_peers, close_grace),
            token.child_token(),
            metrics,
        );
        registry
    }

    fn sink() -> (mpsc::Sender<RoomEvent>, mpsc::Receiver<RoomEvent>) {
        mpsc::channel(16)
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_returns_one_room() {
        let registry = registry(Arc::new(LocalEngine::new()), 2, 4, Duration::from_secs(30)).await;

        let (first, second) = tokio::join!(
            registry.get_or_create_room("standup".to_string()),
            registry.get_or_create_room("standup".to_string()),
        );
        assert_eq!(first.unwrap().room_id(), "standup");
        assert_eq!(second.unwrap().room_id(), "standup");

        assert_eq!(registry.list_rooms().await.unwrap().len(), 1);
        registry.cancel();
    }

    #[tokio::test]
    async fn test_add_peer_to_unknown_room_fails() {
        let registry = registry(Arc::new(LocalEngine::new()), 1, 4, Duration::from_secs(30)).await;
        let (tx, _rx) = sink();

        let result = registry
            .add_peer("nope".to_string(), "a".to_string(), PeerInfo::default(), tx)
            .await;
        assert!(matches!(result, Err(SignalingError::RoomNotFound(_))));
        registry.cancel();
    }

    #[tokio::test]
    async fn test_remove_peer_unknown_is_noop() {
        let registry = registry(Arc::new(LocalEngine::new()), 1, 4, Duration::from_secs(30)).await;

        registry
            .remove_peer("nope".to_string(), "a".to_string())
            .await
            .unwrap();

        let (tx, _rx) = sink();
        registry
            .join("r".to_string(), "a".to_string(), PeerInfo::default(), tx)
            .await
            .unwrap();
        registry
            .remove_peer("r".to_string(), "ghost".to_string())
            .await
            .unwrap();
        assert_eq!(
            registry.room_stats("r".to_string()).await.unwrap().peer_count,
            1
        );
        registry.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_closes_after_grace() {
        let grace = Duration::from_secs(30);
        let registry = registry(Arc::new(LocalEngine::new()), 1, 4, grace).await;
        let (tx, _rx) = sink();

        registry
            .join("r".to_string(), "a".to_string(), PeerInfo::default(), tx)
            .await
            .unwrap();
        registry
            .remove_peer("r".to_string(), "a".to_string())
            .await
            .unwrap();

        tokio::time::sleep(grace - Duration::from_secs(1)).await;
        assert!(registry.room_stats("r".to_string()).await.is_ok());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            registry.room_stats("r".to_string()).await,
            Err(SignalingError::RoomNotFound(_))
        ));
        registry.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_within_grace_keeps_room() {
        let grace = Duration::from_secs(30);
        let registry = registry(Arc::new(LocalEngine::new()), 1, 4, grace).await;

        let (tx, _rx) = sink();
        registry
            .join("r".to_string(), "a".to_string(), PeerInfo::default(), tx)
            .await
            .unwrap();
        registry
            .remove_peer("r".to_string(), "a".to_string())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (tx, _rx2) = sink();
        registry
            .join("r".to_string(), "b".to_string(), PeerInfo::default(), tx)
            .await
            .unwrap();

        tokio::time::sleep(grace * 2).await;
        let stats = registry.room_stats("r".to_string()).await.unwrap();
        assert_eq!(stats.peer_count, 1);
        assert!(stats.is_active);
        registry.cancel();
    }

    #[tokio::test]
    async fn test_close_room_is_idempotent() {
        let registry = registry(Arc::new(LocalEngine::new()), 1, 4, Duration::from_secs(30)).await;
        let (tx, mut rx) = sink();

        registry
            .join("r".to_string(), "a".to_string(), PeerInfo::default(), tx)
            .await
            .unwrap();

        assert!(registry
            .close_room("r".to_string(), REASON_CLOSED_BY_ADMIN.to_string())
            .await
            .unwrap());
        assert!(!registry
            .close_room("r".to_string(), REASON_CLOSED_BY_ADMIN.to_string())
            .await
            .unwrap());

        assert_eq!(
            rx.recv().await.unwrap(),
            RoomEvent::RoomClosed {
                room_id: "r".to_string(),
                reason: REASON_CLOSED_BY_ADMIN.to_string(),
            }
        );
        registry.cancel();
    }

    #[tokio::test]
    async fn test_worker_death_closes_bound_rooms() {
        let engine = Arc::new(LocalEngine::new());
        let registry = registry(Arc::clone(&engine), 1, 4, Duration::from_secs(30)).await;
        let (tx, mut rx) = sink();

        registry
            .join("r".to_string(), "a".to_string(), PeerInfo::default(), tx)
            .await
            .unwrap();

        engine.spawned_workers()[0].crash();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            RoomEvent::RoomClosed {
                room_id: "r".to_string(),
                reason: REASON_WORKER_DIED.to_string(),
            }
        );

        // The replacement worker serves new rooms
        let (tx, _rx) = sink();
        let (_, joined) = registry
            .join("r".to_string(), "a".to_string(), PeerInfo::default(), tx)
            .await
            .unwrap();
        assert_eq!(joined.room_id, "r");
        registry.cancel();
    }
}
