//! `WorkerPoolActor` - owns the media-engine workers.
//!
//! - Creates `n` workers up front; any failure is fatal
//! - Hands out workers round-robin, skipping closed ones
//! - Watches each worker for death, replaces it once under the same logical id,
//!   and drops it permanently if the replacement fails
//! - Broadcasts [`PoolEvent::WorkerLost`] so rooms bound to a dead worker are closed
//! - Cancels the exhaustion token when no worker is left
//!
//! # Worker Ids
//!
//! Workers are named `worker_{index}`. A replacement keeps the index but gets a new
//! generation, so rooms created on the replacement are not mistaken for rooms of the
//! dead worker.

use crate::engine::{MediaEngine, Worker, WorkerSettings};
use crate::errors::SignalingError;
use crate::observability::metrics as prom;

use super::messages::{AcquiredWorker, PoolEvent, PoolMessage, WorkerInfo, WorkerUsage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the pool mailbox.
const POOL_CHANNEL_BUFFER: usize = 256;

/// Capacity of the worker-lost broadcast.
const POOL_EVENT_BUFFER: usize = 64;

/// Handle to the `WorkerPoolActor`.
#[derive(Clone)]
pub struct WorkerPoolHandle {
    sender: mpsc::Sender<PoolMessage>,
    events: broadcast::Sender<PoolEvent>,
    cancel_token: CancellationToken,
    exhausted: CancellationToken,
}

impl WorkerPoolHandle {
    /// Create `count` workers and spawn the pool actor.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Engine` if any worker fails to start. Workers
    /// created before the failure are closed.
    pub async fn initialize(
        engine: Arc<dyn MediaEngine>,
        count: usize,
        settings: WorkerSettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> Result<(Self, JoinHandle<()>), SignalingError> {
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            match engine.create_worker(&settings).await {
                Ok(worker) => {
                    info!(
                        target: "sfu.actor.pool",
                        worker_id = %worker_id(index),
                        pid = worker.pid(),
                        "Media worker created"
                    );
                    workers.push(worker);
                }
                Err(e) => {
                    error!(
                        target: "sfu.actor.pool",
                        worker_id = %worker_id(index),
                        error = %e,
                        "Failed to create media worker"
                    );
                    for worker in &workers {
                        worker.close().await;
                    }
                    return Err(SignalingError::Engine(e));
                }
            }
        }

        let (sender, receiver) = mpsc::channel(POOL_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(POOL_EVENT_BUFFER);
        let exhausted = CancellationToken::new();

        let mut actor = WorkerPoolActor {
            receiver,
            sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            engine,
            settings,
            workers: Vec::with_capacity(count),
            cursor: 0,
            next_generation: 0,
            events: events.clone(),
            exhausted: exhausted.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Pool, "pool"),
        };
        for (index, worker) in workers.into_iter().enumerate() {
            actor.adopt(worker_id(index), worker);
        }
        prom::set_workers_alive(actor.workers.len());

        let task_handle = tokio::spawn(actor.run());

        Ok((
            Self {
                sender,
                events,
                cancel_token,
                exhausted,
            },
            task_handle,
        ))
    }

    /// Next healthy worker, round-robin.
    pub async fn acquire_worker(&self) -> Result<AcquiredWorker, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PoolMessage::Acquire { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Healthy iff at least one worker is alive.
    ///
    /// Reports unhealthy if the pool actor has stopped.
    pub async fn health_check(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PoolMessage::HealthCheck { respond_to: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PoolMessage::ListWorkers { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn resource_usage(&self) -> Result<Vec<WorkerUsage>, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PoolMessage::ResourceUsage { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Close every worker. Used at shutdown.
    pub async fn close_all(&self) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PoolMessage::CloseAll { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Subscribe to worker-lost events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Token cancelled when the pool has no workers left.
    #[must_use]
    pub fn exhausted_token(&self) -> CancellationToken {
        self.exhausted.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

fn worker_id(index: usize) -> String {
    format!("worker_{index}")
}

struct ManagedWorker {
    id: String,
    generation: u64,
    worker: Arc<dyn Worker>,
    /// Stops the death watcher when the worker is removed or closed.
    watcher_token: CancellationToken,
}

/// The `WorkerPoolActor` implementation.
pub struct WorkerPoolActor {
    receiver: mpsc::Receiver<PoolMessage>,
    /// Handed to death watchers; weak so watchers do not keep the mailbox open.
    sender: mpsc::WeakSender<PoolMessage>,
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    settings: WorkerSettings,
    /// Live workers in creation order.
    workers: Vec<ManagedWorker>,
    cursor: usize,
    next_generation: u64,
    events: broadcast::Sender<PoolEvent>,
    exhausted: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl WorkerPoolActor {
    #[instrument(skip_all, name = "sfu.actor.pool", fields(workers = self.workers.len()))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.pool",
            workers = self.workers.len(),
            "WorkerPoolActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.pool",
                        "WorkerPoolActor received cancellation signal"
                    );
                    self.close_all().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message).await;
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.pool",
                                "WorkerPoolActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.pool",
            workers_remaining = self.workers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "WorkerPoolActor stopped"
        );
    }

    async fn handle_message(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::Acquire { respond_to } => {
                let _ = respond_to.send(self.acquire());
            }

            PoolMessage::HealthCheck { respond_to } => {
                let _ = respond_to.send(self.alive_count() > 0);
            }

            PoolMessage::ListWorkers { respond_to } => {
                let workers = self
                    .workers
                    .iter()
                    .map(|managed| WorkerInfo {
                        id: managed.id.clone(),
                        pid: managed.worker.pid(),
                        closed: managed.worker.closed(),
                    })
                    .collect();
                let _ = respond_to.send(workers);
            }

            PoolMessage::ResourceUsage { respond_to } => {
                let usage = self.resource_usage().await;
                let _ = respond_to.send(usage);
            }

            PoolMessage::CloseAll { respond_to } => {
                self.close_all().await;
                let _ = respond_to.send(());
            }

            PoolMessage::WorkerDied {
                worker_id,
                generation,
            } => {
                self.handle_worker_died(worker_id, generation).await;
            }
        }
    }

    fn alive_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|managed| !managed.worker.closed())
            .count()
    }

    /// Round-robin over the live set, advancing the cursor past closed workers.
    fn acquire(&mut self) -> Result<AcquiredWorker, SignalingError> {
        let count = self.workers.len();
        for _ in 0..count {
            let index = self.cursor % count;
            self.cursor = (index + 1) % count;

            if let Some(managed) = self.workers.get(index) {
                if managed.worker.closed() {
                    continue;
                }
                debug!(
                    target: "sfu.actor.pool",
                    worker_id = %managed.id,
                    "Worker acquired"
                );
                return Ok(AcquiredWorker {
                    id: managed.id.clone(),
                    generation: managed.generation,
                    worker: Arc::clone(&managed.worker),
                });
            }
        }

        Err(SignalingError::PoolExhausted)
    }

    async fn resource_usage(&self) -> Vec<WorkerUsage> {
        let mut usage = Vec::with_capacity(self.workers.len());
        for managed in &self.workers {
            match managed.worker.resource_usage().await {
                Ok(value) => usage.push(WorkerUsage {
                    id: managed.id.clone(),
                    pid: managed.worker.pid(),
                    usage: value,
                }),
                Err(e) => {
                    warn!(
                        target: "sfu.actor.pool",
                        worker_id = %managed.id,
                        error = %e,
                        "Failed to read worker resource usage"
                    );
                }
            }
        }
        usage
    }

    /// Register a worker and spawn its death watcher.
    fn adopt(&mut self, id: String, worker: Arc<dyn Worker>) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let watcher_token = self.cancel_token.child_token();
        spawn_death_watcher(
            id.clone(),
            generation,
            Arc::clone(&worker),
            self.sender.clone(),
            watcher_token.clone(),
        );

        self.workers.push(ManagedWorker {
            id,
            generation,
            worker,
            watcher_token,
        });
        generation
    }

    async fn handle_worker_died(&mut self, worker_id: String, generation: u64) {
        let Some(position) = self
            .workers
            .iter()
            .position(|m| m.id == worker_id && m.generation == generation)
        else {
            // Already replaced or closed
            return;
        };

        let dead = self.workers.remove(position);
        dead.watcher_token.cancel();
        prom::record_worker_death();

        error!(
            target: "sfu.actor.pool",
            worker_id = %worker_id,
            pid = dead.worker.pid(),
            "Media worker died"
        );

        let _ = self.events.send(PoolEvent::WorkerLost {
            worker_id: worker_id.clone(),
            generation,
        });

        match self.engine.create_worker(&self.settings).await {
            Ok(worker) => {
                info!(
                    target: "sfu.actor.pool",
                    worker_id = %worker_id,
                    pid = worker.pid(),
                    "Media worker replaced"
                );
                self.adopt(worker_id, worker);
                // Keep creation order stable for round-robin
                if let Some(replacement) = self.workers.pop() {
                    let position = position.min(self.workers.len());
                    self.workers.insert(position, replacement);
                }
            }
            Err(e) => {
                error!(
                    target: "sfu.actor.pool",
                    worker_id = %worker_id,
                    error = %e,
                    "Media worker replacement failed, removing permanently"
                );
            }
        }

        let alive = self.alive_count();
        prom::set_workers_alive(alive);

        if alive == 0 {
            error!(
                target: "sfu.actor.pool",
                "No media workers left, restart required"
            );
            self.exhausted.cancel();
        }
    }

    async fn close_all(&mut self) {
        for managed in self.workers.drain(..) {
            managed.watcher_token.cancel();
            managed.worker.close().await;
            debug!(
                target: "sfu.actor.pool",
                worker_id = %managed.id,
                "Media worker closed"
            );
        }
        prom::set_workers_alive(0);
    }
}

/// Forward a worker's death to the pool mailbox.
fn spawn_death_watcher(
    worker_id: String,
    generation: u64,
    worker: Arc<dyn Worker>,
    pool: mpsc::WeakSender<PoolMessage>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel_token.cancelled() => {}
            () = worker.died() => {
                if let Some(pool) = pool.upgrade() {
                    let _ = pool
                        .send(PoolMessage::WorkerDied { worker_id, generation })
                        .await;
                }
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::{LocalEngine, WorkerLogLevel};
    use std::collections::HashSet;
    use std::time::Duration;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            log_level: WorkerLogLevel::Warn,
            rtc_min_port: 40000,
            rtc_max_port: 40100,
        }
    }

    async fn pool_with(
        engine: Arc<LocalEngine>,
        count: usize,
    ) -> (WorkerPoolHandle, JoinHandle<()>) {
        WorkerPoolHandle::initialize(
            engine,
            count,
            settings(),
            CancellationToken::new(),
            ActorMetrics::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_worker_once() {
        let engine = Arc::new(LocalEngine::new());
        let (pool, _task) = pool_with(Arc::clone(&engine), 3).await;

        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(pool.acquire_worker().await.unwrap().id);
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.contains("worker_0"));
        assert!(seen.contains("worker_2"));

        // Wraps around
        assert_eq!(pool.acquire_worker().await.unwrap().id, "worker_0");

        pool.cancel();
    }

    #[tokio::test]
    async fn test_health_check_and_listing() {
        let engine = Arc::new(LocalEngine::new());
        let (pool, _task) = pool_with(Arc::clone(&engine), 2).await;

        assert!(pool.health_check().await);

        let workers = pool.list_workers().await.unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].id, "worker_0");
        assert!(!workers[1].closed);

        let usage = pool.resource_usage().await.unwrap();
        assert_eq!(usage.len(), 2);

        pool.cancel();
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced_with_same_id() {
        let engine = Arc::new(LocalEngine::new());
        let (pool, _task) = pool_with(Arc::clone(&engine), 2).await;
        let mut events = pool.subscribe();

        engine.spawned_workers()[0].crash();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            PoolEvent::WorkerLost {
                worker_id: "worker_0".to_string(),
                generation: 0,
            }
        );

        // Mailbox ordering: the replacement is in place once this returns
        let workers = pool.list_workers().await.unwrap();
        let ids: Vec<_> = workers.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["worker_0", "worker_1"]);
        assert!(workers.iter().all(|w| !w.closed));
        assert_eq!(engine.spawned_workers().len(), 3);

        pool.cancel();
    }

    #[tokio::test]
    async fn test_acquire_after_close_all_fails() {
        let engine = Arc::new(LocalEngine::new());
        let (pool, _task) = pool_with(engine, 1).await;

        pool.close_all().await.unwrap();

        assert!(matches!(
            pool.acquire_worker().await,
            Err(SignalingError::PoolExhausted)
        ));
        assert!(!pool.health_check().await);

        pool.cancel();
    }
}
