//! Actor metrics and mailbox monitoring.
//!
//! Provides mailbox depth monitoring with per-actor thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Pool       | < 50   | 50-200  | > 200    |
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Room       | < 100  | 100-500 | > 500    |
//!
//! Depth gauges are exported with the `sfu_` prefix via
//! [`crate::observability::metrics`].

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the registry and room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for the worker pool actor.
pub const POOL_MAILBOX_NORMAL: usize = 50;
pub const POOL_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// WorkerPoolActor (singleton).
    Pool,
    /// RoomRegistryActor (singleton).
    Registry,
    /// RoomActor (one per room).
    Room,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Pool => "pool",
            ActorType::Registry => "registry",
            ActorType::Room => "room",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Pool => POOL_MAILBOX_WARNING,
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Pool => POOL_MAILBOX_NORMAL,
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Mailbox monitor for tracking queue depth and emitting metrics.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Actor identifier (room id for room actors).
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message taken off the mailbox.
    ///
    /// `backlog` is the number of messages still queued behind it, read from
    /// the receiver at dequeue time.
    pub fn record_received(&self, backlog: usize) {
        let previous = self.depth.swap(backlog, Ordering::Relaxed);
        self.peak_depth.fetch_max(backlog, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), backlog);

        match self.level_for_depth(backlog) {
            MailboxLevel::Critical => {
                warn!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = backlog,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning
                if self.level_for_depth(previous) == MailboxLevel::Normal =>
            {
                debug!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = backlog,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated metrics for the actor system.
///
/// Shared between the actors (which update values) and the status API
/// (which reads them without a mailbox round-trip).
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Rooms currently registered.
    pub active_rooms: AtomicUsize,
    /// Peers currently joined across all rooms.
    pub active_peers: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    /// Total messages processed across all actors.
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let count = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(count);
    }

    pub fn room_removed(&self) {
        let count = self.active_rooms.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        prom::set_rooms_active(count);
    }

    pub fn peer_joined(&self) {
        let count = self.active_peers.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_peers_active(count);
    }

    pub fn peer_left(&self) {
        let count = self.active_peers.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        prom::set_peers_active(count);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        prom::record_actor_panic(actor_type.as_str());
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_monitor_tracks_backlog() {
        let monitor = MailboxMonitor::new(ActorType::Room, "room-1");

        monitor.record_received(3);
        assert_eq!(monitor.current_depth(), 3);
        monitor.record_received(0);
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 2);
    }

    #[test]
    fn test_mailbox_levels_follow_thresholds() {
        let monitor = MailboxMonitor::new(ActorType::Pool, "pool");
        monitor.record_received(POOL_MAILBOX_NORMAL + 1);
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        monitor.record_received(POOL_MAILBOX_WARNING + 1);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);

        monitor.record_received(0);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);
    }

    #[tokio::test]
    async fn test_backlog_reflects_queued_messages() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(8);
        for i in 0..4 {
            tx.send(i).await.unwrap();
        }

        let monitor = MailboxMonitor::new(ActorType::Registry, "registry");
        rx.recv().await.unwrap();
        monitor.record_received(rx.len());
        assert_eq!(monitor.current_depth(), 3);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();
        metrics.room_created();
        metrics.peer_joined();
        metrics.peer_joined();
        metrics.peer_left();

        assert_eq!(metrics.room_count(), 1);
        assert_eq!(metrics.peer_count(), 1);

        metrics.record_panic(ActorType::Room);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 1);
    }
}
