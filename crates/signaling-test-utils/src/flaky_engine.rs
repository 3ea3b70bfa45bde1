//! Media engine wrapper that injects worker-creation failures and stalls.
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::FlakyEngine;
//!
//! let engine = FlakyEngine::new();
//! engine.fail_next_spawns(1);
//!
//! // The first create_worker call fails, later calls reach the LocalEngine.
//!
//! engine.stall_transport_creation();
//! // Every create_webrtc_transport call from now on never resolves.
//! ```

use async_trait::async_trait;
use serde_json::Value;
use signaling_server::engine::{
    EngineError, LocalEngine, LocalWorker, MediaEngine, Router, RtpCapabilities,
    RtpCodecCapability, Transport, TransportOptions, Worker, WorkerSettings,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// `LocalEngine` that fails the next N `create_worker` calls, and can make
/// transport creation hang.
#[derive(Default)]
pub struct FlakyEngine {
    inner: LocalEngine,
    successes_left: AtomicUsize,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    stall_transports: Arc<AtomicBool>,
}

impl FlakyEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` spawns fail with `EngineError::WorkerSpawn`.
    pub fn fail_next_spawns(&self, count: usize) {
        self.fail_spawns_after(0, count);
    }

    /// Let `successes` spawns through, then fail the following `count`.
    pub fn fail_spawns_after(&self, successes: usize, count: usize) {
        self.successes_left.store(successes, Ordering::SeqCst);
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Make every later `create_webrtc_transport` call hang forever.
    pub fn stall_transport_creation(&self) {
        self.stall_transports.store(true, Ordering::SeqCst);
    }

    /// Let new transport creations through. Calls already stalled stay pending.
    pub fn resume_transport_creation(&self) {
        self.stall_transports.store(false, Ordering::SeqCst);
    }

    /// Number of `create_worker` calls so far, failed ones included.
    #[must_use]
    pub fn spawn_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Workers that were actually spawned.
    #[must_use]
    pub fn spawned_workers(&self) -> Vec<Arc<LocalWorker>> {
        self.inner.spawned_workers()
    }

    fn take_failure(&self) -> bool {
        let passed = self
            .successes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if passed {
            return false;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MediaEngine for FlakyEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn Worker>, EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(EngineError::WorkerSpawn("injected failure".to_string()));
        }
        let worker = self.inner.create_worker(settings).await?;
        Ok(Arc::new(FlakyWorker {
            inner: worker,
            stall_transports: Arc::clone(&self.stall_transports),
        }))
    }
}

struct FlakyWorker {
    inner: Arc<dyn Worker>,
    stall_transports: Arc<AtomicBool>,
}

#[async_trait]
impl Worker for FlakyWorker {
    fn pid(&self) -> u32 {
        self.inner.pid()
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError> {
        let router = self.inner.create_router(codecs).await?;
        Ok(Arc::new(FlakyRouter {
            inner: router,
            stall_transports: Arc::clone(&self.stall_transports),
        }))
    }

    async fn resource_usage(&self) -> Result<Value, EngineError> {
        self.inner.resource_usage().await
    }

    async fn died(&self) {
        self.inner.died().await;
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct FlakyRouter {
    inner: Arc<dyn Router>,
    stall_transports: Arc<AtomicBool>,
}

#[async_trait]
impl Router for FlakyRouter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if self.stall_transports.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.create_webrtc_transport(options).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signaling_server::engine::{ListenIp, WorkerLogLevel};
    use signaling_server::media::supported_codecs;
    use std::time::Duration;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            log_level: WorkerLogLevel::None,
            rtc_min_port: 47000,
            rtc_max_port: 47010,
        }
    }

    #[tokio::test]
    async fn test_fails_requested_number_of_spawns() {
        let engine = FlakyEngine::new();
        engine.fail_next_spawns(2);

        assert!(engine.create_worker(&settings()).await.is_err());
        assert!(engine.create_worker(&settings()).await.is_err());
        assert!(engine.create_worker(&settings()).await.is_ok());

        assert_eq!(engine.spawn_attempts(), 3);
        assert_eq!(engine.spawned_workers().len(), 1);
    }

    #[tokio::test]
    async fn test_fails_after_successes() {
        let engine = FlakyEngine::new();
        engine.fail_spawns_after(1, 1);

        assert!(engine.create_worker(&settings()).await.is_ok());
        assert!(engine.create_worker(&settings()).await.is_err());
        assert!(engine.create_worker(&settings()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_transport_creation_never_resolves() {
        let engine = FlakyEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = worker.create_router(&supported_codecs()).await.unwrap();
        let options = TransportOptions {
            listen_ips: vec![ListenIp {
                ip: "127.0.0.1".to_string(),
                announced_ip: None,
            }],
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: true,
            max_incoming_bitrate: None,
            max_outgoing_bitrate: None,
        };

        engine.stall_transport_creation();
        let stalled =
            tokio::time::timeout(Duration::from_millis(50), router.create_webrtc_transport(&options))
                .await;
        assert!(stalled.is_err());

        engine.resume_transport_creation();
        assert!(router.create_webrtc_transport(&options).await.is_ok());
    }
}
