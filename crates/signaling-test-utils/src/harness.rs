//! In-process SFU harness.
//!
//! `TestSfu` wires a worker pool, room registry and signaling dispatcher over a
//! `FlakyEngine`, the same way the binary does. `TestClient` drives the
//! dispatcher with JSON frames exactly as the WebSocket loop would, without a
//! socket in between.
//!
//! # Example
//!
//! ```rust,ignore
//! let sfu = TestSfu::builder().max_peers(2).build().await;
//! let mut alice = sfu.client();
//! alice.join("standup", &TestPeer::new("alice")).await;
//! let producer_id = alice.publish(MediaKind::Video).await;
//! ```

use crate::fixtures::{parameters_for, TestPeer};
use crate::flaky_engine::FlakyEngine;

use serde_json::{json, Value};
use signaling_server::actors::{
    ActorMetrics, RegistrySettings, RoomEvent, RoomRegistryHandle, WorkerPoolHandle,
};
use signaling_server::engine::{
    ListenIp, MediaEngine, MediaKind, RtpCapabilities, TransportOptions, WorkerLogLevel, WorkerSettings,
};
use signaling_server::signaling::{Response, Session, SignalingDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long `TestClient::next_event` waits before giving up.
const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Builder for [`TestSfu`].
#[derive(Debug, Clone)]
pub struct TestSfuBuilder {
    workers: usize,
    max_peers: usize,
    close_grace: Duration,
    rtc_min_port: u16,
}

impl Default for TestSfuBuilder {
    fn default() -> Self {
        Self {
            workers: 1,
            max_peers: 20,
            close_grace: Duration::from_secs(30),
            rtc_min_port: 48000,
        }
    }
}

impl TestSfuBuilder {
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    #[must_use]
    pub fn close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    /// Build on a fresh `FlakyEngine`.
    pub async fn build(self) -> TestSfu {
        self.build_with_engine(Arc::new(FlakyEngine::new())).await
    }

    /// Build on the given engine. Panics if the pool cannot start.
    pub async fn build_with_engine(self, engine: Arc<FlakyEngine>) -> TestSfu {
        let token = CancellationToken::new();
        let metrics = ActorMetrics::new();

        let media_engine: Arc<dyn MediaEngine> = engine.clone();
        let (pool, _pool_task) = WorkerPoolHandle::initialize(
            media_engine,
            self.workers,
            WorkerSettings {
                log_level: WorkerLogLevel::None,
                rtc_min_port: self.rtc_min_port,
                rtc_max_port: self.rtc_min_port + 999,
            },
            token.child_token(),
            Arc::clone(&metrics),
        )
        .await
        .expect("worker pool should start");

        let (registry, _registry_task) = RoomRegistryHandle::spawn(
            pool.clone(),
            RegistrySettings {
                max_peers: self.max_peers,
                close_grace: self.close_grace,
                transport_options: TransportOptions {
                    listen_ips: vec![ListenIp {
                        ip: "127.0.0.1".to_string(),
                        announced_ip: None,
                    }],
                    enable_udp: true,
                    enable_tcp: true,
                    prefer_udp: true,
                    max_incoming_bitrate: None,
                    max_outgoing_bitrate: None,
                },
            },
            token.child_token(),
            Arc::clone(&metrics),
        );

        TestSfu {
            dispatcher: Arc::new(SignalingDispatcher::new(registry.clone())),
            engine,
            pool,
            registry,
            metrics,
            token,
        }
    }
}

/// A running pool + registry + dispatcher.
pub struct TestSfu {
    pub engine: Arc<FlakyEngine>,
    pub pool: WorkerPoolHandle,
    pub registry: RoomRegistryHandle,
    pub dispatcher: Arc<SignalingDispatcher>,
    pub metrics: Arc<ActorMetrics>,
    pub token: CancellationToken,
}

impl TestSfu {
    #[must_use]
    pub fn builder() -> TestSfuBuilder {
        TestSfuBuilder::default()
    }

    /// A new, not yet joined, client connection.
    #[must_use]
    pub fn client(&self) -> TestClient {
        let (session, events) = Session::new();
        TestClient {
            dispatcher: Arc::clone(&self.dispatcher),
            session,
            events,
            next_id: 1,
            send_transport: None,
            recv_transport: None,
        }
    }
}

impl Drop for TestSfu {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// One simulated signaling connection.
pub struct TestClient {
    dispatcher: Arc<SignalingDispatcher>,
    session: Session,
    events: mpsc::Receiver<RoomEvent>,
    next_id: u64,
    send_transport: Option<String>,
    recv_transport: Option<String>,
}

impl TestClient {
    #[must_use]
    pub fn peer_id(&self) -> &str {
        self.session.peer_id()
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.session.room_id()
    }

    /// Send a request frame and return the reply.
    pub async fn request(&mut self, method: &str, data: Value) -> Response {
        let id = self.next_id;
        self.next_id += 1;

        let frame = json!({"id": id, "method": method, "data": data}).to_string();
        let response = self.dispatcher.handle_frame(&mut self.session, &frame).await;
        assert_eq!(response.id, id, "reply must carry the request id");
        response
    }

    /// Send a request and return its data, panicking on failure.
    pub async fn expect_ok(&mut self, method: &str, data: Value) -> Value {
        let response = self.request(method, data).await;
        assert!(
            response.success,
            "{method} failed: {:?}",
            response.error
        );
        response.data.unwrap_or(Value::Null)
    }

    /// Send a request and return the error kind, panicking on success.
    pub async fn expect_err(&mut self, method: &str, data: Value) -> String {
        let response = self.request(method, data).await;
        assert!(!response.success, "{method} unexpectedly succeeded");
        let error = response.error.expect("failed reply carries an error");
        error.kind.as_str().to_string()
    }

    pub async fn join(&mut self, room_id: &str, peer: &TestPeer) -> Value {
        self.expect_ok(
            "join-room",
            json!({"roomId": room_id, "peerInfo": peer.to_json()}),
        )
        .await
    }

    pub async fn leave(&mut self) {
        self.expect_ok("leave-room", json!({})).await;
        self.send_transport = None;
        self.recv_transport = None;
    }

    /// Create and connect a transport. Returns its id.
    pub async fn open_transport(&mut self, direction: &str) -> String {
        let data = self
            .expect_ok("create-transport", json!({"direction": direction}))
            .await;
        let id = data["id"].as_str().expect("transport id").to_string();

        self.expect_ok(
            "connect-transport",
            json!({"transportId": id, "dtlsParameters": {"role": "client", "fingerprints": []}}),
        )
        .await;
        id
    }

    async fn send_transport(&mut self) -> String {
        if let Some(id) = &self.send_transport {
            return id.clone();
        }
        let id = self.open_transport("send").await;
        self.send_transport = Some(id.clone());
        id
    }

    async fn recv_transport(&mut self) -> String {
        if let Some(id) = &self.recv_transport {
            return id.clone();
        }
        let id = self.open_transport("recv").await;
        self.recv_transport = Some(id.clone());
        id
    }

    /// Publish a track of the given kind. Returns the producer id.
    pub async fn publish(&mut self, kind: MediaKind) -> String {
        let transport_id = self.send_transport().await;
        let data = self
            .expect_ok(
                "produce",
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": parameters_for(kind),
                }),
            )
            .await;
        data["id"].as_str().expect("producer id").to_string()
    }

    /// Request a consumer for a remote producer on this client's recv transport.
    pub async fn consume(&mut self, producer_id: &str, capabilities: &RtpCapabilities) -> Response {
        let transport_id = self.recv_transport().await;
        self.request(
            "consume",
            json!({
                "transportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": capabilities,
            }),
        )
        .await
    }

    /// Wait for the next pushed event, as the WebSocket loop would deliver it.
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .ok()
            .flatten()?;
        self.dispatcher.on_event(&mut self.session, &event);
        Some(event)
    }

    /// Every event already queued for this client.
    pub fn drain_events(&mut self) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            self.dispatcher.on_event(&mut self.session, &event);
            events.push(event);
        }
        events
    }

    /// Drop the connection.
    pub async fn disconnect(mut self) {
        self.dispatcher.disconnect(&mut self.session).await;
    }
}
