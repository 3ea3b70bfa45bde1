//! In-process implementation of the media engine interface.
//!
//! `LocalEngine` runs the full control-plane contract without native worker
//! processes: it allocates RTC ports, generates ICE/DTLS credentials, enforces
//! codec compatibility and tracks paused/closed state, but never moves media.
//! It backs the default binary and every end-to-end test.
//!
//! Closure cascades the way a native engine does:
//! worker → routers → transports → producers/consumers, and producer → consumers.

use super::{
    Consumer, EngineError, MediaEngine, MediaKind, Producer, Router, RtpCapabilities,
    RtpCodecCapability, RtpParameters, Transport, TransportOptions, Worker, WorkerSettings,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// First dynamic payload type assigned to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// ICE candidate priorities (host candidates, UDP preferred over TCP).
const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resources held by a transport or producer. Members remove themselves on close.
type Owned<T> = Arc<Mutex<Vec<Arc<T>>>>;

fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// In-process media engine.
#[derive(Debug, Default)]
pub struct LocalEngine {
    /// Every worker spawned so far, in spawn order.
    workers: Mutex<Vec<Arc<LocalWorker>>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers spawned by this engine, in spawn order (including dead ones).
    #[must_use]
    pub fn spawned_workers(&self) -> Vec<Arc<LocalWorker>> {
        lock(&self.workers).clone()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn Worker>, EngineError> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::WorkerSpawn(format!(
                "invalid RTC port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let worker = Arc::new(LocalWorker::new(settings.clone()));
        lock(&self.workers).push(Arc::clone(&worker));

        debug!(
            target: "sfu.engine",
            pid = worker.pid,
            log_level = %settings.log_level,
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "Local worker spawned"
        );

        Ok(worker)
    }
}

// ----------------------------------------------------------------------------
// Ports
// ----------------------------------------------------------------------------

/// RTC port allocator over an inclusive range.
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    max: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocate(&self) -> Result<u16, EngineError> {
        let mut in_use = lock(&self.in_use);
        let port = (self.min..=self.max)
            .find(|port| !in_use.contains(port))
            .ok_or(EngineError::PortsExhausted {
                min: self.min,
                max: self.max,
            })?;
        in_use.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        lock(&self.in_use).remove(&port);
    }

    fn allocated(&self) -> usize {
        lock(&self.in_use).len()
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

/// In-process worker.
#[derive(Debug)]
pub struct LocalWorker {
    pid: u32,
    ports: Arc<PortAllocator>,
    routers: Mutex<Vec<Arc<LocalRouter>>>,
    closed: AtomicBool,
    death: CancellationToken,
}

impl LocalWorker {
    fn new(settings: WorkerSettings) -> Self {
        Self {
            pid: std::process::id(),
            ports: Arc::new(PortAllocator::new(
                settings.rtc_min_port,
                settings.rtc_max_port,
            )),
            routers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            death: CancellationToken::new(),
        }
    }

    /// Simulate an unexpected worker process death.
    ///
    /// Closes every router the worker owns and fires the `died` notification.
    pub fn crash(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(target: "sfu.engine", pid = self.pid, "Local worker crashed");
        self.close_routers();
        self.death.cancel();
    }

    fn close_routers(&self) {
        let routers = std::mem::take(&mut *lock(&self.routers));
        for router in routers {
            router.close_now();
        }
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError> {
        if self.closed() {
            return Err(EngineError::WorkerClosed);
        }
        if codecs.is_empty() {
            return Err(EngineError::Rejected("router needs at least one codec".to_string()));
        }

        let router = Arc::new(LocalRouter::new(codecs, Arc::clone(&self.ports)));
        let mut routers = lock(&self.routers);
        routers.retain(|r| !r.closed());
        routers.push(Arc::clone(&router));
        Ok(router)
    }

    async fn resource_usage(&self) -> Result<Value, EngineError> {
        if self.closed() {
            return Err(EngineError::WorkerClosed);
        }

        let routers = lock(&self.routers).clone();
        let mut transports = 0;
        let mut producers = 0;
        let mut consumers = 0;
        for router in routers.iter().filter(|r| !r.closed()) {
            let (t, p, c) = router.inner.counts();
            transports += t;
            producers += p;
            consumers += c;
        }

        Ok(json!({
            "routers": routers.iter().filter(|r| !r.closed()).count(),
            "transports": transports,
            "producers": producers,
            "consumers": consumers,
            "portsInUse": self.ports.allocated(),
        }))
    }

    async fn died(&self) {
        self.death.cancelled().await;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_routers();
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

/// State shared between a router and the transports created on it.
#[derive(Debug)]
struct RouterInner {
    closed: AtomicBool,
    ports: Arc<PortAllocator>,
    producers: Mutex<HashMap<String, Arc<LocalProducer>>>,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
}

impl RouterInner {
    fn counts(&self) -> (usize, usize, usize) {
        let transports = lock(&self.transports).clone();
        let open: Vec<_> = transports.iter().filter(|t| !t.closed()).collect();
        let producers = open.iter().map(|t| t.open_producers()).sum();
        let consumers = open.iter().map(|t| t.open_consumers()).sum();
        (open.len(), producers, consumers)
    }
}

/// In-process routing context.
#[derive(Debug)]
pub struct LocalRouter {
    id: String,
    capabilities: RtpCapabilities,
    inner: Arc<RouterInner>,
}

impl LocalRouter {
    fn new(codecs: &[RtpCodecCapability], ports: Arc<PortAllocator>) -> Self {
        let codecs = codecs
            .iter()
            .zip(FIRST_DYNAMIC_PAYLOAD_TYPE..)
            .map(|(codec, payload_type)| {
                let mut codec = codec.clone();
                codec.preferred_payload_type = Some(payload_type);
                codec
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: Vec::new(),
            },
            inner: Arc::new(RouterInner {
                closed: AtomicBool::new(false),
                ports,
                producers: Mutex::new(HashMap::new()),
                transports: Mutex::new(Vec::new()),
            }),
        }
    }

    fn close_now(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports = std::mem::take(&mut *lock(&self.inner.transports));
        for transport in transports {
            transport.close_now();
        }
    }
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        let producer = lock(&self.inner.producers).get(producer_id).cloned();
        match producer {
            Some(producer) if !producer.closed() => producer
                .rtp_parameters
                .mime_types()
                .any(|mime| capabilities.supports_mime_type(mime)),
            _ => false,
        }
    }

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if self.closed() {
            return Err(EngineError::RouterClosed);
        }
        let listen = options
            .listen_ips
            .first()
            .ok_or_else(|| EngineError::Rejected("no listen IP configured".to_string()))?;
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Rejected(
                "transport needs UDP or TCP enabled".to_string(),
            ));
        }

        let port = self.inner.ports.allocate()?;
        let address = listen
            .announced_ip
            .clone()
            .unwrap_or_else(|| listen.ip.clone());

        let transport = Arc::new(LocalTransport::new(
            port,
            &address,
            options,
            Arc::clone(&self.inner),
        ));
        lock(&self.inner.transports).push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn close(&self) {
        self.close_now();
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// In-process WebRTC transport.
#[derive(Debug)]
pub struct LocalTransport {
    id: String,
    port: u16,
    ice_parameters: Value,
    ice_candidates: Value,
    dtls_parameters: Value,
    remote_dtls: Mutex<Option<Value>>,
    router: Arc<RouterInner>,
    producers: Owned<LocalProducer>,
    consumers: Owned<LocalConsumer>,
    next_mid: AtomicU32,
    closed: AtomicBool,
}

impl LocalTransport {
    fn new(port: u16, address: &str, options: &TransportOptions, router: Arc<RouterInner>) -> Self {
        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": UDP_CANDIDATE_PRIORITY,
                "ip": address,
                "address": address,
                "protocol": "udp",
                "port": port,
                "type": "host",
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": TCP_CANDIDATE_PRIORITY,
                "ip": address,
                "address": address,
                "protocol": "tcp",
                "port": port,
                "type": "host",
                "tcpType": "passive",
            }));
        }
        if options.prefer_udp {
            candidates.sort_by_key(|c| c.get("protocol").and_then(Value::as_str) != Some("udp"));
        }

        let ufrag = Uuid::new_v4().simple().to_string();
        let password = Uuid::new_v4().simple().to_string();

        Self {
            id: Uuid::new_v4().to_string(),
            port,
            ice_parameters: json!({
                "usernameFragment": ufrag.get(..16).unwrap_or(&ufrag),
                "password": password,
                "iceLite": true,
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint() }],
            }),
            remote_dtls: Mutex::new(None),
            router,
            producers: Owned::default(),
            consumers: Owned::default(),
            next_mid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers {
            consumer.close_now();
        }
        let producers = std::mem::take(&mut *lock(&self.producers));
        for producer in producers {
            producer.close_now();
        }
        lock(&self.router.transports).retain(|t| t.id != self.id);
        self.router.ports.release(self.port);
    }

    fn open_producers(&self) -> usize {
        lock(&self.producers).iter().filter(|p| !p.closed()).count()
    }

    fn open_consumers(&self) -> usize {
        lock(&self.consumers).iter().filter(|c| !c.closed()).count()
    }
}

/// Random SHA-256-shaped DTLS fingerprint (`AB:CD:...`, 32 bytes).
fn fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ice_parameters(&self) -> Value {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Value {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> Value {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::TransportClosed);
        }
        if !dtls_parameters.is_object() {
            return Err(EngineError::Rejected(
                "DTLS parameters must be an object".to_string(),
            ));
        }

        let mut remote = lock(&self.remote_dtls);
        if remote.is_some() {
            return Err(EngineError::Rejected("transport already connected".to_string()));
        }
        *remote = Some(dtls_parameters);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        if self.closed() {
            return Err(EngineError::TransportClosed);
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Rejected("RTP parameters carry no codecs".to_string()));
        }

        let producer = Arc::new(LocalProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consumers: Owned::default(),
            router: Arc::downgrade(&self.router),
            transport: Arc::downgrade(&self.producers),
        });

        lock(&self.router.producers).insert(producer.id.clone(), Arc::clone(&producer));
        lock(&self.producers).push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        if self.closed() {
            return Err(EngineError::TransportClosed);
        }

        let producer = lock(&self.router.producers)
            .get(producer_id)
            .cloned()
            .filter(|p| !p.closed())
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;

        let codecs: Vec<_> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| rtp_capabilities.supports_mime_type(&codec.mime_type))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::CannotConsume(producer_id.to_string()));
        }

        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        let consumer = Arc::new(LocalConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid.to_string()),
                codecs,
                extra: producer.rtp_parameters.extra.clone(),
            },
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            owners: [
                Arc::downgrade(&self.consumers),
                Arc::downgrade(&producer.consumers),
            ],
        });

        lock(&producer.consumers).push(Arc::clone(&consumer));
        lock(&self.consumers).push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn stats(&self) -> Result<Vec<Value>, EngineError> {
        if self.closed() {
            return Err(EngineError::TransportClosed);
        }
        let dtls_state = if lock(&self.remote_dtls).is_some() {
            "connected"
        } else {
            "new"
        };

        Ok(vec![json!({
            "type": "webrtc-transport",
            "transportId": self.id,
            "timestamp": timestamp_ms(),
            "iceState": "new",
            "dtlsState": dtls_state,
            "bytesReceived": 0,
            "bytesSent": 0,
        })])
    }

    async fn close(&self) {
        self.close_now();
    }
}

// ----------------------------------------------------------------------------
// Producer / Consumer
// ----------------------------------------------------------------------------

/// In-process producer.
#[derive(Debug)]
pub struct LocalProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    consumers: Owned<LocalConsumer>,
    router: Weak<RouterInner>,
    /// Producer list of the transport it was created on.
    transport: Weak<Mutex<Vec<Arc<LocalProducer>>>>,
}

impl LocalProducer {
    fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers {
            consumer.close_now();
        }
        if let Some(router) = self.router.upgrade() {
            lock(&router.producers).remove(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            lock(&transport).retain(|p| p.id != self.id);
        }
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::ProducerNotFound(self.id.clone()));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::ProducerNotFound(self.id.clone()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<Value>, EngineError> {
        Ok(vec![json!({
            "type": "inbound-rtp",
            "producerId": self.id,
            "kind": self.kind,
            "timestamp": timestamp_ms(),
            "mimeType": self.rtp_parameters.mime_types().next(),
            "paused": self.paused(),
            "byteCount": 0,
            "packetCount": 0,
        })])
    }

    async fn close(&self) {
        self.close_now();
    }
}

/// In-process consumer.
#[derive(Debug)]
pub struct LocalConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    /// Consumer lists of its transport and of its producer.
    owners: [Weak<Mutex<Vec<Arc<LocalConsumer>>>>; 2],
}

impl LocalConsumer {
    fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for owner in &self.owners {
            if let Some(list) = owner.upgrade() {
                lock(&list).retain(|c| c.id != self.id);
            }
        }
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Rejected(format!("consumer {} is closed", self.id)));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Rejected(format!("consumer {} is closed", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<Value>, EngineError> {
        Ok(vec![json!({
            "type": "outbound-rtp",
            "consumerId": self.id,
            "producerId": self.producer_id,
            "kind": self.kind,
            "timestamp": timestamp_ms(),
            "paused": self.paused(),
            "byteCount": 0,
            "packetCount": 0,
        })])
    }

    async fn close(&self) {
        self.close_now();
    }
}
