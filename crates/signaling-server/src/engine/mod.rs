//! Media engine capability interface.
//!
//! The control plane never touches media packets. Everything below a router
//! (ICE, DTLS, RTP forwarding) belongs to the engine, which is consumed only
//! through these traits:
//!
//! ```text
//! MediaEngine ──create_worker──▶ Worker ──create_router──▶ Router
//!                                                         │
//!                          create_webrtc_transport ◀──────┘
//!                                   │
//!                               Transport ──produce──▶ Producer
//!                                   └──────consume──▶ Consumer
//! ```
//!
//! ICE/DTLS parameters are opaque JSON produced by the engine and handed to
//! clients unmodified.
//!
//! Closed notifications are observed through `closed()`: the engine closes
//! a consumer when its producer closes, and closes every producer/consumer of
//! a transport when the transport closes.

pub mod local;
pub mod rtp;

pub use local::{LocalEngine, LocalWorker};
pub use rtp::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the media engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Worker process could not be spawned.
    #[error("Worker spawn failed: {0}")]
    WorkerSpawn(String),

    /// Operation on a worker that has died or been closed.
    #[error("Worker closed")]
    WorkerClosed,

    /// Operation on a router that has been closed.
    #[error("Router closed")]
    RouterClosed,

    /// Operation on a transport that has been closed.
    #[error("Transport closed")]
    TransportClosed,

    /// Producer is unknown to the router or already closed.
    #[error("Producer {0} not found")]
    ProducerNotFound(String),

    /// Consumer capabilities cannot decode the producer.
    #[error("Cannot consume producer {0}")]
    CannotConsume(String),

    /// No RTC port left in the configured range.
    #[error("No free RTC port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    /// Engine rejected the request.
    #[error("Engine rejected request: {0}")]
    Rejected(String),
}

/// Worker log verbosity passed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl WorkerLogLevel {
    /// Parse a log level name (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Settings for spawning one worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub log_level: WorkerLogLevel,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Listen address for a WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: String,
    pub announced_ip: Option<String>,
}

/// Network and bitrate policy applied to every WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub max_incoming_bitrate: Option<u32>,
    pub max_outgoing_bitrate: Option<u32>,
}

/// Entry point into the engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Spawn a new worker process.
    async fn create_worker(&self, settings: &WorkerSettings)
        -> Result<Arc<dyn Worker>, EngineError>;
}

/// One engine worker process.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Operating-system process id of the worker.
    fn pid(&self) -> u32;

    fn closed(&self) -> bool;

    /// Create a routing context offering the given codecs.
    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError>;

    /// Engine-reported resource usage.
    async fn resource_usage(&self) -> Result<Value, EngineError>;

    /// Resolves when the worker process dies unexpectedly.
    ///
    /// Does not resolve for a worker closed through [`Worker::close`].
    async fn died(&self);

    async fn close(&self);
}

/// Per-room routing context.
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> &str;

    fn closed(&self) -> bool;

    /// Codecs offered to clients joining the room.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    /// Close the router and every transport created on it.
    async fn close(&self);
}

/// Directional media path for one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    fn closed(&self) -> bool;

    fn ice_parameters(&self) -> Value;

    fn ice_candidates(&self) -> Value;

    fn dtls_parameters(&self) -> Value;

    /// Apply the remote DTLS parameters supplied by the client.
    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    async fn stats(&self) -> Result<Vec<Value>, EngineError>;

    async fn close(&self);
}

/// Outbound media stream published by a peer.
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn paused(&self) -> bool;

    fn closed(&self) -> bool;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn stats(&self) -> Result<Vec<Value>, EngineError>;

    async fn close(&self);
}

/// Inbound media stream delivered to a peer from a remote producer.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    fn closed(&self) -> bool;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn stats(&self) -> Result<Vec<Value>, EngineError>;

    async fn close(&self);
}
