//! Signaling server configuration.
//!
//! Configuration is loaded from environment variables with defaults for
//! everything. Values that parse but make no sense (zero workers, inverted
//! port range) are rejected at startup.

use crate::engine::{ListenIp, TransportOptions, WorkerLogLevel, WorkerSettings};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for signaling, status API and health endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default number of media workers.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default media worker log level.
pub const DEFAULT_MEDIA_LOG_LEVEL: WorkerLogLevel = WorkerLogLevel::Warn;

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default transport listen address.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default address advertised in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default peer limit per room.
pub const DEFAULT_MAX_PEERS: usize = 20;

/// Default delay before an empty room is destroyed.
pub const DEFAULT_ROOM_CLOSE_GRACE_SECONDS: u64 = 30;

/// Default transport bitrate caps (bits per second).
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;
pub const DEFAULT_MAX_OUTGOING_BITRATE: u32 = 600_000;

/// Signaling server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address (default: "0.0.0.0:3000").
    pub bind_address: SocketAddr,

    /// Number of media workers spawned at startup.
    pub worker_count: usize,

    /// Media worker log level.
    pub media_log_level: WorkerLogLevel,

    /// Inclusive RTC port range handed to each worker.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Local IP transports listen on.
    pub listen_ip: String,

    /// Public IP advertised to clients in ICE candidates.
    pub announced_ip: String,

    /// Maximum peers per room.
    pub max_peers: usize,

    /// Grace delay before an emptied room is destroyed.
    pub room_close_grace: Duration,

    pub max_incoming_bitrate: u32,
    pub max_outgoing_bitrate: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 3000)),
            worker_count: DEFAULT_WORKER_COUNT,
            media_log_level: DEFAULT_MEDIA_LOG_LEVEL,
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            listen_ip: DEFAULT_LISTEN_IP.to_string(),
            announced_ip: DEFAULT_ANNOUNCED_IP.to_string(),
            max_peers: DEFAULT_MAX_PEERS,
            room_close_grace: Duration::from_secs(DEFAULT_ROOM_CLOSE_GRACE_SECONDS),
            max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
            max_outgoing_bitrate: DEFAULT_MAX_OUTGOING_BITRATE,
        }
    }
}

/// Parse an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_raw = vars
            .get("SFU_BIND_ADDRESS")
            .map_or(DEFAULT_BIND_ADDRESS, String::as_str);
        let bind_address: SocketAddr = bind_raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("SFU_BIND_ADDRESS={bind_raw}")))?;

        let worker_count = parse_var(vars, "SFU_WORKER_COUNT", DEFAULT_WORKER_COUNT)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        let media_log_level = match vars.get("SFU_MEDIA_LOG_LEVEL") {
            Some(raw) => WorkerLogLevel::parse(raw.trim()).ok_or_else(|| {
                ConfigError::InvalidValue(format!("SFU_MEDIA_LOG_LEVEL={raw}"))
            })?,
            None => DEFAULT_MEDIA_LOG_LEVEL,
        };

        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) exceeds SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = vars
            .get("SFU_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_IP.to_string());

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCED_IP.to_string());

        let max_peers = parse_var(vars, "SFU_MAX_PEERS", DEFAULT_MAX_PEERS)?;
        if max_peers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_MAX_PEERS must be at least 1".to_string(),
            ));
        }

        let room_close_grace_seconds = parse_var(
            vars,
            "SFU_ROOM_CLOSE_GRACE_SECONDS",
            DEFAULT_ROOM_CLOSE_GRACE_SECONDS,
        )?;

        let max_incoming_bitrate =
            parse_var(vars, "SFU_MAX_INCOMING_BITRATE", DEFAULT_MAX_INCOMING_BITRATE)?;
        let max_outgoing_bitrate =
            parse_var(vars, "SFU_MAX_OUTGOING_BITRATE", DEFAULT_MAX_OUTGOING_BITRATE)?;

        Ok(Config {
            bind_address,
            worker_count,
            media_log_level,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            max_peers,
            room_close_grace: Duration::from_secs(room_close_grace_seconds),
            max_incoming_bitrate,
            max_outgoing_bitrate,
        })
    }

    /// Settings for spawning media workers.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            log_level: self.media_log_level,
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    /// Transport policy applied to every WebRTC transport.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ips: vec![ListenIp {
                ip: self.listen_ip.clone(),
                announced_ip: Some(self.announced_ip.clone()),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            max_incoming_bitrate: Some(self.max_incoming_bitrate),
            max_outgoing_bitrate: Some(self.max_outgoing_bitrate),
        }
    }
}
