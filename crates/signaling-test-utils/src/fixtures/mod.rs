//! Pre-configured test data fixtures for signaling tests.
//!
//! Provides builders and test data for:
//! - Peers and their metadata
//! - RTP parameters for common codecs
//! - Client RTP capabilities

use serde_json::{json, Map, Value};
use signaling_server::engine::{
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
use signaling_server::media::{supported_codecs, PeerInfo};
use uuid::Uuid;

/// Test peer fixture.
#[derive(Debug, Clone)]
pub struct TestPeer {
    pub name: String,
    pub avatar: Option<String>,
}

impl TestPeer {
    /// Create a test peer with the given display name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar: None,
        }
    }

    /// Create a test peer with a random name.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("peer-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            name: Some(self.name.clone()),
            avatar: self.avatar.clone(),
        }
    }

    /// The `peerInfo` object of a `join-room` payload.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.info()).unwrap()
    }
}

fn codec(mime_type: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: mime_type.to_string(),
            payload_type,
            clock_rate,
            channels,
            parameters: Map::new(),
            extra: Map::new(),
        }],
        extra: Map::new(),
    }
}

/// Producer parameters for a VP8 video track.
#[must_use]
pub fn vp8_parameters() -> RtpParameters {
    codec("video/VP8", 101, 90000, None)
}

/// Producer parameters for an H264 video track.
#[must_use]
pub fn h264_parameters() -> RtpParameters {
    let mut parameters = codec("video/H264", 102, 90000, None);
    if let Some(codec) = parameters.codecs.first_mut() {
        codec
            .parameters
            .insert("packetization-mode".to_string(), json!(1));
        codec
            .parameters
            .insert("profile-level-id".to_string(), json!("42e01f"));
    }
    parameters
}

/// Producer parameters for an Opus audio track.
#[must_use]
pub fn opus_parameters() -> RtpParameters {
    codec("audio/opus", 100, 48000, Some(2))
}

/// Producer parameters for the given kind (VP8 for video, Opus for audio).
#[must_use]
pub fn parameters_for(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_parameters(),
        MediaKind::Video => vp8_parameters(),
    }
}

/// Builder for client RTP capabilities.
#[derive(Debug, Default)]
pub struct CapabilitiesBuilder {
    codecs: Vec<RtpCodecCapability>,
}

impl CapabilitiesBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a codec by mime type. Kind and clock rate follow the mime type prefix.
    #[must_use]
    pub fn codec(mut self, mime_type: &str) -> Self {
        let capability = if mime_type.to_ascii_lowercase().starts_with("audio/") {
            RtpCodecCapability::new(MediaKind::Audio, mime_type, 48000).with_channels(2)
        } else {
            RtpCodecCapability::new(MediaKind::Video, mime_type, 90000)
        };
        self.codecs.push(capability);
        self
    }

    #[must_use]
    pub fn build(self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.codecs,
            header_extensions: Vec::new(),
        }
    }
}

/// Capabilities listing exactly the given mime types.
#[must_use]
pub fn capabilities(mime_types: &[&str]) -> RtpCapabilities {
    mime_types
        .iter()
        .fold(CapabilitiesBuilder::new(), |builder, mime| builder.codec(mime))
        .build()
}

/// Capabilities of a client that can receive everything the server offers.
#[must_use]
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: supported_codecs(),
        header_extensions: Vec::new(),
    }
}
