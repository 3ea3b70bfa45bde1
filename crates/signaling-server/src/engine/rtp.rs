//! RTP capability and parameter types exchanged with clients and the engine.
//!
//! Only the fields the control plane inspects are typed. Everything else the
//! client or engine attaches (header extensions, RTCP feedback, encodings) is
//! carried through untouched in the flattened `extra` maps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as a string for log fields and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One codec a router supports or a client can decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RtpCodecCapability {
    /// Build a codec capability with no parameters.
    #[must_use]
    pub fn new(kind: MediaKind, mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            preferred_payload_type: None,
            clock_rate,
            channels: None,
            parameters: Map::new(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }
}

/// The set of codecs a router offers or a client can receive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Whether these capabilities list a codec with the given mime type.
    ///
    /// Mime types compare case-insensitively (`video/H264` == `video/h264`).
    #[must_use]
    pub fn supports_mime_type(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|codec| codec.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// Codec entry inside a producer's or consumer's RTP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// RTP parameters describing one media stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RtpParameters {
    /// Mime types of every codec in these parameters.
    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.codecs.iter().map(|codec| codec.mime_type.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_value(MediaKind::Video).unwrap(), json!("video"));
        let kind: MediaKind = serde_json::from_value(json!("audio")).unwrap();
        assert_eq!(kind, MediaKind::Audio);
    }

    #[test]
    fn test_capabilities_mime_type_match_is_case_insensitive() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability::new(MediaKind::Video, "video/H264", 90000)],
            header_extensions: Vec::new(),
        };

        assert!(caps.supports_mime_type("video/h264"));
        assert!(!caps.supports_mime_type("video/VP8"));
    }

    #[test]
    fn test_rtp_parameters_keep_unknown_fields() {
        let raw = json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000,
                "rtcpFeedback": [{"type": "nack"}]
            }],
            "encodings": [{"ssrc": 1111}],
            "rtcp": {"cname": "abc"}
        });

        let params: RtpParameters = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(params.mime_types().collect::<Vec<_>>(), vec!["video/VP8"]);
        assert!(params.extra.contains_key("encodings"));

        // Pass-through: serializing back yields the original document
        assert_eq!(serde_json::to_value(&params).unwrap(), raw);
    }
}
