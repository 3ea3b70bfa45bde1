//! Codecs offered by every room router.

use crate::engine::{MediaKind, RtpCodecCapability};

/// Start bitrate hint (kbps) applied to every video codec.
const VIDEO_START_BITRATE_KBPS: u32 = 1000;

/// The fixed codec set: Opus audio plus VP8, VP9 and two H.264 profiles.
#[must_use]
pub fn supported_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::new(MediaKind::Audio, "audio/opus", 48000).with_channels(2),
        video("video/VP8"),
        video("video/VP9").with_parameter("profile-id", 2),
        video("video/h264")
            .with_parameter("packetization-mode", 1)
            .with_parameter("profile-level-id", "4d0032")
            .with_parameter("level-asymmetry-allowed", 1),
        video("video/h264")
            .with_parameter("packetization-mode", 1)
            .with_parameter("profile-level-id", "42e01f")
            .with_parameter("level-asymmetry-allowed", 1),
    ]
}

fn video(mime_type: &str) -> RtpCodecCapability {
    RtpCodecCapability::new(MediaKind::Video, mime_type, 90000)
        .with_parameter("x-google-start-bitrate", VIDEO_START_BITRATE_KBPS)
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_set() {
        let codecs = supported_codecs();
        assert_eq!(codecs.len(), 5);

        let audio: Vec<_> = codecs
            .iter()
            .filter(|c| c.kind == MediaKind::Audio)
            .collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].channels, Some(2));
        assert_eq!(audio[0].clock_rate, 48000);
    }

    #[test]
    fn test_video_codecs_carry_start_bitrate() {
        for codec in supported_codecs()
            .iter()
            .filter(|c| c.kind == MediaKind::Video)
        {
            assert_eq!(
                codec.parameters.get("x-google-start-bitrate"),
                Some(&serde_json::json!(1000)),
                "{} should carry a start bitrate",
                codec.mime_type
            );
        }
    }

    #[test]
    fn test_h264_profiles() {
        let profiles: Vec<_> = supported_codecs()
            .into_iter()
            .filter(|c| c.mime_type == "video/h264")
            .filter_map(|c| c.parameters.get("profile-level-id").cloned())
            .collect();
        assert_eq!(
            profiles,
            vec![serde_json::json!("4d0032"), serde_json::json!("42e01f")]
        );
    }
}
