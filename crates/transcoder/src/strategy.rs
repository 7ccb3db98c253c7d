//! Encoding strategy derivation from a probe result (spec.md §4.4 step 3).

use crate::probe::ProbeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoTranscodeTarget {
    Copy,
    H264,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTranscodeTarget {
    Copy,
    AacLc,
}

#[derive(Debug, Clone)]
pub struct EncodingStrategy {
    pub select_video_audio_streams_only: bool,
    pub force_8bit_420: bool,
    /// Degrees to rotate/transpose: one of 0/90/180/270.
    pub rotation_filter_degrees: i32,
    pub fast_start: bool,
    pub video_target: VideoTranscodeTarget,
    pub audio_target: AudioTranscodeTarget,
    pub capped_framerate: Option<f64>,
    /// `true` when duration > 2h: fastest preset + higher CRF.
    pub extreme_duration: bool,
    /// `true` when frame count > 50_000: max threads + ultrafast preset.
    pub massive_frame_count: bool,
    pub passthrough: bool,
}

const HEVC_LIKE: &[&str] = &["hevc", "h265", "vp9", "av1"];
const HE_AAC_LIKE: &[&str] = &["aac_he", "aac_he_v2", "opus", "vorbis", "he-aac", "heaac"];

/// Computes the encoding strategy from a probe, per spec.md §4.4 step 3.
pub fn derive_strategy(probe: &ProbeResult) -> EncodingStrategy {
    let force_8bit_420 = probe.bit_depth > 8;

    let rotation_filter_degrees = match probe.rotation_degrees {
        90 | 180 | 270 => probe.rotation_degrees,
        _ => 0,
    };

    let fast_start = probe.container.contains("mov")
        || probe.container.contains("mp4")
        || probe.container.contains("quicktime");
    let fast_start = fast_start && probe.non_media_stream_count > 0;

    let video_target = match probe.video_codec.as_deref() {
        Some(codec) if HEVC_LIKE.iter().any(|c| codec.eq_ignore_ascii_case(c)) => {
            VideoTranscodeTarget::H264
        }
        _ => VideoTranscodeTarget::Copy,
    };

    let audio_target = match probe.audio_codec.as_deref() {
        Some(codec) if HE_AAC_LIKE.iter().any(|c| codec.eq_ignore_ascii_case(c)) => {
            AudioTranscodeTarget::AacLc
        }
        _ => AudioTranscodeTarget::Copy,
    };

    let capped_framerate = if probe.framerate > 60.0 {
        Some(30.0)
    } else if probe.framerate > 0.0 && probe.framerate < 15.0 {
        Some(15.0)
    } else {
        None
    };

    let extreme_duration = probe.duration_secs > 2.0 * 3600.0;

    let estimated_frame_count = probe.framerate.max(1.0) * probe.duration_secs;
    let massive_frame_count = estimated_frame_count > 50_000.0;

    let overall_kbps = probe.bitrate_bps as f64 / 1000.0;
    let tiny_for_duration = probe.duration_secs > 600.0 && overall_kbps > 0.0 && overall_kbps < 300.0;
    let passthrough =
        probe.bits_per_pixel() < 0.1 || overall_kbps < 500.0 || tiny_for_duration;

    EncodingStrategy {
        select_video_audio_streams_only: probe.non_media_stream_count > 0,
        force_8bit_420,
        rotation_filter_degrees,
        fast_start,
        video_target,
        audio_target,
        capped_framerate,
        extreme_duration,
        massive_frame_count,
        passthrough,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_probe() -> ProbeResult {
        ProbeResult {
            container: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            pixel_format: Some("yuv420p".to_string()),
            bit_depth: 8,
            hdr_transfer: None,
            rotation_degrees: 0,
            width: 1920,
            height: 1080,
            framerate: 30.0,
            duration_secs: 120.0,
            bitrate_bps: 4_000_000,
            non_media_stream_count: 0,
            issues: Vec::new(),
        }
    }

    #[test]
    fn forces_h264_for_hevc() {
        let mut probe = base_probe();
        probe.video_codec = Some("hevc".to_string());
        let strategy = derive_strategy(&probe);
        assert_eq!(strategy.video_target, VideoTranscodeTarget::H264);
    }

    #[test]
    fn forces_aac_for_opus() {
        let mut probe = base_probe();
        probe.audio_codec = Some("opus".to_string());
        let strategy = derive_strategy(&probe);
        assert_eq!(strategy.audio_target, AudioTranscodeTarget::AacLc);
    }

    #[test]
    fn caps_high_framerate() {
        let mut probe = base_probe();
        probe.framerate = 120.0;
        let strategy = derive_strategy(&probe);
        assert_eq!(strategy.capped_framerate, Some(30.0));
    }

    #[test]
    fn normalizes_low_framerate() {
        let mut probe = base_probe();
        probe.framerate = 10.0;
        let strategy = derive_strategy(&probe);
        assert_eq!(strategy.capped_framerate, Some(15.0));
    }

    #[test]
    fn detects_ultra_compressed_passthrough() {
        let mut probe = base_probe();
        probe.bitrate_bps = 100_000;
        let strategy = derive_strategy(&probe);
        assert!(strategy.passthrough);
    }

    #[test]
    fn rotation_90_emits_filter() {
        let mut probe = base_probe();
        probe.rotation_degrees = 90;
        let strategy = derive_strategy(&probe);
        assert_eq!(strategy.rotation_filter_degrees, 90);
    }
}
