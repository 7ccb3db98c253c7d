//! Adaptive segment duration and adaptive per-profile encode timeout
//! (spec.md §4.4 steps 4–5).

use std::time::Duration;

use threespeak_core::timeouts::{ENCODE_MAX, ENCODE_MIN};

use crate::strategy::EncodingStrategy;

const MAX_SEGMENTS: u32 = 2000;

/// Base segment length as a function of total duration (spec.md §4.4
/// step 4), before the hard segment-count ceiling is enforced.
fn base_segment_seconds(duration_secs: f64) -> u32 {
    if duration_secs <= 3600.0 {
        6
    } else if duration_secs <= 4.0 * 3600.0 {
        15
    } else if duration_secs <= 12.0 * 3600.0 {
        30
    } else {
        60
    }
}

/// Computes the segment length, recomputing upward if the base choice
/// would exceed `MAX_SEGMENTS` segments for the given duration.
pub fn adaptive_segment_seconds(duration_secs: f64) -> u32 {
    let base = base_segment_seconds(duration_secs);
    if duration_secs <= 0.0 {
        return base;
    }
    let segments = (duration_secs / base as f64).ceil() as u32;
    if segments <= MAX_SEGMENTS {
        return base;
    }
    // Recompute: smallest segment length that keeps us under the ceiling.
    ((duration_secs / MAX_SEGMENTS as f64).ceil() as u32).max(base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecClass {
    Hardware,
    Software,
}

/// Adaptive per-profile encode timeout (spec.md §4.4 step 5): hardware
/// base 60s, software base 30min, scaled for extreme cases and clamped
/// to the 2h absolute maximum.
pub fn adaptive_encode_timeout(class: CodecClass, strategy: &EncodingStrategy) -> Duration {
    let base = match class {
        CodecClass::Hardware => Duration::from_secs(60),
        CodecClass::Software => Duration::from_secs(30 * 60),
    };

    let mut scaled = base;
    if strategy.extreme_duration {
        scaled = scaled.mul_f64(3.0);
    }
    if strategy.massive_frame_count {
        scaled = scaled.mul_f64(4.0);
    }
    if strategy.capped_framerate.is_some() {
        scaled = scaled.mul_f64(2.0);
    }

    if class == CodecClass::Hardware && (strategy.extreme_duration || strategy.massive_frame_count) {
        scaled = scaled.mul_f64(0.7);
    }

    scaled.clamp(ENCODE_MIN, ENCODE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{AudioTranscodeTarget, VideoTranscodeTarget};

    fn base_strategy() -> EncodingStrategy {
        EncodingStrategy {
            select_video_audio_streams_only: false,
            force_8bit_420: false,
            rotation_filter_degrees: 0,
            fast_start: false,
            video_target: VideoTranscodeTarget::Copy,
            audio_target: AudioTranscodeTarget::Copy,
            capped_framerate: None,
            extreme_duration: false,
            massive_frame_count: false,
            passthrough: false,
        }
    }

    #[test]
    fn segment_duration_tiers() {
        assert_eq!(adaptive_segment_seconds(1800.0), 6);
        assert_eq!(adaptive_segment_seconds(2.0 * 3600.0), 15);
        assert_eq!(adaptive_segment_seconds(6.0 * 3600.0), 30);
        assert_eq!(adaptive_segment_seconds(12.0 * 3600.0 + 1.0), 60);
    }

    #[test]
    fn segment_duration_respects_max_segments_ceiling() {
        // 12h + 1s at 60s segments would be 721 segments -- under ceiling.
        let secs = adaptive_segment_seconds(12.0 * 3600.0 + 1.0);
        let count = ((12.0 * 3600.0 + 1.0) / secs as f64).ceil() as u32;
        assert!(count <= MAX_SEGMENTS);
    }

    #[test]
    fn extreme_duration_triples_software_timeout() {
        let mut strategy = base_strategy();
        strategy.extreme_duration = true;
        let timeout = adaptive_encode_timeout(CodecClass::Software, &strategy);
        assert_eq!(timeout, Duration::from_secs(30 * 60 * 3));
    }

    #[test]
    fn clamps_to_two_hour_max() {
        let mut strategy = base_strategy();
        strategy.extreme_duration = true;
        strategy.massive_frame_count = true;
        let timeout = adaptive_encode_timeout(CodecClass::Software, &strategy);
        assert_eq!(timeout, ENCODE_MAX);
    }

    #[test]
    fn hardware_gets_reduced_for_extreme_case() {
        let mut strategy = base_strategy();
        strategy.extreme_duration = true;
        let timeout = adaptive_encode_timeout(CodecClass::Hardware, &strategy);
        assert_eq!(timeout, Duration::from_secs(60).mul_f64(3.0 * 0.7));
    }
}
