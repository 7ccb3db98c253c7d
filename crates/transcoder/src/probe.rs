//! Input probing via `ffprobe -print_format json` (spec.md §4.4 step 2).

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;

use crate::error::TranscoderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ProbeIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub pixel_format: Option<String>,
    pub bit_depth: u32,
    pub hdr_transfer: Option<String>,
    pub rotation_degrees: i32,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub duration_secs: f64,
    pub bitrate_bps: u64,
    pub non_media_stream_count: u32,
    pub issues: Vec<ProbeIssue>,
}

impl ProbeResult {
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bits_per_pixel(&self) -> f64 {
        let pixels_per_sec = (self.width as f64) * (self.height as f64) * self.framerate.max(1.0);
        if pixels_per_sec <= 0.0 {
            return 0.0;
        }
        self.bitrate_bps as f64 / pixels_per_sec
    }

    pub fn has_error_issue(&self) -> bool {
        self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: String,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    pix_fmt: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    bits_per_raw_sample: Option<String>,
    #[serde(default)]
    color_transfer: Option<String>,
    #[serde(default)]
    side_data_list: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    tags: Option<std::collections::HashMap<String, String>>,
}

/// Runs `ffprobe -print_format json -show_format -show_streams` on
/// `input` and parses the output into a [`ProbeResult`].
pub async fn probe(ffprobe_bin: &str, input: &Path) -> Result<ProbeResult, TranscoderError> {
    let output = tokio::process::Command::new(ffprobe_bin)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(TranscoderError::ProbeFailed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| TranscoderError::ProbeFailed(format!("parse ffprobe json: {e}")))?;

    let mut issues = Vec::new();

    let video = parsed.streams.iter().find(|s| s.codec_type == "video");
    let audio = parsed.streams.iter().find(|s| s.codec_type == "audio");
    let non_media = parsed
        .streams
        .iter()
        .filter(|s| !matches!(s.codec_type.as_str(), "video" | "audio"))
        .count() as u32;

    let Some(video) = video else {
        issues.push(ProbeIssue {
            severity: IssueSeverity::Error,
            message: "no video stream found".to_string(),
        });
        return Ok(ProbeResult {
            container: parsed.format.format_name,
            video_codec: None,
            audio_codec: audio.and_then(|a| a.codec_name.clone()),
            pixel_format: None,
            bit_depth: 8,
            hdr_transfer: None,
            rotation_degrees: 0,
            width: 0,
            height: 0,
            framerate: 0.0,
            duration_secs: parsed
                .format
                .duration
                .as_deref()
                .and_then(|d| d.parse().ok())
                .unwrap_or(0.0),
            bitrate_bps: 0,
            non_media_stream_count: non_media,
            issues,
        });
    };

    let bit_depth = video
        .bits_per_raw_sample
        .as_deref()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(8);

    let rotation_degrees = rotation_from_stream(video);

    let framerate = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or(0.0);

    if framerate <= 0.0 {
        issues.push(ProbeIssue {
            severity: IssueSeverity::Warning,
            message: "could not determine framerate".to_string(),
        });
    }

    Ok(ProbeResult {
        container: parsed.format.format_name,
        video_codec: video.codec_name.clone(),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
        pixel_format: video.pix_fmt.clone(),
        bit_depth,
        hdr_transfer: video.color_transfer.clone(),
        rotation_degrees,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        framerate,
        duration_secs: parsed
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0),
        bitrate_bps: parsed
            .format
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse().ok())
            .unwrap_or(0),
        non_media_stream_count: non_media,
        issues,
    })
}

/// Rotation from display matrix side data, rotation side data, or the
/// legacy `rotate` tag (spec.md §4.4 step 2).
fn rotation_from_stream(stream: &FfprobeStream) -> i32 {
    if let Some(side_data) = &stream.side_data_list {
        for entry in side_data {
            if let Some(rotation) = entry.get("rotation").and_then(|v| v.as_f64()) {
                return normalize_rotation(rotation as i32);
            }
        }
    }
    if let Some(tags) = &stream.tags {
        if let Some(rotate) = tags.get("rotate").and_then(|r| r.parse::<i32>().ok()) {
            return normalize_rotation(rotate);
        }
    }
    0
}

fn normalize_rotation(deg: i32) -> i32 {
    ((deg % 360) + 360) % 360
}

fn parse_frame_rate(raw: &str) -> Option<f64> {
    let mut parts = raw.split('/');
    let num: f64 = parts.next()?.parse().ok()?;
    let den: f64 = parts.next().unwrap_or("1").parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_frame_rate() {
        assert_eq!(parse_frame_rate("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
    }

    #[test]
    fn normalizes_negative_rotation() {
        assert_eq!(normalize_rotation(-90), 270);
        assert_eq!(normalize_rotation(450), 90);
    }
}
