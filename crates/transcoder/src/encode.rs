//! Per-profile ffmpeg invocation: HLS segmentation, progress parsing, and
//! the codec-cascade retry loop (spec.md §4.4 steps 6–8).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::cascade::CascadeEntry;
use crate::manifest::QualityProfile;
use crate::strategy::{AudioTranscodeTarget, EncodingStrategy, VideoTranscodeTarget};

/// spec.md §3 "if true, render only 480p and trim to 60 s".
pub const SHORT_MODE_TRIM_SECONDS: u32 = 60;

#[derive(Debug, Clone, Default)]
pub struct EncodeProgress {
    pub percent: f64,
}

#[derive(Debug, Clone)]
pub struct ProfileEncodeResult {
    pub profile: QualityProfile,
    pub output_dir: std::path::PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoder exited with status {0}")]
    NonZeroExit(i32),
    #[error("encoder timed out after {0:?}")]
    TimedOut(Duration),
    #[error("encoder killed by signal")]
    Killed,
}

fn build_filters(strategy: &EncodingStrategy) -> Option<String> {
    let mut filters = Vec::new();
    if strategy.force_8bit_420 {
        filters.push("format=yuv420p".to_string());
    }
    match strategy.rotation_filter_degrees {
        90 => filters.push("transpose=1".to_string()),
        180 => filters.push("transpose=2,transpose=2".to_string()),
        270 => filters.push("transpose=2".to_string()),
        _ => {}
    }
    if let Some(fps) = strategy.capped_framerate {
        filters.push(format!("fps={fps}"));
    }
    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}

/// Builds the ffmpeg argument list for `encode_profile`, separated out
/// so the trim/filter/codec logic is checkable without spawning a child
/// process (spec.md §3 "trim to 60 s").
fn build_profile_args(
    input: &Path,
    output_dir: &Path,
    profile: QualityProfile,
    strategy: &EncodingStrategy,
    candidate: &CascadeEntry,
    segment_seconds: u32,
    trim_seconds: Option<u32>,
) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = Vec::new();
    args.extend(["-hide_banner", "-y", "-nostdin", "-i"].map(Into::into));
    args.push(input.as_os_str().to_os_string());

    if let Some(secs) = trim_seconds {
        args.push("-t".into());
        args.push(secs.to_string().into());
    }

    if strategy.select_video_audio_streams_only {
        args.extend(["-map", "0:v:0", "-map", "0:a:0?"].map(Into::into));
    }

    match strategy.video_target {
        VideoTranscodeTarget::Copy => {
            args.extend(["-c:v", "copy"].map(Into::into));
        }
        VideoTranscodeTarget::H264 => {
            args.push("-c:v".into());
            args.push(candidate.encoder_name.as_str().into());
            if let Some(filters) = build_filters(strategy) {
                args.push("-vf".into());
                args.push(filters.into());
            }
            args.push("-s".into());
            args.push(format!("{}x{}", profile.width, profile.height).into());
            if strategy.extreme_duration {
                args.extend(["-preset", "veryfast", "-crf", "28"].map(Into::into));
            }
            if strategy.massive_frame_count {
                args.extend(["-preset", "ultrafast", "-threads", "0"].map(Into::into));
            }
        }
    }

    match strategy.audio_target {
        AudioTranscodeTarget::Copy => {
            args.extend(["-c:a", "copy"].map(Into::into));
        }
        AudioTranscodeTarget::AacLc => {
            args.extend(["-c:a", "aac"].map(Into::into));
        }
    }

    if strategy.fast_start {
        args.extend(["-movflags", "+faststart"].map(Into::into));
    }

    args.extend(
        [
            "-f",
            "hls",
            "-hls_time",
            &segment_seconds.to_string(),
            "-hls_list_size",
            "0",
            "-hls_segment_filename",
        ]
        .map(std::ffi::OsString::from),
    );
    args.push(output_dir.join(format!("{}_%d.ts", profile.name)).into_os_string());
    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push(output_dir.join("index.m3u8").into_os_string());
    args
}

/// Attempts a single HLS-segmented encode of `profile` using `candidate`,
/// terminating (killing the child) on timeout or non-zero exit so the
/// caller can advance to the next cascade entry (spec.md §4.4 step 7).
pub async fn encode_profile(
    ffmpeg_bin: &str,
    input: &Path,
    output_dir: &Path,
    profile: QualityProfile,
    strategy: &EncodingStrategy,
    candidate: &CascadeEntry,
    segment_seconds: u32,
    timeout: Duration,
    trim_seconds: Option<u32>,
    mut on_progress: impl FnMut(f64) + Send + 'static,
) -> Result<ProfileEncodeResult, EncodeError> {
    tokio::fs::create_dir_all(output_dir).await?;

    let mut cmd = Command::new(ffmpeg_bin);
    cmd.args(build_profile_args(
        input,
        output_dir,
        profile,
        strategy,
        candidate,
        segment_seconds,
        trim_seconds,
    ));

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().expect("piped stdout");

    let progress_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        let mut last_out_time_ms: u64 = 0;
        while let Ok(Some(line)) = reader.next_line().await {
            if let Some(value) = line.strip_prefix("out_time_ms=") {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    last_out_time_ms = ms;
                }
            }
            if line.starts_with("progress=") {
                on_progress(last_out_time_ms as f64 / 1000.0);
            }
        }
    });

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;
    let _ = progress_task.await;

    let status = match wait_result {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(EncodeError::TimedOut(timeout));
        }
    };

    if !status.success() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if status.signal().is_some() {
                return Err(EncodeError::Killed);
            }
        }
        return Err(EncodeError::NonZeroExit(status.code().unwrap_or(-1)));
    }

    Ok(ProfileEncodeResult {
        profile,
        output_dir: output_dir.to_path_buf(),
    })
}

/// Passthrough-mode encode: copy video+audio, segment for HLS only, no
/// re-encode (spec.md §4.4 step 8).
pub async fn encode_passthrough(
    ffmpeg_bin: &str,
    input: &Path,
    output_dir: &Path,
    profile: QualityProfile,
    segment_seconds: u32,
    timeout: Duration,
    trim_seconds: Option<u32>,
) -> Result<ProfileEncodeResult, EncodeError> {
    tokio::fs::create_dir_all(output_dir).await?;

    let mut cmd = Command::new(ffmpeg_bin);
    cmd.args(["-hide_banner", "-y", "-nostdin", "-i"]).arg(input);
    if let Some(secs) = trim_seconds {
        cmd.args(["-t", &secs.to_string()]);
    }
    cmd.args(["-c", "copy", "-f", "hls", "-hls_time", &segment_seconds.to_string(), "-hls_list_size", "0", "-hls_segment_filename"])
        .arg(output_dir.join(format!("{}_%d.ts", profile.name)))
        .arg(output_dir.join("index.m3u8"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    match wait_result {
        Ok(Ok(output)) if output.status.success() => Ok(ProfileEncodeResult {
            profile,
            output_dir: output_dir.to_path_buf(),
        }),
        Ok(Ok(output)) => Err(EncodeError::NonZeroExit(output.status.code().unwrap_or(-1))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(EncodeError::TimedOut(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::derive_strategy;
    use crate::probe::ProbeResult;

    #[test]
    fn filters_empty_for_default_strategy() {
        let probe = ProbeResult {
            container: "mov".to_string(),
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            pixel_format: Some("yuv420p".to_string()),
            bit_depth: 8,
            hdr_transfer: None,
            rotation_degrees: 0,
            width: 1920,
            height: 1080,
            framerate: 30.0,
            duration_secs: 60.0,
            bitrate_bps: 4_000_000,
            non_media_stream_count: 0,
            issues: Vec::new(),
        };
        let strategy = derive_strategy(&probe);
        assert_eq!(build_filters(&strategy), None);
    }

    #[test]
    fn filters_include_rotation_transpose() {
        let mut probe = ProbeResult {
            container: "mov".to_string(),
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            pixel_format: Some("yuv420p".to_string()),
            bit_depth: 8,
            hdr_transfer: None,
            rotation_degrees: 90,
            width: 1080,
            height: 1920,
            framerate: 30.0,
            duration_secs: 60.0,
            bitrate_bps: 4_000_000,
            non_media_stream_count: 0,
            issues: Vec::new(),
        };
        probe.rotation_degrees = 90;
        let strategy = derive_strategy(&probe);
        assert_eq!(build_filters(&strategy), Some("transpose=1".to_string()));
    }

    fn default_probe() -> ProbeResult {
        ProbeResult {
            container: "mov".to_string(),
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            pixel_format: Some("yuv420p".to_string()),
            bit_depth: 8,
            hdr_transfer: None,
            rotation_degrees: 0,
            width: 854,
            height: 480,
            framerate: 30.0,
            duration_secs: 120.0,
            bitrate_bps: 1_000_000,
            non_media_stream_count: 0,
            issues: Vec::new(),
        }
    }

    fn args_as_strings(args: &[std::ffi::OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    /// spec.md §3/§8: a short job must trim output to <=60s via `-t 60`.
    #[test]
    fn trim_seconds_emits_dash_t_flag() {
        let probe = default_probe();
        let strategy = derive_strategy(&probe);
        let candidate = CascadeEntry {
            encoder_name: "libx264".to_string(),
            class: crate::timing::CodecClass::Software,
            tested: true,
        };
        let args = build_profile_args(
            Path::new("/tmp/source"),
            Path::new("/tmp/out"),
            crate::manifest::PROFILE_480P,
            &strategy,
            &candidate,
            6,
            Some(60),
        );
        let args = args_as_strings(&args);
        let t_pos = args.iter().position(|a| a == "-t").expect("-t flag present");
        assert_eq!(args[t_pos + 1], "60");
    }

    #[test]
    fn no_trim_omits_dash_t_flag() {
        let probe = default_probe();
        let strategy = derive_strategy(&probe);
        let candidate = CascadeEntry {
            encoder_name: "libx264".to_string(),
            class: crate::timing::CodecClass::Software,
            tested: true,
        };
        let args = build_profile_args(
            Path::new("/tmp/source"),
            Path::new("/tmp/out"),
            crate::manifest::PROFILE_480P,
            &strategy,
            &candidate,
            6,
            None,
        );
        let args = args_as_strings(&args);
        assert!(!args.iter().any(|a| a == "-t"));
    }
}
