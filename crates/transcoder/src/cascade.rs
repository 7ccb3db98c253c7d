//! Codec cascade: the ordered fallback list of encoder backends to try
//! for H.264 output, tested hardware first, then untested-but-available
//! hardware, then software last (spec.md §4.4 "Initialization").

use std::process::Stdio;

use crate::timing::CodecClass;

#[derive(Debug, Clone)]
pub struct CascadeEntry {
    pub encoder_name: String,
    pub class: CodecClass,
    /// Whether a capability probe actually exercised this encoder
    /// successfully this run, vs. merely being listed as available.
    pub tested: bool,
}

const HARDWARE_H264_ENCODERS: &[&str] = &["h264_nvenc", "h264_qsv", "h264_vaapi", "h264_videotoolbox"];
const SOFTWARE_H264_ENCODER: &str = "libx264";

/// Probes `ffmpeg -hwaccels` and `ffmpeg -encoders`, producing the
/// ordered cascade: tested hardware, untested-but-listed hardware,
/// software last. Software is always present if `ffmpeg -encoders`
/// lists it (spec.md: "Software must always be present in the cascade
/// if available").
pub async fn build_cascade(ffmpeg_bin: &str) -> Vec<CascadeEntry> {
    let encoders = list_encoders(ffmpeg_bin).await;
    let hwaccels = list_hwaccels(ffmpeg_bin).await;

    let mut tested_hw = Vec::new();
    let mut untested_hw = Vec::new();

    for name in HARDWARE_H264_ENCODERS {
        if !encoders.iter().any(|e| e == name) {
            continue;
        }
        let backend_listed = hwaccels.iter().any(|h| name.contains(h.as_str()));
        if backend_listed && test_encoder(ffmpeg_bin, name).await {
            tested_hw.push(CascadeEntry {
                encoder_name: name.to_string(),
                class: CodecClass::Hardware,
                tested: true,
            });
        } else {
            untested_hw.push(CascadeEntry {
                encoder_name: name.to_string(),
                class: CodecClass::Hardware,
                tested: false,
            });
        }
    }

    let mut cascade = Vec::new();
    cascade.append(&mut tested_hw);
    cascade.append(&mut untested_hw);

    if encoders.iter().any(|e| e == SOFTWARE_H264_ENCODER) {
        cascade.push(CascadeEntry {
            encoder_name: SOFTWARE_H264_ENCODER.to_string(),
            class: CodecClass::Software,
            tested: true,
        });
    }

    cascade
}

async fn list_encoders(ffmpeg_bin: &str) -> Vec<String> {
    let output = tokio::process::Command::new(ffmpeg_bin)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .await;
    let Ok(output) = output else { return Vec::new() };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1).map(str::to_string))
        .collect()
}

async fn list_hwaccels(ffmpeg_bin: &str) -> Vec<String> {
    let output = tokio::process::Command::new(ffmpeg_bin)
        .args(["-hide_banner", "-hwaccels"])
        .stdin(Stdio::null())
        .output()
        .await;
    let Ok(output) = output else { return Vec::new() };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .skip(1)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// A minimal smoke test: encode a few frames of a synthetic test source
/// with the candidate encoder and see if ffmpeg exits cleanly.
async fn test_encoder(ffmpeg_bin: &str, encoder: &str) -> bool {
    let output = tokio::process::Command::new(ffmpeg_bin)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "color=c=black:s=64x64:d=0.1",
            "-frames:v",
            "2",
            "-c:v",
            encoder,
            "-f",
            "null",
            "-",
        ])
        .stdin(Stdio::null())
        .output()
        .await;
    matches!(output, Ok(o) if o.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_list_is_known_set() {
        assert!(HARDWARE_H264_ENCODERS.contains(&"h264_nvenc"));
        assert!(HARDWARE_H264_ENCODERS.contains(&"h264_vaapi"));
    }
}
