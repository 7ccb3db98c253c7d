//! C3 Transcoder — turns a downloaded source file into an HLS bundle
//! across the requested quality profiles (spec.md §4.4).

mod cascade;
mod encode;
mod error;
mod manifest;
mod probe;
mod strategy;
mod timing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use threespeak_content_store::ContentStoreClient;
use threespeak_core::job::Job;

pub use cascade::{build_cascade, CascadeEntry};
pub use encode::{EncodeError, ProfileEncodeResult};
pub use error::TranscoderError;
pub use manifest::{build_master_playlist, profile_for_name, QualityProfile, PROFILE_1080P, PROFILE_480P, PROFILE_720P};
pub use probe::{probe, IssueSeverity, ProbeIssue, ProbeResult};
pub use strategy::{derive_strategy, AudioTranscodeTarget, EncodingStrategy, VideoTranscodeTarget};
pub use timing::{adaptive_encode_timeout, adaptive_segment_seconds, CodecClass};

/// Paths and binaries the transcoder shells out to; config lives here
/// rather than scattered `env::var` calls so the worker binary can wire
/// it once at startup (spec.md §7 "Configuration").
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub work_dir: PathBuf,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            work_dir: std::env::temp_dir().join("threespeak-worker"),
        }
    }
}

/// Final product of a successful [`Transcoder::process`] call.
#[derive(Debug, Clone)]
pub struct TranscodeOutcome {
    pub result_cid: String,
    pub master_playlist_uri: String,
    pub duration_secs: f64,
    pub profiles: Vec<&'static str>,
}

pub struct Transcoder {
    config: TranscoderConfig,
    content_store: Arc<ContentStoreClient>,
}

fn requested_profiles(job: &Job) -> Vec<QualityProfile> {
    if job.short {
        return vec![PROFILE_480P];
    }
    let requested: Vec<QualityProfile> = job
        .profiles_requested
        .iter()
        .filter_map(|name| profile_for_name(name))
        .collect();
    if requested.is_empty() {
        vec![PROFILE_1080P, PROFILE_720P, PROFILE_480P]
    } else {
        requested
    }
}

impl Transcoder {
    pub fn new(config: TranscoderConfig, content_store: Arc<ContentStoreClient>) -> Self {
        Self {
            config,
            content_store,
        }
    }

    /// Runs the full pipeline for one job: download, probe, derive
    /// strategy, encode each requested profile through the codec
    /// cascade, assemble the master playlist, and upload the bundle.
    ///
    /// `on_progress` is called with a monotonic 0.0–100.0 percentage
    /// (spec.md §4.4: 5–25% download, 25–95% encode, 95–100% upload).
    /// `on_pin_failed` fires if the directory upload succeeds but
    /// pinning does not; it never turns into a job failure.
    pub async fn process(
        &self,
        job: &Job,
        on_progress: Arc<dyn Fn(f64) + Send + Sync>,
        on_pin_failed: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Result<TranscodeOutcome, TranscoderError> {
        let job_dir = self.config.work_dir.join(&job.id);
        tokio::fs::create_dir_all(&job_dir).await?;

        let input_path = job_dir.join("source");
        on_progress(5.0);
        self.content_store
            .download(&job.input_uri, &input_path)
            .await?;
        on_progress(25.0);

        let probe_result = probe::probe(&self.config.ffprobe_bin, &input_path).await?;
        if probe_result.has_error_issue() {
            let messages: Vec<String> = probe_result
                .issues
                .iter()
                .filter(|i| i.severity == probe::IssueSeverity::Error)
                .map(|i| i.message.clone())
                .collect();
            return Err(TranscoderError::InputMediaFatal(messages.join("; ")));
        }

        let strategy = strategy::derive_strategy(&probe_result);
        let segment_seconds = timing::adaptive_segment_seconds(probe_result.duration_secs);

        let profiles = if strategy.passthrough {
            vec![PROFILE_480P]
        } else {
            requested_profiles(job)
        };

        let output_root = job_dir.join("output");
        tokio::fs::create_dir_all(&output_root).await?;

        // spec.md §3 "if true, render only 480p and trim to 60 s".
        let trim_seconds = job.short.then_some(encode::SHORT_MODE_TRIM_SECONDS);

        let span = 95.0 - 25.0;
        let per_profile_span = span / profiles.len().max(1) as f64;
        let mut encoded = Vec::new();

        for (index, profile) in profiles.iter().enumerate() {
            let base_percent = 25.0 + per_profile_span * index as f64;
            let profile_output = output_root.join(profile.name);

            let result = if strategy.passthrough {
                encode::encode_passthrough(
                    &self.config.ffmpeg_bin,
                    &input_path,
                    &profile_output,
                    *profile,
                    segment_seconds,
                    timing::adaptive_encode_timeout(CodecClass::Software, &strategy),
                    trim_seconds,
                )
                .await
                .map_err(|e| TranscoderError::CascadeExhausted(e.to_string()))?
            } else {
                self.encode_with_cascade(
                    &input_path,
                    &profile_output,
                    *profile,
                    &strategy,
                    segment_seconds,
                    base_percent,
                    per_profile_span,
                    trim_seconds,
                    on_progress.clone(),
                )
                .await?
            };
            encoded.push(result);
        }

        on_progress(95.0);

        let playlist = manifest::build_master_playlist(&profiles);
        tokio::fs::write(output_root.join("manifest.m3u8"), playlist).await?;

        let callback = on_pin_failed.clone();
        let result_cid = self
            .content_store
            .upload_directory(&output_root, true, Some(&move |cid: String| callback(cid)))
            .await
            .map_err(|e| TranscoderError::UploadFailed(e.to_string()))?;

        on_progress(100.0);

        let _ = tokio::fs::remove_file(&input_path).await;

        Ok(TranscodeOutcome {
            master_playlist_uri: format!("{result_cid}/manifest.m3u8"),
            result_cid,
            duration_secs: probe_result.duration_secs,
            profiles: profiles.iter().map(|p| p.name).collect(),
        })
    }

    /// Walks the codec cascade for one profile, advancing to the next
    /// encoder candidate on timeout or failure until one succeeds or the
    /// cascade is exhausted (spec.md §4.4 step 7).
    #[allow(clippy::too_many_arguments)]
    async fn encode_with_cascade(
        &self,
        input_path: &Path,
        profile_output: &Path,
        profile: QualityProfile,
        strategy: &EncodingStrategy,
        segment_seconds: u32,
        base_percent: f64,
        span: f64,
        trim_seconds: Option<u32>,
        on_progress: Arc<dyn Fn(f64) + Send + Sync>,
    ) -> Result<ProfileEncodeResult, TranscoderError> {
        if strategy.video_target == VideoTranscodeTarget::Copy {
            let candidate = CascadeEntry {
                encoder_name: "copy".to_string(),
                class: CodecClass::Software,
                tested: true,
            };
            return encode::encode_profile(
                &self.config.ffmpeg_bin,
                input_path,
                profile_output,
                profile,
                strategy,
                &candidate,
                segment_seconds,
                timing::adaptive_encode_timeout(CodecClass::Software, strategy),
                trim_seconds,
                move |secs| {
                    let total = secs.max(0.0);
                    on_progress(base_percent + span * (total / (total + 1.0)).min(1.0));
                },
            )
            .await
            .map_err(|e| TranscoderError::CascadeExhausted(e.to_string()));
        }

        let candidates = cascade::build_cascade(&self.config.ffmpeg_bin).await;
        if candidates.is_empty() {
            return Err(TranscoderError::CascadeExhausted(profile.name.to_string()));
        }

        let mut last_error = None;
        for candidate in &candidates {
            let timeout = timing::adaptive_encode_timeout(candidate.class, strategy);
            let reporter = on_progress.clone();
            match encode::encode_profile(
                &self.config.ffmpeg_bin,
                input_path,
                profile_output,
                profile,
                strategy,
                candidate,
                segment_seconds,
                timeout,
                trim_seconds,
                move |secs| {
                    let total = secs.max(0.0);
                    reporter(base_percent + span * (total / (total + 1.0)).min(1.0));
                },
            )
            .await
            {
                Ok(result) => return Ok(result),
                Err(e) => last_error = Some(e),
            }
        }

        Err(TranscoderError::CascadeExhausted(format!(
            "{}: {}",
            profile.name,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use threespeak_core::job::{JobMetadata, JobStatus, Origin};

    fn base_job() -> Job {
        Job {
            id: "job-1".to_string(),
            origin: Origin::GatewayJob,
            status: JobStatus::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            input_uri: "ipfs://QmTest".to_string(),
            profiles_requested: BTreeSet::new(),
            metadata: JobMetadata::default(),
            short: false,
            progress_percent: 0.0,
            result_cid: None,
            last_error: None,
            webhook_url: None,
        }
    }

    #[test]
    fn empty_profiles_requested_defaults_to_all_three() {
        let job = base_job();
        let profiles = requested_profiles(&job);
        assert_eq!(profiles.len(), 3);
    }

    #[test]
    fn short_job_is_480p_only_regardless_of_request() {
        let mut job = base_job();
        job.short = true;
        job.profiles_requested.insert("1080p".to_string());
        let profiles = requested_profiles(&job);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "480p");
    }

    /// spec.md §3/§8: a short job trims output to <=60s.
    #[test]
    fn short_job_requests_sixty_second_trim() {
        let mut job = base_job();
        job.short = true;
        let trim = job.short.then_some(encode::SHORT_MODE_TRIM_SECONDS);
        assert_eq!(trim, Some(60));

        job.short = false;
        let trim = job.short.then_some(encode::SHORT_MODE_TRIM_SECONDS);
        assert_eq!(trim, None);
    }

    #[test]
    fn explicit_subset_is_honored() {
        let mut job = base_job();
        job.profiles_requested.insert("720p".to_string());
        let profiles = requested_profiles(&job);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "720p");
    }

    /// An all-unrecognized request is treated the same as no request at
    /// all: the filtered list is empty, so `requested_profiles` falls
    /// back to the full ladder rather than encoding nothing.
    #[test]
    fn unknown_only_profile_names_fall_back_to_full_ladder() {
        let mut job = base_job();
        job.profiles_requested.insert("8k".to_string());
        let profiles = requested_profiles(&job);
        assert_eq!(profiles.len(), 3);
    }
}
