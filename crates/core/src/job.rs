use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a job came from: the Gateway's competitive fleet dispatch, or a
/// direct submission to this worker's own API (C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    GatewayJob,
    DirectJob,
}

/// A job is in exactly one of these states at every observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

/// Owner/permlink and app tag consumed by the webhook dispatcher (C10) and
/// the publisher metadata the Gateway expects on `finishJob`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub permlink: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
}

/// Unit of work, per spec.md §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub origin: Origin,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input_uri: String,
    pub profiles_requested: BTreeSet<String>,
    pub metadata: JobMetadata,
    pub short: bool,
    pub progress_percent: f64,
    pub result_cid: Option<String>,
    pub last_error: Option<String>,
    /// Gateway-assigned webhook target, only meaningful for `DirectJob`.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Job {
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Running)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Paired with a Job while it is retrying; exists only while status is
/// Queued and `attempts > 0`, or during failure handling (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry: Option<DateTime<Utc>>,
    pub error_history: Vec<String>,
}

impl RetryRecord {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            last_attempt: None,
            next_retry: None,
            error_history: Vec::new(),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// The fully computed upload result, cached so a retry that only fails at
/// the Gateway-notification step can skip re-transcoding (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub result_cid: String,
    pub master_playlist_uri: String,
}
