use serde::{Deserialize, Serialize};

/// Shape of the Gateway's `getJob` response (spec.md §6 database schema
/// fields, as surfaced over the wire).
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayJobDto {
    pub job_id: String,
    pub input: InputDto,
    #[serde(default)]
    pub metadata: MetadataDto,
    #[serde(default, rename = "storageMetadata")]
    pub storage_metadata: StorageMetadataDto,
    #[serde(default)]
    pub short: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputDto {
    pub uri: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataDto {
    #[serde(default)]
    pub video_owner: Option<String>,
    #[serde(default)]
    pub video_permlink: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageMetadataDto {
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusDto {
    pub assigned_to: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingStatus {
    #[serde(rename = "progressPct")]
    pub progress_pct: f64,
    pub download_pct: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FinishOutcome {
    pub duplicate: bool,
}
