//! Worker configuration: ambient config-layer concern named but not
//! specified in detail by spec.md §1 ("configuration parsing" is an
//! external collaborator) — the fields below are exactly the ones the
//! Job Lifecycle Engine and its satellites read, parsed the way the
//! teacher's CLI does it (clap derive + env fallbacks).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "threespeak-worker", version, about = "3Speak video-transcoding worker")]
pub struct Cli {
    /// Base URL of the Gateway HTTP API.
    #[arg(long, env = "ENCODER_GATEWAY_URL", default_value = "https://encoder-gateway.infra.3speak.tv")]
    pub gateway_url: String,

    /// Fast HTTP gateway used for content-addressed downloads.
    #[arg(long, env = "ENCODER_IPFS_GATEWAY", default_value = "https://ipfs.3speak.tv")]
    pub ipfs_gateway: String,

    /// Local daemon base URL (uploads, pinning, P2P-backed reads).
    #[arg(long, env = "ENCODER_IPFS_DAEMON", default_value = "http://127.0.0.1:5001")]
    pub ipfs_daemon: String,

    /// Optional separate remote pinning endpoint; falls back to the
    /// local daemon when unset.
    #[arg(long, env = "ENCODER_REMOTE_PIN_URL")]
    pub remote_pin_url: Option<String>,

    /// Whether a remote pin failure may fall back to pinning on the
    /// local daemon (spec.md §4.3 "Pin contract").
    #[arg(long, env = "ENCODER_LOCAL_PIN_FALLBACK", default_value_t = true)]
    pub local_pin_fallback: bool,

    /// MongoDB connection string for the Database Verifier (C5). Absent
    /// disables C5 entirely (spec.md §4.2 "present only when enabled").
    #[arg(long, env = "ENCODER_MONGO_URI")]
    pub mongo_uri: Option<String>,

    #[arg(long, env = "ENCODER_MONGO_DB", default_value = "threespeak")]
    pub mongo_db: String,

    #[arg(long, env = "ENCODER_MONGO_COLLECTION", default_value = "jobs")]
    pub mongo_collection: String,

    /// Directory holding the identity file and pending-pin store
    /// (spec.md §6 "Persistent worker state").
    #[arg(long, env = "ENCODER_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Display name stamped into the identity file.
    #[arg(long, env = "ENCODER_NAME", default_value = "3speak-encoder")]
    pub display_name: String,

    /// Max jobs executing concurrently (spec.md §3 invariant).
    #[arg(long, env = "ENCODER_MAX_CONCURRENT", default_value_t = 2)]
    pub max_concurrent: usize,

    /// Disables the Direct API server entirely (spec.md §4.6).
    #[arg(long, env = "ENCODER_DIRECT_API_DISABLED", default_value_t = false)]
    pub direct_api_disabled: bool,

    #[arg(long, env = "ENCODER_DIRECT_API_PORT", default_value_t = 8181)]
    pub direct_api_port: u16,

    /// Shared secret the Direct API requires on every non-health request.
    #[arg(long, env = "ENCODER_DIRECT_API_KEY")]
    pub direct_api_key: Option<String>,

    #[arg(long, env = "ENCODER_FFMPEG_BIN", default_value = "ffmpeg")]
    pub ffmpeg_bin: String,

    #[arg(long, env = "ENCODER_FFPROBE_BIN", default_value = "ffprobe")]
    pub ffprobe_bin: String,
}

impl Cli {
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("encoder-identity")
    }

    pub fn pending_pins_path(&self) -> PathBuf {
        self.data_dir.join("pending_pins.json")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }
}
