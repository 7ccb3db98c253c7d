//! Design constants from spec.md §5 ("Timeouts"). These are not
//! implementation details; they're part of the observable contract other
//! components (and the Gateway) are tuned against.

use std::time::Duration;

pub const GATEWAY_POST_DEFAULT: Duration = Duration::from_secs(30);
pub const GATEWAY_STATS: Duration = Duration::from_secs(10);
pub const GATEWAY_POLL: Duration = Duration::from_secs(15);

pub const SINGLE_FILE_UPLOAD_BASE: Duration = Duration::from_secs(60);
pub const SINGLE_FILE_UPLOAD_PER_MB: Duration = Duration::from_secs(10);
pub const SINGLE_FILE_UPLOAD_CAP: Duration = Duration::from_secs(10 * 60);

pub const DIRECTORY_UPLOAD_BASE: Duration = Duration::from_secs(120);
pub const DIRECTORY_UPLOAD_PER_MB: Duration = Duration::from_secs(5);
pub const DIRECTORY_UPLOAD_CAP: Duration = Duration::from_secs(15 * 60);

pub const PIN_HARD_CAP: Duration = Duration::from_secs(120);
pub const PIN_SOFT_CAP: Duration = Duration::from_secs(60);
pub const PIN_VERIFY_PER_TRY: Duration = Duration::from_secs(30);

pub const ENCODE_MIN: Duration = Duration::from_secs(60);
pub const ENCODE_MAX: Duration = Duration::from_secs(2 * 60 * 60);

pub const DOWNLOAD_GATEWAY_TIER: Duration = Duration::from_secs(90);
pub const DOWNLOAD_DAEMON_TIER: Duration = Duration::from_secs(300);

/// Computes `clamp(base + per_mb * size_mb, base, cap)`, the formula used
/// for both single-file and directory upload timeouts (spec.md §4.3).
pub fn scaled_timeout(base: Duration, per_mb: Duration, cap: Duration, size_mb: f64) -> Duration {
    let extra = per_mb.mul_f64(size_mb.max(0.0));
    (base + extra).min(cap).max(base)
}
