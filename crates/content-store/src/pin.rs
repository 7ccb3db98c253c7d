use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use threespeak_core::timeouts::{PIN_HARD_CAP, PIN_SOFT_CAP, PIN_VERIFY_PER_TRY};

use crate::error::ContentStoreError;

const VERIFY_RETRIES: u32 = 3;
const VERIFY_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinVia {
    Remote,
    Local,
}

#[derive(Debug)]
pub struct PinOutcome {
    pub pinned: bool,
    pub via: Option<PinVia>,
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
struct PinLsResponse {
    #[serde(default)]
    keys: std::collections::HashMap<String, serde_json::Value>,
}

/// spec.md §6: `POST /api/v0/pin/add?arg=<cid>&recursive=true`.
fn pin_add_url(base: &str, cid: &str) -> String {
    format!("{}/api/v0/pin/add?arg={cid}&recursive=true", base.trim_end_matches('/'))
}

/// spec.md §6: `POST /api/v0/pin/ls?arg=<cid>&type=all`.
fn pin_ls_url(base: &str, cid: &str) -> String {
    format!("{}/api/v0/pin/ls?arg={cid}&type=all", base.trim_end_matches('/'))
}

/// Implements the "bulletproof" pin contract (spec.md §4.3): resolves
/// within `PIN_HARD_CAP` regardless of outcome, and pin failure is never
/// surfaced as a job-fatal error — the caller decides what to do with a
/// `PinOutcome { pinned: false, .. }` (typically: enqueue to the Pending
/// Pin Store).
pub async fn pin_and_announce(
    http: &Client,
    remote_base: Option<&str>,
    local_base: &str,
    cid: &str,
    local_fallback_enabled: bool,
) -> PinOutcome {
    let fut = pin_and_announce_inner(http, remote_base, local_base, cid, local_fallback_enabled);
    match tokio::time::timeout(PIN_HARD_CAP, fut).await {
        Ok(outcome) => outcome,
        Err(_) => PinOutcome {
            pinned: false,
            via: None,
            verified: false,
        },
    }
}

async fn pin_and_announce_inner(
    http: &Client,
    remote_base: Option<&str>,
    local_base: &str,
    cid: &str,
    local_fallback_enabled: bool,
) -> PinOutcome {
    let mut pinned_via = None;

    if let Some(remote) = remote_base {
        let url = pin_add_url(remote, cid);
        if tokio::time::timeout(PIN_SOFT_CAP, http.post(&url).send())
            .await
            .ok()
            .and_then(|r| r.ok())
            .map(|r| r.status().is_success())
            .unwrap_or(false)
        {
            pinned_via = Some(PinVia::Remote);
        }
    }

    if pinned_via.is_none() && local_fallback_enabled {
        let url = pin_add_url(local_base, cid);
        if http
            .post(&url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
        {
            pinned_via = Some(PinVia::Local);
        }
    }

    let Some(via) = pinned_via else {
        return PinOutcome {
            pinned: false,
            via: None,
            verified: false,
        };
    };

    announce(http, local_base, cid).await;
    let verified = verify_pin_listed(http, local_base, cid).await;

    PinOutcome {
        pinned: true,
        via: Some(via),
        verified,
    }
}

async fn announce(http: &Client, daemon_base: &str, cid: &str) {
    let url = format!(
        "{}/api/v0/dht/provide?arg={cid}",
        daemon_base.trim_end_matches('/')
    );
    let _ = http.post(&url).send().await;
}

async fn verify_pin_listed(http: &Client, daemon_base: &str, cid: &str) -> bool {
    let url = pin_ls_url(daemon_base, cid);
    for attempt in 0..VERIFY_RETRIES {
        let result = tokio::time::timeout(PIN_VERIFY_PER_TRY, http.post(&url).send()).await;
        if let Ok(Ok(response)) = result {
            if let Ok(body) = response.json::<PinLsResponse>().await {
                if body.keys.contains_key(cid) {
                    return true;
                }
            }
        }
        if attempt + 1 < VERIFY_RETRIES {
            tokio::time::sleep(VERIFY_RETRY_DELAY).await;
        }
    }
    false
}

/// spec.md §4.3 `VerifyPersistence`: pin listed, and the cid resolves as
/// a directory with a recognized playlist or quality-folder child.
pub async fn verify_persistence(
    http: &Client,
    daemon_base: &str,
    cid: &str,
) -> Result<bool, ContentStoreError> {
    if !verify_pin_listed(http, daemon_base, cid).await {
        return Ok(false);
    }

    let url = format!("{}/api/v0/ls?arg={cid}", daemon_base.trim_end_matches('/'));
    let body: serde_json::Value = http
        .post(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let links = body["Objects"][0]["Links"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    const KNOWN_PLAYLISTS: &[&str] = &["master.m3u8", "index.m3u8", "playlist.m3u8"];
    let has_recognized_child = links.iter().any(|link| {
        let name = link["Name"].as_str().unwrap_or_default();
        KNOWN_PLAYLISTS.contains(&name) || is_quality_folder(name)
    });

    Ok(has_recognized_child)
}

fn is_quality_folder(name: &str) -> bool {
    name.ends_with('p') && name[..name.len() - 1].chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_add_url_carries_recursive_flag() {
        assert_eq!(
            pin_add_url("http://127.0.0.1:5001", "QmFoo"),
            "http://127.0.0.1:5001/api/v0/pin/add?arg=QmFoo&recursive=true"
        );
    }

    #[test]
    fn pin_ls_url_carries_type_all() {
        assert_eq!(
            pin_ls_url("http://127.0.0.1:5001/", "QmFoo"),
            "http://127.0.0.1:5001/api/v0/pin/ls?arg=QmFoo&type=all"
        );
    }

    #[test]
    fn is_quality_folder_matches_known_shapes() {
        assert!(is_quality_folder("480p"));
        assert!(is_quality_folder("1080p"));
        assert!(!is_quality_folder("manifest.m3u8"));
        assert!(!is_quality_folder(""));
    }
}
