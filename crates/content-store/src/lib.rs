//! C2 Content Store Client — the IPFS-style object store gateway/daemon
//! pair workers read video source material from and publish HLS bundles
//! to (spec.md §4.3).

mod download;
mod error;
mod pin;
mod upload;

use std::path::Path;

use reqwest::Client;

pub use error::ContentStoreError;
pub use pin::{PinOutcome, PinVia};

/// Configuration for reaching the object store: a fast HTTP gateway for
/// reads, a local daemon for writes and P2P-backed reads, and an optional
/// separate remote pinning endpoint.
#[derive(Debug, Clone)]
pub struct ContentStoreConfig {
    pub gateway_base: String,
    pub daemon_base: String,
    pub remote_pin_base: Option<String>,
    pub local_pin_fallback: bool,
}

pub struct ContentStoreClient {
    http: Client,
    config: ContentStoreConfig,
}

impl ContentStoreClient {
    pub fn new(http: Client, config: ContentStoreConfig) -> Self {
        Self { http, config }
    }

    pub async fn download(&self, uri: &str, out_path: &Path) -> Result<(), ContentStoreError> {
        download::download(
            &self.http,
            &self.config.gateway_base,
            &self.config.daemon_base,
            uri,
            out_path,
        )
        .await
    }

    pub async fn upload_file(&self, path: &Path, pin: bool) -> Result<String, ContentStoreError> {
        upload::upload_file(&self.http, &self.config.daemon_base, path, pin).await
    }

    pub async fn upload_directory(
        &self,
        path: &Path,
        pin: bool,
        on_pin_failed: Option<&dyn Fn(String)>,
    ) -> Result<String, ContentStoreError> {
        upload::upload_directory(&self.http, &self.config.daemon_base, path, pin, on_pin_failed)
            .await
    }

    /// The bulletproof pin contract: never takes longer than the hard cap,
    /// never turns a pin failure into a job-fatal error.
    pub async fn pin_and_announce(&self, cid: &str) -> PinOutcome {
        pin::pin_and_announce(
            &self.http,
            self.config.remote_pin_base.as_deref(),
            &self.config.daemon_base,
            cid,
            self.config.local_pin_fallback,
        )
        .await
    }

    pub async fn unpin(&self, cid: &str) -> Result<(), ContentStoreError> {
        let url = format!(
            "{}/api/v0/pin/rm?arg={cid}",
            self.config.daemon_base.trim_end_matches('/')
        );
        self.http.post(&url).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn verify_persistence(&self, cid: &str) -> Result<bool, ContentStoreError> {
        pin::verify_persistence(&self.http, &self.config.daemon_base, cid).await
    }

    /// Best-effort cleanup of scratch temporary objects; individual
    /// failures are swallowed since cleanup is advisory, not load-bearing.
    pub async fn cleanup_temporary(&self, cids: &[String]) {
        for cid in cids {
            let _ = self.unpin(cid).await;
        }
    }

    /// Used both standalone (worker startup log) and as the client's own
    /// non-fatal connectivity probe, mirroring the Gateway Client's
    /// bounded startup probe (SPEC_FULL.md §2 C2).
    pub async fn peer_id(&self) -> Result<String, ContentStoreError> {
        let url = format!(
            "{}/api/v0/id",
            self.config.daemon_base.trim_end_matches('/')
        );
        #[derive(serde::Deserialize)]
        struct IdResponse {
            #[serde(rename = "ID")]
            id: String,
        }
        let response: IdResponse = self
            .http
            .post(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_addressed_detection() {
        assert!(download::is_content_addressed(
            "QmSomeHashQmSomeHashQmSomeHash"
        ));
        assert!(download::is_content_addressed("bafybeigdyrzt"));
        assert!(download::is_content_addressed("ipfs://QmFoo"));
        assert!(!download::is_content_addressed("https://example.com/a.mp4"));
    }
}
