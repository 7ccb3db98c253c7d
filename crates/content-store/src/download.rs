use std::path::Path;

use futures::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use threespeak_core::timeouts::{DOWNLOAD_DAEMON_TIER, DOWNLOAD_GATEWAY_TIER};

use crate::error::ContentStoreError;

/// A URI is content-addressed if it names a CID directly, rather than a
/// conventional URL (spec.md §4.3 "two-tier download").
pub fn is_content_addressed(uri: &str) -> bool {
    uri.starts_with("ipfs://") || uri.starts_with("Qm") || uri.starts_with("bafy")
}

fn extract_cid(uri: &str) -> &str {
    uri.strip_prefix("ipfs://").unwrap_or(uri)
}

/// Downloads `uri` to `out_path`, streaming the whole way (never buffering
/// the payload in memory) and tearing down the response stream on any
/// terminal outcome.
pub async fn download(
    http: &Client,
    gateway_base: &str,
    daemon_base: &str,
    uri: &str,
    out_path: &Path,
) -> Result<(), ContentStoreError> {
    if let Some(path) = uri.strip_prefix("file://") {
        tokio::fs::copy(path, out_path).await?;
        return Ok(());
    }

    if is_content_addressed(uri) {
        let cid = extract_cid(uri);
        let gateway_url = format!("{}/ipfs/{cid}", gateway_base.trim_end_matches('/'));
        match stream_to_file(http, &gateway_url, out_path, DOWNLOAD_GATEWAY_TIER).await {
            Ok(()) => return Ok(()),
            Err(_) => {
                let daemon_url = format!(
                    "{}/api/v0/cat?arg={cid}",
                    daemon_base.trim_end_matches('/')
                );
                return stream_to_file(http, &daemon_url, out_path, DOWNLOAD_DAEMON_TIER)
                    .await
                    .map_err(|_| {
                        ContentStoreError::DaemonUnavailable(format!(
                            "both gateway and daemon failed for {cid}"
                        ))
                    });
            }
        }
    }

    stream_to_file(http, uri, out_path, DOWNLOAD_GATEWAY_TIER).await
}

async fn stream_to_file(
    http: &Client,
    url: &str,
    out_path: &Path,
    timeout: std::time::Duration,
) -> Result<(), ContentStoreError> {
    let fut = async {
        let response = http.get(url).send().await?.error_for_status()?;
        let mut stream = response.bytes_stream();
        let mut file = File::create(out_path).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok::<(), ContentStoreError>(())
    };

    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            let _ = tokio::fs::remove_file(out_path).await;
            Err(ContentStoreError::Timeout(timeout))
        }
    }
}
