use std::path::{Path, PathBuf};

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;

use threespeak_core::timeouts::{
    scaled_timeout, DIRECTORY_UPLOAD_BASE, DIRECTORY_UPLOAD_CAP, DIRECTORY_UPLOAD_PER_MB,
    SINGLE_FILE_UPLOAD_BASE, SINGLE_FILE_UPLOAD_CAP, SINGLE_FILE_UPLOAD_PER_MB,
};

use crate::error::ContentStoreError;

#[derive(Debug, Deserialize)]
struct UploadRecord {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
    #[allow(dead_code)]
    #[serde(rename = "Size")]
    size: Option<String>,
}

pub async fn upload_file(
    http: &Client,
    daemon_base: &str,
    path: &Path,
    pin: bool,
) -> Result<String, ContentStoreError> {
    let bytes = tokio::fs::read(path).await?;
    let size_mb = bytes.len() as f64 / (1024.0 * 1024.0);
    let timeout = scaled_timeout(
        SINGLE_FILE_UPLOAD_BASE,
        SINGLE_FILE_UPLOAD_PER_MB,
        SINGLE_FILE_UPLOAD_CAP,
        size_mb,
    );
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let part = Part::bytes(bytes).file_name(file_name);
    let form = Form::new().part("file", part);

    let url = format!(
        "{}/api/v0/add?pin={}",
        daemon_base.trim_end_matches('/'),
        pin
    );
    let body = post_multipart(http, &url, form, timeout).await?;
    parse_cid(&body, None)
}

pub async fn upload_directory(
    http: &Client,
    daemon_base: &str,
    dir: &Path,
    pin: bool,
    on_pin_failed: Option<&dyn Fn(String)>,
) -> Result<String, ContentStoreError> {
    let files = collect_files(dir, dir).await?;
    let total_bytes: u64 = files.iter().map(|(_, size)| *size).sum();
    let size_mb = total_bytes as f64 / (1024.0 * 1024.0);
    let timeout = scaled_timeout(
        DIRECTORY_UPLOAD_BASE,
        DIRECTORY_UPLOAD_PER_MB,
        DIRECTORY_UPLOAD_CAP,
        size_mb,
    );

    let mut form = Form::new();
    for (relative, _) in &files {
        let data = tokio::fs::read(dir.join(relative)).await?;
        let part = Part::bytes(data).file_name(relative.to_string_lossy().into_owned());
        form = form.part("file", part);
    }

    let url = format!(
        "{}/api/v0/add?wrap-with-directory=true&recursive=true&pin={}",
        daemon_base.trim_end_matches('/'),
        pin
    );
    let result = post_multipart(http, &url, form, timeout).await;
    match result {
        Ok(body) => {
            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            parse_cid(&body, Some(&dir_name))
        }
        Err(err) => {
            if pin {
                if let Some(cb) = on_pin_failed {
                    cb(dir.to_string_lossy().into_owned());
                }
            }
            Err(err)
        }
    }
}

async fn post_multipart(
    http: &Client,
    url: &str,
    form: Form,
    timeout: std::time::Duration,
) -> Result<String, ContentStoreError> {
    let fut = async {
        let response = http
            .post(url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        Ok::<String, ContentStoreError>(response.text().await?)
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ContentStoreError::Timeout(timeout)),
    }
}

/// Parses the newline-delimited `{Name, Hash, Size}` upload response and
/// picks the directory record (empty/matching `Name`, or the last
/// non-empty `Hash` as a fallback) per spec.md §4.3.
fn parse_cid(body: &str, dir_name: Option<&str>) -> Result<String, ContentStoreError> {
    let mut last_non_empty_hash: Option<String> = None;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let record: UploadRecord = serde_json::from_str(line)
            .map_err(|e| ContentStoreError::UploadParseError(e.to_string()))?;
        let is_directory_record = record.name.is_empty()
            || dir_name.map(|d| record.name == d).unwrap_or(false);
        if is_directory_record && !record.hash.is_empty() {
            return Ok(record.hash);
        }
        if !record.hash.is_empty() {
            last_non_empty_hash = Some(record.hash);
        }
    }
    last_non_empty_hash.ok_or_else(|| {
        ContentStoreError::UploadParseError("no record with a non-empty Hash".to_string())
    })
}

async fn collect_files(root: &Path, dir: &Path) -> Result<Vec<(PathBuf, u64)>, ContentStoreError> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                out.push((relative, metadata.len()));
            }
        }
    }
    Ok(out)
}
