use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use threespeak_core::timeouts::{GATEWAY_POLL, GATEWAY_POST_DEFAULT, GATEWAY_STATS};
use threespeak_core::{classify_claim_error, classify_finish_error, RawHttpError};
use threespeak_identity::Identity;

use crate::dto::{FinishOutcome, GatewayJobDto, JobStatusDto, PingStatus};
use crate::error::GatewayError;

pub struct GatewayClient {
    http: Client,
    base_url: String,
    identity: Arc<Mutex<Identity>>,
    max_body_bytes: usize,
}

impl GatewayClient {
    pub fn new(http: Client, base_url: impl Into<String>, identity: Arc<Mutex<Identity>>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
            max_body_bytes: 4096,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn signed_post(
        &self,
        path: &str,
        payload: &impl Serialize,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let envelope = {
            let identity = self.identity.lock().await;
            identity
                .sign_envelope(payload)
                .map_err(|e| GatewayError::Signing(e.to_string()))?
        };
        let response = tokio::time::timeout(
            timeout,
            self.http.post(self.url(path)).json(&envelope.to_body()).send(),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;
        Ok(response)
    }

    async fn raw_http_error(response: reqwest::Response, max_body_bytes: usize) -> RawHttpError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let body = if body.len() > max_body_bytes {
            body.chars().take(max_body_bytes).collect()
        } else {
            body
        };
        RawHttpError::new(status, body)
    }

    /// `GET /api/v0/gateway/getJob`: 404 means "no job available", not an
    /// error (spec.md §4.1).
    pub async fn poll(&self) -> Result<Option<GatewayJobDto>, GatewayError> {
        let response = tokio::time::timeout(
            GATEWAY_POLL,
            self.http.get(self.url("/api/v0/gateway/getJob")).send(),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let raw = Self::raw_http_error(response, self.max_body_bytes).await;
            let kind = classify_claim_error(&raw);
            return Err(GatewayError::Classified { kind, raw });
        }
        Ok(Some(response.json().await?))
    }

    pub async fn claim(&self, job_id: &str) -> Result<(), GatewayError> {
        let response = self
            .signed_post(
                "/api/v0/gateway/acceptJob",
                &json!({"job_id": job_id}),
                GATEWAY_POST_DEFAULT,
            )
            .await?;
        if !response.status().is_success() {
            let raw = Self::raw_http_error(response, self.max_body_bytes).await;
            let kind = classify_claim_error(&raw);
            return Err(GatewayError::Classified { kind, raw });
        }
        Ok(())
    }

    pub async fn reject(&self, job_id: &str) -> Result<(), GatewayError> {
        self.post_simple("/api/v0/gateway/rejectJob", &json!({"job_id": job_id}))
            .await
    }

    /// `Cancel` shares `rejectJob`'s wire semantics: spec.md's external
    /// interfaces table names no dedicated cancel endpoint, and releasing
    /// a claim is what cancellation means to the Gateway.
    pub async fn cancel(&self, job_id: &str) -> Result<(), GatewayError> {
        self.reject(job_id).await
    }

    pub async fn ping(
        &self,
        job_id: &str,
        progress_pct: f64,
        download_pct: f64,
    ) -> Result<(), GatewayError> {
        let status = PingStatus {
            progress_pct,
            download_pct,
        };
        self.post_simple(
            "/api/v0/gateway/pingJob",
            &json!({"job_id": job_id, "status": status}),
        )
        .await
    }

    pub async fn finish(&self, job_id: &str, cid: &str) -> Result<FinishOutcome, GatewayError> {
        let response = self
            .signed_post(
                "/api/v0/gateway/finishJob",
                &json!({"job_id": job_id, "output": {"cid": cid}}),
                GATEWAY_POST_DEFAULT,
            )
            .await?;
        if !response.status().is_success() {
            let raw = Self::raw_http_error(response, self.max_body_bytes).await;
            let kind = classify_finish_error(&raw);
            if kind == threespeak_core::ErrorKind::DuplicateCompletion {
                return Ok(FinishOutcome { duplicate: true });
            }
            return Err(GatewayError::Classified { kind, raw });
        }
        Ok(FinishOutcome { duplicate: false })
    }

    pub async fn fail(&self, job_id: &str, error_details: &str) -> Result<(), GatewayError> {
        self.post_simple(
            "/api/v0/gateway/failJob",
            &json!({"job_id": job_id, "error": error_details}),
        )
        .await
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatusDto, GatewayError> {
        let response = tokio::time::timeout(
            GATEWAY_POST_DEFAULT,
            self.http
                .get(self.url(&format!("/api/v0/gateway/jobstatus/{job_id}")))
                .send(),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;
        if !response.status().is_success() {
            let raw = Self::raw_http_error(response, self.max_body_bytes).await;
            return Err(GatewayError::Classified {
                kind: classify_claim_error(&raw),
                raw,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn stats(&self) -> Result<serde_json::Value, GatewayError> {
        let response = tokio::time::timeout(
            GATEWAY_STATS,
            self.http.get(self.url("/api/v0/gateway/stats")).send(),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;
        Ok(response.json().await?)
    }

    /// Best-effort node registration at startup (SPEC_FULL.md §3).
    pub async fn register_node(
        &self,
        name: &str,
        crypto_accounts: &serde_json::Value,
        peer_id: &str,
        commit_hash: &str,
    ) -> Result<(), GatewayError> {
        self.post_simple(
            "/api/v0/gateway/updateNode",
            &json!({"node_info": {
                "name": name,
                "cryptoAccounts": crypto_accounts,
                "peer_id": peer_id,
                "commit_hash": commit_hash,
            }}),
        )
        .await
    }

    async fn post_simple(
        &self,
        path: &str,
        payload: &impl Serialize,
    ) -> Result<(), GatewayError> {
        let response = self.signed_post(path, payload, GATEWAY_POST_DEFAULT).await?;
        if !response.status().is_success() {
            let raw = Self::raw_http_error(response, self.max_body_bytes).await;
            return Err(GatewayError::Classified {
                kind: classify_claim_error(&raw),
                raw,
            });
        }
        Ok(())
    }
}
