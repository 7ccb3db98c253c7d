//! C10 Webhook Dispatcher — fires completion/failure notifications for
//! Direct-API jobs (spec.md §4.7.1). Best-effort, fire-and-forget: a
//! failed delivery is logged and never retried (SPEC_FULL.md §2 C10 —
//! retrying a webhook risks duplicate downstream side effects with no way
//! to dedupe, and spec.md names no retry policy for this path).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use crate::event::{emit, EngineEvent, EventSender};

#[derive(Debug, Clone, Serialize)]
pub struct CompletionWebhook {
    pub owner: Option<String>,
    pub permlink: Option<String>,
    pub input_cid: String,
    pub status: &'static str,
    pub manifest_cid: String,
    pub video_url: String,
    pub job_id: String,
    pub processing_time_seconds: f64,
    pub qualities_encoded: Vec<String>,
    pub encoder_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureWebhook {
    pub owner: Option<String>,
    pub permlink: Option<String>,
    pub input_cid: String,
    pub status: &'static str,
    pub job_id: String,
    pub error: String,
    pub encoder_id: String,
    pub timestamp: DateTime<Utc>,
}

pub struct WebhookDispatcher {
    http: Client,
    events: EventSender,
}

impl WebhookDispatcher {
    pub fn new(http: Client, events: EventSender) -> Self {
        Self { http, events }
    }

    pub fn dispatch_completion(self: &Arc<Self>, url: String, payload: CompletionWebhook) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.send(&url, &payload).await;
        });
    }

    pub fn dispatch_failure(self: &Arc<Self>, url: String, payload: FailureWebhook) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.send(&url, &payload).await;
        });
    }

    async fn send(&self, url: &str, payload: &impl Serialize) {
        match self.http.post(url).json(payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                emit(
                    &self.events,
                    EngineEvent::Warning(format!(
                        "webhook to {url} returned status {}",
                        response.status()
                    )),
                );
            }
            Err(err) => {
                emit(
                    &self.events,
                    EngineEvent::Warning(format!("webhook delivery to {url} failed: {err}")),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_payload_serializes_expected_fields() {
        let payload = CompletionWebhook {
            owner: Some("alice".to_string()),
            permlink: Some("vid1".to_string()),
            input_cid: "QmIN".to_string(),
            status: "complete",
            manifest_cid: "QmOUT".to_string(),
            video_url: "ipfs://QmOUT/manifest.m3u8".to_string(),
            job_id: "job-1".to_string(),
            processing_time_seconds: 12.5,
            qualities_encoded: vec!["480p".to_string()],
            encoder_id: "enc-1".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["manifest_cid"], "QmOUT");
    }
}
