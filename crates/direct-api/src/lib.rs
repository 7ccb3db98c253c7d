//! C8 Direct API Server — an authenticated HTTP endpoint workers expose so
//! a caller can submit/query jobs without going through the Gateway
//! (spec.md §4.6).

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use threespeak_core::{JobMetadata, JobStatus};
use threespeak_queue::{DirectJobRequest, JobQueue};

#[derive(Clone)]
pub struct DirectApiConfig {
    pub api_key: String,
}

#[derive(Clone)]
struct AppState {
    queue: Arc<Mutex<JobQueue>>,
    config: Arc<DirectApiConfig>,
}

#[derive(Debug, Deserialize)]
pub struct EncodeRequest {
    #[serde(default)]
    pub input_cid: Option<String>,
    #[serde(default)]
    pub input_uri: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub permlink: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub profiles: Option<BTreeSet<String>>,
    #[serde(default)]
    pub short: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EncodeResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct JobsSummary {
    total: usize,
    pending: usize,
    active: usize,
    complete: usize,
    failed: usize,
}

pub fn router(queue: Arc<Mutex<JobQueue>>, config: DirectApiConfig) -> Router {
    let state = AppState {
        queue,
        config: Arc::new(config),
    };

    let authenticated = Router::new()
        .route("/encode", post(encode))
        .route("/job/:id", get(get_job))
        .route("/jobs", get(list_jobs))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    match provided {
        Some(key) if key == state.config.api_key => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "invalid or missing api key".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn encode(
    State(state): State<AppState>,
    Json(req): Json<EncodeRequest>,
) -> Response {
    let input_uri = match req.input_cid.or(req.input_uri) {
        Some(uri) => uri,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "one of input_cid or input_uri is required".to_string(),
                }),
            )
                .into_response();
        }
    };

    let profiles = req.profiles.unwrap_or_else(|| default_profiles(req.short));
    let job_id = uuid::Uuid::new_v4().to_string();
    let direct_req = DirectJobRequest {
        id: job_id.clone(),
        input_uri,
        profiles_requested: profiles,
        metadata: JobMetadata {
            owner: req.owner,
            permlink: req.permlink,
            app: req.app,
        },
        short: req.short,
        webhook_url: req.webhook_url,
    };

    let job = {
        let mut queue = state.queue.lock().await;
        queue.add_direct(direct_req)
    };

    (
        StatusCode::ACCEPTED,
        Json(EncodeResponse {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
        }),
    )
        .into_response()
}

fn default_profiles(short: bool) -> BTreeSet<String> {
    if short {
        BTreeSet::from(["480p".to_string()])
    } else {
        BTreeSet::from(["1080p".to_string(), "720p".to_string(), "480p".to_string()])
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let queue = state.queue.lock().await;
    match queue.get(&id) {
        Some(job) => Json(job.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("job {id} not found"),
            }),
        )
            .into_response(),
    }
}

async fn list_jobs(State(state): State<AppState>) -> Response {
    let queue = state.queue.lock().await;
    let summary = JobsSummary {
        total: queue.len_pending() + queue.len_active(),
        pending: queue.len_pending(),
        active: queue.len_active(),
        complete: 0,
        failed: 0,
    };
    Json(summary).into_response()
}

/// Returns the disabled-mode response body: 503 with a machine-readable
/// reason, used when the Direct API is turned off by configuration
/// (spec.md §4.6 "Requests received when Direct API is disabled").
pub fn disabled_response() -> Router {
    Router::new().fallback(|| async {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: "direct api disabled".to_string(),
            }),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_router() -> Router {
        router(
            Arc::new(Mutex::new(JobQueue::new(2))),
            DirectApiConfig {
                api_key: "secret".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn health_is_unauthenticated() {
        let app = test_router();
        let response = app
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn encode_requires_api_key() {
        let app = test_router();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/encode")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"input_cid":"Qm123"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn encode_accepts_with_valid_key() {
        let app = test_router();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/encode")
                    .header("content-type", "application/json")
                    .header("x-api-key", "secret")
                    .body(Body::from(r#"{"input_cid":"Qm123","short":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn encode_rejects_missing_input() {
        let app = test_router();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/encode")
                    .header("content-type", "application/json")
                    .header("x-api-key", "secret")
                    .body(Body::from(r#"{}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
