//! C9 Lifecycle Engine — the core coordinator: polls, claims, runs the
//! per-job state machine, drives retries, monitors liveness, selects
//! fallbacks (spec.md §4.7). The heart of the worker.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use threespeak_content_store::ContentStoreClient;
use threespeak_core::job::{Job, Origin};
use threespeak_core::{CachedResult, ErrorKind};
use threespeak_db_verifier::DbVerifier;
use threespeak_gateway_client::{GatewayClient, GatewayError};
use threespeak_identity::Identity;
use threespeak_pin_queue::{PendingPinStore, PinKind};
use threespeak_queue::JobQueue;
use threespeak_transcoder::{TranscodeOutcome, Transcoder};

use crate::event::{emit, EngineEvent, EventSender};
use crate::webhook::{CompletionWebhook, FailureWebhook, WebhookDispatcher};

const POLL_INTERVAL: Duration = Duration::from_secs(60);
const POLL_JITTER_SECS: u64 = 15;
const EXECUTE_INTERVAL: Duration = Duration::from_secs(5);
const STUCK_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const STUCK_MAX_ACTIVE: Duration = Duration::from_secs(60 * 60);
const OWNERSHIP_MONITOR_INTERVAL: Duration = Duration::from_secs(60);
const CONSECUTIVE_FAILURES_BEFORE_OFFLINE: u32 = 5;

/// The six intermediate states a Gateway job's state machine can observe
/// itself in, used only for the events emitted to the binary; terminal
/// outcomes (`RaceLost`/`Abandoned`/`Failed`/`Done`) are represented by
/// the function's `Result` rather than as enum variants, since once
/// reached there's nothing further to transition out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatewayJobState {
    Seen,
    OwnershipProbed,
    Claimed,
    Verified,
    Monitored,
    Persisted,
    Reported,
}

impl GatewayJobState {
    fn label(self) -> &'static str {
        match self {
            GatewayJobState::Seen => "seen",
            GatewayJobState::OwnershipProbed => "ownership_probed",
            GatewayJobState::Claimed => "claimed",
            GatewayJobState::Verified => "verified",
            GatewayJobState::Monitored => "monitored",
            GatewayJobState::Persisted => "persisted",
            GatewayJobState::Reported => "reported",
        }
    }
}

/// Outcome of running a Gateway job through the state machine to
/// completion or a terminal non-success state.
enum JobOutcome {
    Done,
    RaceLost,
    /// Non-retryable, should report failure to the Gateway if `report` is
    /// true (spec.md §4.7.2 "Reporting discipline").
    Failed { message: String, report: bool },
    /// Retryable; the caller re-queues via `C6.Fail` with `can_retry=true`.
    Retry { message: String, kind: ErrorKind },
}

pub struct LifecycleEngine {
    identity: Arc<Mutex<Identity>>,
    gateway: Arc<GatewayClient>,
    db: Option<Arc<DbVerifier>>,
    queue: Arc<Mutex<JobQueue>>,
    pin_queue: Arc<PendingPinStore>,
    content_store: Arc<ContentStoreClient>,
    transcoder: Arc<Transcoder>,
    webhook: Arc<WebhookDispatcher>,
    events: EventSender,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
    consecutive_poll_failures: AtomicU32,
}

impl LifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Mutex<Identity>>,
        gateway: Arc<GatewayClient>,
        db: Option<Arc<DbVerifier>>,
        queue: Arc<Mutex<JobQueue>>,
        pin_queue: Arc<PendingPinStore>,
        content_store: Arc<ContentStoreClient>,
        transcoder: Arc<Transcoder>,
        webhook: Arc<WebhookDispatcher>,
        events: EventSender,
    ) -> Self {
        Self {
            identity,
            gateway,
            db,
            queue,
            pin_queue,
            content_store,
            transcoder,
            webhook,
            events,
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
            consecutive_poll_failures: AtomicU32::new(0),
        }
    }

    /// Idempotent: a second call while already stopping is a no-op
    /// (spec.md §9 "its lifecycle is Start → Run → Stop with idempotent
    /// Stop").
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            emit(&self.events, EngineEvent::Info("lifecycle engine stopping".to_string()));
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn our_did(&self) -> String {
        self.identity.lock().await.did()
    }

    /// Spawns the three periodic activities (spec.md §5 "Scheduling
    /// model") and waits for all of them to wind down after `request_stop`.
    pub async fn run(self: Arc<Self>) {
        let handles: Vec<JoinHandle<()>> = vec![
            tokio::spawn(self.clone().activity_poll()),
            tokio::spawn(self.clone().activity_execute()),
            tokio::spawn(self.clone().activity_stuck_sweep()),
        ];
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Activity A: Poll (every 60s, jittered per spec.md §9 "the random
    /// second-of-minute for polling is a design requirement to distribute
    /// load across the fleet").
    async fn activity_poll(self: Arc<Self>) {
        loop {
            let jitter = rand::thread_rng().gen_range(0..=POLL_JITTER_SECS);
            let wait = POLL_INTERVAL + Duration::from_secs(jitter);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {}
            }
            if self.should_stop() {
                return;
            }

            let has_capacity = self.queue.lock().await.has_capacity();
            if !has_capacity {
                continue;
            }

            match self.gateway.poll().await {
                Ok(Some(dto)) => {
                    self.consecutive_poll_failures.store(0, Ordering::SeqCst);
                    let our_did = self.our_did().await;
                    let assigned_to = None::<&str>; // getJob doesn't surface assignedTo directly; Status is the source of truth.
                    let _ = assigned_to;
                    let job = gateway_job_from_dto(&dto, &our_did);
                    let mut queue = self.queue.lock().await;
                    if queue.add_gateway(job) {
                        emit(&self.events, EngineEvent::Info(format!("polled job {}", dto.job_id)));
                    }
                }
                Ok(None) => {
                    self.consecutive_poll_failures.store(0, Ordering::SeqCst);
                }
                Err(err) => {
                    let failures = self.consecutive_poll_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= CONSECUTIVE_FAILURES_BEFORE_OFFLINE {
                        emit(
                            &self.events,
                            EngineEvent::Error(format!(
                                "gateway appears offline after {failures} consecutive poll failures: {err}"
                            )),
                        );
                    } else {
                        emit(&self.events, EngineEvent::Warning(format!("poll failed: {err}")));
                    }
                }
            }
        }
    }

    /// Activity B: Execute (every 5s) — drains retries, then dispatches
    /// the next ready job by origin.
    async fn activity_execute(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(EXECUTE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            if self.should_stop() {
                return;
            }

            {
                let mut queue = self.queue.lock().await;
                queue.process_retries();
            }

            let next = self.queue.lock().await.next();
            let Some(job) = next else { continue };

            let engine = self.clone();
            tokio::spawn(async move {
                engine.execute_job(job).await;
            });
        }
    }

    /// Activity C: Stuck-sweeper (every 10 min).
    async fn activity_stuck_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STUCK_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            if self.should_stop() {
                return;
            }

            let stuck = self.queue.lock().await.detect_stuck(STUCK_MAX_ACTIVE);
            for id in stuck {
                let is_gateway = matches!(
                    self.queue.lock().await.get(&id).map(|j| j.origin),
                    Some(Origin::GatewayJob)
                );
                if is_gateway {
                    if let Err(err) = self.gateway.reject(&id).await {
                        emit(&self.events, EngineEvent::Warning(format!(
                            "stuck sweeper: reject({id}) failed: {err}"
                        )));
                    }
                }
                let mut queue = self.queue.lock().await;
                let _ = queue.abandon(&id, "stuck: no progress for over 1h");
                emit(&self.events, EngineEvent::state(&id, "abandoned"));
            }
        }
    }

    async fn execute_job(&self, job: Job) {
        match job.origin {
            Origin::GatewayJob => self.run_gateway_job(job).await,
            Origin::DirectJob => self.run_direct_job(job).await,
        }
    }

    /// spec.md §4.7.1 "Direct-job execution": same transcode pipeline,
    /// plus an optional completion/failure webhook.
    async fn run_direct_job(&self, job: Job) {
        let started_at = Utc::now();
        let on_progress = {
            let queue = self.queue.clone();
            let job_id = job.id.clone();
            Arc::new(move |pct: f64| {
                let queue = queue.clone();
                let job_id = job_id.clone();
                tokio::spawn(async move {
                    let _ = queue.lock().await.update_progress(&job_id, pct);
                });
            }) as Arc<dyn Fn(f64) + Send + Sync>
        };
        let on_pin_failed = self.pin_failed_callback(&job.id);

        match self.transcoder.process(&job, on_progress, on_pin_failed).await {
            Ok(outcome) => {
                {
                    let mut queue = self.queue.lock().await;
                    let _ = queue.complete(&job.id, outcome.result_cid.clone());
                }
                self.identity.lock().await.record_job_completed().ok();
                emit(&self.events, EngineEvent::state(&job.id, "done"));

                if let Some(url) = job.webhook_url.clone() {
                    let processing_time_seconds =
                        (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
                    let encoder_id = self.identity.lock().await.encoder_id().to_string();
                    self.webhook.dispatch_completion(
                        url,
                        CompletionWebhook {
                            owner: job.metadata.owner.clone(),
                            permlink: job.metadata.permlink.clone(),
                            input_cid: job.input_uri.clone(),
                            status: "complete",
                            manifest_cid: outcome.result_cid,
                            video_url: outcome.master_playlist_uri,
                            job_id: job.id.clone(),
                            processing_time_seconds,
                            qualities_encoded: outcome.profiles.iter().map(|p| p.to_string()).collect(),
                            encoder_id,
                            timestamp: Utc::now(),
                        },
                    );
                }
            }
            Err(err) => {
                let message = err.to_string();
                {
                    let mut queue = self.queue.lock().await;
                    let _ = queue.fail(&job.id, message.clone(), false, ErrorKind::InputMediaFatal);
                }
                emit(&self.events, EngineEvent::state(&job.id, "failed"));

                if let Some(url) = job.webhook_url.clone() {
                    let encoder_id = self.identity.lock().await.encoder_id().to_string();
                    self.webhook.dispatch_failure(
                        url,
                        FailureWebhook {
                            owner: job.metadata.owner.clone(),
                            permlink: job.metadata.permlink.clone(),
                            input_cid: job.input_uri.clone(),
                            status: "failed",
                            job_id: job.id.clone(),
                            error: message,
                            encoder_id,
                            timestamp: Utc::now(),
                        },
                    );
                }
            }
        }
    }

    fn pin_failed_callback(&self, job_id: &str) -> Arc<dyn Fn(String) + Send + Sync> {
        let pin_queue = self.pin_queue.clone();
        let events = self.events.clone();
        let job_id = job_id.to_string();
        Arc::new(move |cid: String| {
            if let Err(err) = pin_queue.add(&cid, &job_id, 0.0, PinKind::Directory) {
                emit(&events, EngineEvent::Warning(format!(
                    "failed to record pending pin for {cid}: {err}"
                )));
            } else {
                emit(&events, EngineEvent::Info(format!("queued lazy pin for {cid}")));
            }
        })
    }

    /// spec.md §4.7.2, the Gateway-job state machine, Seen through Done.
    async fn run_gateway_job(&self, job: Job) {
        match self.drive_gateway_job(job.clone()).await {
            JobOutcome::Done => {
                emit(&self.events, EngineEvent::state(&job.id, "done"));
            }
            JobOutcome::RaceLost => {
                let mut queue = self.queue.lock().await;
                let _ = queue.fail(&job.id, "race lost".to_string(), false, ErrorKind::RaceLost);
                emit(&self.events, EngineEvent::state(&job.id, "race_lost"));
            }
            JobOutcome::Failed { message, report } => {
                if report {
                    let _ = self.gateway.fail(&job.id, &message).await;
                }
                let mut queue = self.queue.lock().await;
                let _ = queue.fail(&job.id, message, false, ErrorKind::InputMediaFatal);
                emit(&self.events, EngineEvent::state(&job.id, "failed"));
            }
            JobOutcome::Retry { message, kind } => {
                let mut queue = self.queue.lock().await;
                let _ = queue.fail(&job.id, message, true, kind);
                emit(&self.events, EngineEvent::state(&job.id, "retry_scheduled"));
            }
        }
    }

    async fn drive_gateway_job(&self, job: Job) -> JobOutcome {
        emit(&self.events, EngineEvent::state(&job.id, GatewayJobState::Seen.label()));
        let our_did = self.our_did().await;

        // 1. Seen -> OwnershipProbed
        let mut owned_already = false;
        match self.gateway.status(&job.id).await {
            Ok(status) => match &status.assigned_to {
                Some(owner) if threespeak_core::compare_dids(owner, &our_did).equal => {
                    owned_already = true;
                }
                Some(_other) => return JobOutcome::RaceLost,
                None => {}
            },
            Err(_) => {
                // Status call failed; attempt claim anyway (spec.md §4.7.2 step 1).
            }
        }
        emit(&self.events, EngineEvent::state(&job.id, GatewayJobState::OwnershipProbed.label()));

        // 2. OwnershipProbed -> Claimed
        let mut we_claimed_it = owned_already;
        if !owned_already {
            match self.gateway.claim(&job.id).await {
                Ok(()) => {
                    we_claimed_it = true;
                }
                Err(GatewayError::Classified { kind: ErrorKind::RaceLost, .. }) => {
                    return JobOutcome::RaceLost;
                }
                Err(err) => {
                    // Infrastructure failure: defensive takeover via C5 (spec.md §4.7.2 step 2).
                    match self.defensive_takeover(&job.id, &our_did).await {
                        Some(true) => we_claimed_it = true,
                        Some(false) => return JobOutcome::RaceLost,
                        None => {
                            return JobOutcome::Retry {
                                message: err.to_string(),
                                kind: err.kind(),
                            };
                        }
                    }
                }
            }
        }
        if !we_claimed_it {
            return JobOutcome::Failed {
                message: "could not establish ownership".to_string(),
                report: false,
            };
        }
        emit(&self.events, EngineEvent::state(&job.id, GatewayJobState::Claimed.label()));

        // 3. Claimed -> Verified
        match self.gateway.status(&job.id).await {
            Ok(status) => {
                if let Some(owner) = &status.assigned_to {
                    let cmp = threespeak_core::compare_dids(owner, &our_did);
                    if !cmp.equal {
                        if let Some(db) = &self.db {
                            match db.verify_ownership(&job.id, &our_did).await {
                                Ok(verification) if verification.is_owned => {}
                                _ => return JobOutcome::RaceLost,
                            }
                        } else {
                            return JobOutcome::Failed {
                                message: format!("status shows owner {owner}, not us"),
                                report: false,
                            };
                        }
                    }
                }
            }
            Err(_) => {
                // Re-read failed; proceed on the strength of the successful claim.
            }
        }
        emit(&self.events, EngineEvent::state(&job.id, GatewayJobState::Verified.label()));

        // 4. Verified -> Monitored
        if let Err(err) = self.gateway.ping(&job.id, 1.0, 100.0).await {
            emit(&self.events, EngineEvent::Warning(format!(
                "initial ping for {} failed (non-fatal): {err}", job.id
            )));
        }

        let cached = self.queue.lock().await.get_cached_result(&job.id).cloned();
        let outcome = if let Some(cached) = cached {
            TranscodeOutcome {
                result_cid: cached.result_cid,
                master_playlist_uri: cached.master_playlist_uri,
                duration_secs: 0.0,
                profiles: Vec::new(),
            }
        } else {
            let monitor_flag = Arc::new(AtomicBool::new(false));
            let monitor_handle = self.spawn_ownership_monitor(job.id.clone(), our_did.clone(), monitor_flag.clone());
            emit(&self.events, EngineEvent::state(&job.id, GatewayJobState::Monitored.label()));

            let on_progress = {
                let gateway = self.gateway.clone();
                let queue = self.queue.clone();
                let job_id = job.id.clone();
                Arc::new(move |pct: f64| {
                    let gateway = gateway.clone();
                    let queue = queue.clone();
                    let job_id = job_id.clone();
                    // Fire-and-forget: progress pings never block the job task
                    // and are never retained as pending promises (spec.md §5).
                    tokio::spawn(async move {
                        let _ = queue.lock().await.update_progress(&job_id, pct);
                        let _ = gateway.ping(&job_id, pct.max(1.0), pct).await;
                    });
                }) as Arc<dyn Fn(f64) + Send + Sync>
            };
            let on_pin_failed = self.pin_failed_callback(&job.id);

            let result = tokio::select! {
                result = self.transcoder.process(&job, on_progress, on_pin_failed) => Some(result),
                _ = wait_for_flag(monitor_flag.clone()) => None,
            };
            monitor_handle.abort();

            match result {
                None => return JobOutcome::RaceLost,
                Some(Err(err)) => {
                    return JobOutcome::Failed {
                        message: err.to_string(),
                        report: we_claimed_it,
                    };
                }
                Some(Ok(outcome)) => {
                    self.queue.lock().await.cache_result(
                        &job.id,
                        CachedResult {
                            result_cid: outcome.result_cid.clone(),
                            master_playlist_uri: outcome.master_playlist_uri.clone(),
                        },
                    );
                    outcome
                }
            }
        };
        emit(&self.events, EngineEvent::state(&job.id, GatewayJobState::Persisted.label()));

        match self.content_store.verify_persistence(&outcome.result_cid).await {
            Ok(true) => {}
            Ok(false) => emit(&self.events, EngineEvent::Warning(format!(
                "persistence verification failed for {} (advisory)", outcome.result_cid
            ))),
            Err(err) => emit(&self.events, EngineEvent::Warning(format!(
                "persistence verification error for {}: {err}", outcome.result_cid
            ))),
        }

        // 6. Persisted -> Reported
        match self.gateway.finish(&job.id, &outcome.result_cid).await {
            Ok(finish_outcome) => {
                let mut queue = self.queue.lock().await;
                let _ = queue.complete(&job.id, outcome.result_cid.clone());
                queue.clear_cached_result(&job.id);
                let _ = finish_outcome.duplicate;
                self.identity.lock().await.record_job_completed().ok();
                emit(&self.events, EngineEvent::state(&job.id, GatewayJobState::Reported.label()));
                JobOutcome::Done
            }
            Err(GatewayError::Classified { kind: ErrorKind::RaceLost, .. }) => JobOutcome::RaceLost,
            Err(err) => {
                if let Some(db) = &self.db {
                    if err.kind() != ErrorKind::RaceLost {
                        if db.force_complete(&job.id, &outcome.result_cid).await.is_ok() {
                            let mut queue = self.queue.lock().await;
                            let _ = queue.complete(&job.id, outcome.result_cid.clone());
                            queue.clear_cached_result(&job.id);
                            return JobOutcome::Done;
                        }
                    }
                }
                match err.kind() {
                    ErrorKind::TransientNetwork | ErrorKind::Ambiguous => JobOutcome::Retry {
                        message: err.to_string(),
                        kind: err.kind(),
                    },
                    _ => JobOutcome::Failed {
                        message: err.to_string(),
                        report: we_claimed_it,
                    },
                }
            }
        }
    }

    /// Infrastructure failure during claim: consult C5 if enabled
    /// (spec.md §4.7.2 step 2 "defensive takeover"). Returns `Some(true)`
    /// if we should proceed as owner, `Some(false)` for race-lost, `None`
    /// if the caller should retry later (DB disabled or also failing).
    async fn defensive_takeover(&self, job_id: &str, our_did: &str) -> Option<bool> {
        let db = self.db.as_ref()?;
        let verification = db.verify_ownership(job_id, our_did).await.ok()?;
        if !verification.exists {
            return Some(false);
        }
        match verification.actual_owner {
            None => {
                db.force_assign(job_id, our_did).await.ok()?;
                Some(true)
            }
            Some(owner) if threespeak_core::compare_dids(&owner, our_did).equal => Some(true),
            Some(_) => Some(false),
        }
    }

    /// Periodic ownership monitor: re-reads status every 60s; if assigned
    /// to another encoder, sets `flag` so the select! in
    /// `drive_gateway_job` aborts the encode cooperatively (spec.md
    /// §4.7.2 step 4, §5 "ownership monitor").
    fn spawn_ownership_monitor(
        &self,
        job_id: String,
        our_did: String,
        flag: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let gateway = self.gateway.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OWNERSHIP_MONITOR_INTERVAL);
            loop {
                ticker.tick().await;
                match gateway.status(&job_id).await {
                    Ok(status) => {
                        if let Some(owner) = status.assigned_to {
                            if !threespeak_core::compare_dids(&owner, &our_did).equal {
                                emit(&events, EngineEvent::Warning(format!(
                                    "ownership monitor: job {job_id} reassigned to {owner}, aborting"
                                )));
                                flag.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                    Err(_) => continue,
                }
            }
        })
    }
}

async fn wait_for_flag(flag: Arc<AtomicBool>) {
    loop {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn gateway_job_from_dto(dto: &threespeak_gateway_client::GatewayJobDto, _our_did: &str) -> Job {
    let mut profiles = BTreeSet::new();
    // The Gateway's getJob response doesn't name requested profiles per
    // spec.md §6; default to the full ladder and let `short` narrow it.
    profiles.insert("1080p".to_string());
    profiles.insert("720p".to_string());
    profiles.insert("480p".to_string());

    let now = Utc::now();
    Job {
        id: dto.job_id.clone(),
        origin: Origin::GatewayJob,
        status: threespeak_core::JobStatus::Queued,
        created_at: now,
        updated_at: now,
        input_uri: dto.input.uri.clone(),
        profiles_requested: profiles,
        metadata: threespeak_core::JobMetadata {
            owner: dto.metadata.video_owner.clone(),
            permlink: dto.metadata.video_permlink.clone(),
            app: dto.storage_metadata.app.clone(),
        },
        short: dto.short,
        progress_percent: 0.0,
        result_cid: None,
        last_error: None,
        webhook_url: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_job_state_labels_are_snake_case() {
        assert_eq!(GatewayJobState::OwnershipProbed.label(), "ownership_probed");
        assert_eq!(GatewayJobState::Monitored.label(), "monitored");
    }
}
