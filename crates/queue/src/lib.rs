//! C6 Job Queue — the in-memory FIFO of pending jobs, the active set, the
//! retry scheduler, and the smart-retry result cache (spec.md §4.5).
//!
//! Single-writer discipline (spec.md §5 "Shared-resource policy"): every
//! mutation goes through `&mut self`. The Lifecycle Engine (C9) is the one
//! caller and serializes access itself (e.g. behind a `tokio::sync::Mutex`);
//! this crate does not do its own locking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;

use threespeak_core::{CachedResult, ErrorKind, Job, JobStatus, Origin, RetryRecord};

/// Default retry budget for a job that has not specified its own.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base retry delay; 5xx/infrastructure failures get a shorter delay
/// (spec.md §4.5 "Retry policy").
pub const RETRY_BASE: Duration = Duration::from_secs(30);
const RETRY_BASE_5XX_CAP: Duration = Duration::from_secs(2 * 60);

/// Default job-age cleanup horizon.
pub const DEFAULT_CLEANUP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} already queued or active")]
    Duplicate(String),
}

/// Minimal shape of a Direct-API submission, translated into a `Job` by
/// `add_direct` (spec.md §4.7.1).
#[derive(Debug, Clone)]
pub struct DirectJobRequest {
    pub id: String,
    pub input_uri: String,
    pub profiles_requested: std::collections::BTreeSet<String>,
    pub metadata: threespeak_core::JobMetadata,
    pub short: bool,
    pub webhook_url: Option<String>,
}

pub struct JobQueue {
    max_concurrent: usize,
    pending: VecDeque<String>,
    jobs: HashMap<String, Job>,
    active: HashSet<String>,
    retries: HashMap<String, RetryRecord>,
    cached_results: HashMap<String, CachedResult>,
}

impl JobQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            pending: VecDeque::new(),
            jobs: HashMap::new(),
            active: HashSet::new(),
            retries: HashMap::new(),
            cached_results: HashMap::new(),
        }
    }

    pub fn len_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn len_active(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Ids currently in the active set, for callers that need to act on
    /// every running job without mutating queue state (e.g. shutdown's
    /// best-effort `Reject` sweep, spec.md §5).
    pub fn active_ids(&self) -> impl Iterator<Item = &String> {
        self.active.iter()
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max_concurrent
    }

    /// `AddGateway`: a no-op (deduplication) if the job id is already known
    /// anywhere in {pending queue, active set, retry set} (spec.md §3
    /// invariant, §8 idempotence).
    pub fn add_gateway(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);
        self.pending.push_back(id);
        true
    }

    pub fn add_direct(&mut self, req: DirectJobRequest) -> Job {
        let now = Utc::now();
        let job = Job {
            id: req.id.clone(),
            origin: Origin::DirectJob,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            input_uri: req.input_uri,
            profiles_requested: req.profiles_requested,
            metadata: req.metadata,
            short: req.short,
            progress_percent: 0.0,
            result_cid: None,
            last_error: None,
            webhook_url: req.webhook_url,
        };
        self.jobs.insert(job.id.clone(), job.clone());
        self.pending.push_back(job.id.clone());
        job
    }

    /// `Next`: pops the head of the FIFO if under `maxConcurrent`, moving
    /// it into the active set.
    pub fn next(&mut self) -> Option<Job> {
        if !self.has_capacity() {
            return None;
        }
        let id = self.pending.pop_front()?;
        self.active.insert(id.clone());
        if let Some(job) = self.jobs.get_mut(&id) {
            job.status = JobStatus::Running;
            job.touch();
            return Some(job.clone());
        }
        None
    }

    pub fn update_progress(&mut self, id: &str, pct: f64) -> Result<(), QueueError> {
        let job = self.jobs.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.progress_percent = pct.clamp(0.0, 100.0);
        job.touch();
        Ok(())
    }

    /// `Complete`: terminal success. `resultCID` set iff status is
    /// Complete (spec.md §3 invariant).
    pub fn complete(&mut self, id: &str, result_cid: String) -> Result<(), QueueError> {
        let job = self.jobs.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.status = JobStatus::Complete;
        job.result_cid = Some(result_cid);
        job.progress_percent = 100.0;
        job.touch();
        self.active.remove(id);
        self.retries.remove(id);
        self.cached_results.remove(id);
        Ok(())
    }

    /// `Fail`: if `can_retry` and attempts remain, re-queues with a
    /// computed backoff; otherwise the job is terminally Failed
    /// (spec.md §4.5, §7 "Propagation rule" — the caller already decided
    /// retryability, this just applies the schedule).
    pub fn fail(&mut self, id: &str, err: impl Into<String>, can_retry: bool, kind: ErrorKind) -> Result<bool, QueueError> {
        let err_msg = err.into();
        self.active.remove(id);
        let job = self.jobs.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.last_error = Some(err_msg.clone());
        job.touch();

        let retry = self
            .retries
            .entry(id.to_string())
            .or_insert_with(|| RetryRecord::new(DEFAULT_MAX_ATTEMPTS));
        retry.attempts += 1;
        retry.last_attempt = Some(Utc::now());
        retry.error_history.push(err_msg);

        if can_retry && !retry.exhausted() {
            let delay = retry_delay(kind);
            retry.next_retry = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap());
            job.status = JobStatus::Queued;
            Ok(true)
        } else {
            job.status = JobStatus::Failed;
            self.cached_results.remove(id);
            Ok(false)
        }
    }

    /// Moves every job whose `nextRetry` has passed back into the pending
    /// FIFO, exactly once per invocation (spec.md §4.5).
    pub fn process_retries(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut ready = Vec::new();
        for (id, retry) in self.retries.iter_mut() {
            if matches!(retry.next_retry, Some(t) if t <= now) {
                retry.next_retry = None;
                ready.push(id.clone());
            }
        }
        for id in &ready {
            if !self.pending.contains(id) {
                self.pending.push_back(id.clone());
            }
        }
        ready
    }

    /// Any id in the active set whose `updatedAt` precedes
    /// `now - max_active` (spec.md §4.5 "Stuck detection").
    pub fn detect_stuck(&self, max_active: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_active).unwrap();
        self.active
            .iter()
            .filter(|id| self.jobs.get(*id).map(|j| j.updated_at < cutoff).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn abandon(&mut self, id: &str, reason: impl Into<String>) -> Result<(), QueueError> {
        let job = self.jobs.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.status = JobStatus::Failed;
        job.last_error = Some(reason.into());
        job.touch();
        self.active.remove(id);
        self.retries.remove(id);
        self.cached_results.remove(id);
        Ok(())
    }

    pub fn cache_result(&mut self, id: &str, result: CachedResult) {
        self.cached_results.insert(id.to_string(), result);
    }

    pub fn get_cached_result(&self, id: &str) -> Option<&CachedResult> {
        self.cached_results.get(id)
    }

    pub fn clear_cached_result(&mut self, id: &str) {
        self.cached_results.remove(id);
    }

    /// Drops terminal jobs (Complete/Failed) older than `max_age`, freeing
    /// the in-memory job map.
    pub fn cleanup(&mut self, max_age: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap();
        let stale: Vec<String> = self
            .jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Complete | JobStatus::Failed) && j.updated_at < cutoff
            })
            .map(|j| j.id.clone())
            .collect();
        for id in stale {
            self.jobs.remove(&id);
            self.retries.remove(&id);
            self.cached_results.remove(&id);
        }
    }
}

fn retry_delay(kind: ErrorKind) -> Duration {
    if matches!(kind, ErrorKind::TransientNetwork | ErrorKind::ContentStoreTransient) {
        RETRY_BASE.mul_f64(0.5).min(RETRY_BASE_5XX_CAP)
    } else {
        RETRY_BASE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use threespeak_core::JobMetadata;

    fn gw_job(id: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            origin: Origin::GatewayJob,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            input_uri: "ipfs://Qm".to_string(),
            profiles_requested: BTreeSet::new(),
            metadata: JobMetadata::default(),
            short: false,
            progress_percent: 0.0,
            result_cid: None,
            last_error: None,
            webhook_url: None,
        }
    }

    #[test]
    fn add_gateway_dedups() {
        let mut q = JobQueue::new(2);
        assert!(q.add_gateway(gw_job("a")));
        assert!(!q.add_gateway(gw_job("a")));
        assert_eq!(q.len_pending(), 1);
    }

    #[test]
    fn next_respects_max_concurrent() {
        let mut q = JobQueue::new(1);
        q.add_gateway(gw_job("a"));
        q.add_gateway(gw_job("b"));
        assert!(q.next().is_some());
        assert!(q.next().is_none());
        assert_eq!(q.len_active(), 1);
    }

    #[test]
    fn complete_sets_result_cid_and_clears_active() {
        let mut q = JobQueue::new(2);
        q.add_gateway(gw_job("a"));
        q.next();
        q.complete("a", "QmResult".to_string()).unwrap();
        let job = q.get("a").unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.result_cid.as_deref(), Some("QmResult"));
        assert_eq!(q.len_active(), 0);
    }

    #[test]
    fn fail_requeues_when_retryable_and_under_budget() {
        let mut q = JobQueue::new(2);
        q.add_gateway(gw_job("a"));
        q.next();
        let requeued = q.fail("a", "boom", true, ErrorKind::TransientNetwork).unwrap();
        assert!(requeued);
        assert_eq!(q.get("a").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn fail_terminal_when_not_retryable() {
        let mut q = JobQueue::new(2);
        q.add_gateway(gw_job("a"));
        q.next();
        let requeued = q.fail("a", "boom", false, ErrorKind::StateConflict).unwrap();
        assert!(!requeued);
        assert_eq!(q.get("a").unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn fail_exhausts_after_max_attempts() {
        let mut q = JobQueue::new(2);
        q.add_gateway(gw_job("a"));
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            q.next();
            q.fail("a", "boom", true, ErrorKind::TransientNetwork).unwrap();
            q.process_retries();
        }
        assert_eq!(q.get("a").unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn detect_stuck_finds_old_active_jobs() {
        let mut q = JobQueue::new(2);
        q.add_gateway(gw_job("a"));
        q.next();
        // `next()` stamps `updated_at` at activation time; age it afterwards
        // to simulate a job that has since gone an hour without progress.
        q.jobs.get_mut("a").unwrap().updated_at = Utc::now() - chrono::Duration::hours(2);
        let stuck = q.detect_stuck(Duration::from_secs(3600));
        assert_eq!(stuck, vec!["a".to_string()]);
    }

    #[test]
    fn detect_stuck_ignores_recently_activated_jobs() {
        let mut q = JobQueue::new(2);
        q.add_gateway(gw_job("a"));
        q.next();
        let stuck = q.detect_stuck(Duration::from_secs(3600));
        assert!(stuck.is_empty());
    }

    #[test]
    fn cached_result_round_trips() {
        let mut q = JobQueue::new(2);
        q.cache_result(
            "a",
            CachedResult {
                result_cid: "Qm1".to_string(),
                master_playlist_uri: "ipfs://Qm1/manifest.m3u8".to_string(),
            },
        );
        assert!(q.get_cached_result("a").is_some());
        q.clear_cached_result("a");
        assert!(q.get_cached_result("a").is_none());
    }
}
