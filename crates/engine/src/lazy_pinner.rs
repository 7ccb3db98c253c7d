//! C12 Lazy Pinner — idle-time scan of the Pending Pin Store (C7);
//! attempts pinning via the Content Store Client (C2) whenever no jobs
//! are active (spec.md §4.8).
//!
//! Runs independently of the Lifecycle Engine's own periodic activities:
//! it only needs to know whether the active set is empty, never mutates
//! a `Job` itself (spec.md §3 "Ownership semantics" — C7 is the sole
//! owner of its own records).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use threespeak_content_store::ContentStoreClient;
use threespeak_pin_queue::PendingPinStore;
use threespeak_queue::JobQueue;

use crate::event::{emit, EngineEvent, EventSender};

pub const SCAN_INTERVAL: Duration = Duration::from_secs(2 * 60);

pub struct LazyPinner {
    content_store: Arc<ContentStoreClient>,
    pin_queue: Arc<PendingPinStore>,
    queue: Arc<Mutex<JobQueue>>,
    events: EventSender,
}

impl LazyPinner {
    pub fn new(
        content_store: Arc<ContentStoreClient>,
        pin_queue: Arc<PendingPinStore>,
        queue: Arc<Mutex<JobQueue>>,
        events: EventSender,
    ) -> Self {
        Self {
            content_store,
            pin_queue,
            queue,
            events,
        }
    }

    /// One scan: attempts a single pending pin if the worker is otherwise
    /// idle (spec.md §4.8 "When the active set is empty AND the
    /// pending-pin store is non-empty, pop the oldest eligible record").
    async fn scan_once(&self) {
        let active = self.queue.lock().await.len_active();
        if active > 0 {
            return;
        }

        let next = match self.pin_queue.next_ready() {
            Ok(next) => next,
            Err(err) => {
                emit(&self.events, EngineEvent::Warning(format!(
                    "lazy pinner: failed to read pending pin store: {err}"
                )));
                return;
            }
        };
        let Some(entry) = next else { return };

        let outcome = self.content_store.pin_and_announce(&entry.cid).await;
        if outcome.pinned {
            if let Err(err) = self.pin_queue.mark_success(&entry.cid) {
                emit(&self.events, EngineEvent::Warning(format!(
                    "lazy pinner: mark_success({}) failed: {err}", entry.cid
                )));
            } else {
                emit(&self.events, EngineEvent::Info(format!(
                    "lazy pinner: pinned {} (originating job {})", entry.cid, entry.originating_job_id
                )));
            }
        } else if let Err(err) = self.pin_queue.mark_failed(&entry.cid) {
            emit(&self.events, EngineEvent::Warning(format!(
                "lazy pinner: mark_failed({}) failed: {err}", entry.cid
            )));
        }
    }

    /// Periodic loop; stops when `shutdown` resolves (spec.md §5
    /// "unblock any pending pins" on shutdown — we simply stop scanning
    /// rather than abandon an in-flight pin attempt mid-way).
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threespeak_pin_queue::PinKind;

    fn http_client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn skips_scan_when_jobs_active() {
        let dir = tempfile::tempdir().unwrap();
        let pin_queue = Arc::new(PendingPinStore::new(dir.path().join("pending_pins.json")));
        pin_queue.add("QmA", "job1", 1.0, PinKind::File).unwrap();

        let content_store = Arc::new(ContentStoreClient::new(
            http_client(),
            threespeak_content_store::ContentStoreConfig {
                gateway_base: "http://127.0.0.1:1".to_string(),
                daemon_base: "http://127.0.0.1:1".to_string(),
                remote_pin_base: None,
                local_pin_fallback: false,
            },
        ));
        let mut queue = JobQueue::new(1);
        queue.add_gateway(test_job("running-job"));
        let _ = queue.next();
        let queue = Arc::new(Mutex::new(queue));

        let (tx, _rx) = crate::event::channel();
        let pinner = LazyPinner::new(content_store, pin_queue.clone(), queue, tx);
        pinner.scan_once().await;

        // Active set is non-empty, so the pending pin must still be there.
        assert_eq!(pin_queue.stats().unwrap().total, 1);
    }

    fn test_job(id: &str) -> threespeak_core::Job {
        use std::collections::BTreeSet;
        threespeak_core::Job {
            id: id.to_string(),
            origin: threespeak_core::Origin::GatewayJob,
            status: threespeak_core::JobStatus::Queued,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            input_uri: "ipfs://QmIn".to_string(),
            profiles_requested: BTreeSet::new(),
            metadata: threespeak_core::JobMetadata::default(),
            short: false,
            progress_percent: 0.0,
            result_cid: None,
            last_error: None,
            webhook_url: None,
        }
    }
}
