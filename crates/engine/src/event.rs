//! Process-level logging is an external collaborator (spec.md §1): the
//! engine threads structured events out through a broadcast channel and
//! leaves printing/shipping them to the binary.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Info(String),
    Warning(String),
    Error(String),
    JobStateChanged {
        job_id: String,
        state: &'static str,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn state(job_id: impl Into<String>, state: &'static str) -> Self {
        EngineEvent::JobStateChanged {
            job_id: job_id.into(),
            state,
            at: Utc::now(),
        }
    }
}

/// Channel capacity large enough to absorb a burst of per-job transitions
/// between the binary's drain ticks without blocking senders.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type EventSender = broadcast::Sender<EngineEvent>;
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Sends best-effort; a full or receiver-less channel must never block or
/// fail the caller (spec.md's ambient logging is advisory, not load-bearing).
pub fn emit(tx: &EventSender, event: EngineEvent) {
    let _ = tx.send(event);
}
