//! C7 Pending Pin Store — a durable, file-locked queue of CIDs awaiting
//! background pinning, and the record shape C12 (Lazy Pinner) drains
//! (spec.md §3 "Pending pin", §4.8).

mod lock;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

pub use lock::LockError;

/// Entry cap; oldest evicted at overflow (spec.md §3, §4.8).
pub const MAX_ENTRIES: usize = 1000;
/// Records older than this are evicted regardless of attempts remaining.
pub const RETENTION: ChronoDuration = ChronoDuration::weeks(1);
/// Records whose attempts reach this are evicted permanently.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPin {
    pub cid: String,
    pub originating_job_id: String,
    pub added_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub size_mb: f64,
    pub kind: PinKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinQueueStats {
    pub total: usize,
    pub never_attempted: usize,
    pub oldest_added_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PinQueueError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    entries: Vec<PendingPin>,
}

pub struct PendingPinStore {
    data_path: PathBuf,
    lock_path: PathBuf,
}

impl PendingPinStore {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        let data_path = data_path.into();
        let lock_path = data_path.with_extension("lock");
        Self { data_path, lock_path }
    }

    fn with_store<R>(
        &self,
        f: impl FnOnce(&mut Vec<PendingPin>) -> R,
    ) -> Result<R, PinQueueError> {
        let _guard = lock::acquire(&self.lock_path)?;
        let mut file = self.read()?;
        evict(&mut file.entries);
        let result = f(&mut file.entries);
        evict(&mut file.entries);
        self.write(&file)?;
        Ok(result)
    }

    fn read(&self) -> Result<StoreFile, PinQueueError> {
        if !self.data_path.exists() {
            return Ok(StoreFile::default());
        }
        let raw = fs::read_to_string(&self.data_path)?;
        if raw.trim().is_empty() {
            return Ok(StoreFile::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write(&self, file: &StoreFile) -> Result<(), PinQueueError> {
        if let Some(parent) = self.data_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        let tmp = self.data_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.data_path)?;
        Ok(())
    }

    /// Adds a pending pin; if already present (by cid), refreshes
    /// `added_at`/`size_mb`/`kind` rather than duplicating the record
    /// (spec.md §8 "Uploading the same directory twice ... a pending-pin
    /// record is not duplicated").
    pub fn add(
        &self,
        cid: impl Into<String>,
        originating_job_id: impl Into<String>,
        size_mb: f64,
        kind: PinKind,
    ) -> Result<(), PinQueueError> {
        let cid = cid.into();
        let job_id = originating_job_id.into();
        self.with_store(|entries| {
            if let Some(existing) = entries.iter_mut().find(|e| e.cid == cid) {
                existing.size_mb = size_mb;
                existing.kind = kind;
                return;
            }
            if entries.len() >= MAX_ENTRIES {
                // Oldest evicted at overflow.
                if let Some((idx, _)) = entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.added_at)
                {
                    entries.remove(idx);
                }
            }
            entries.push(PendingPin {
                cid,
                originating_job_id: job_id,
                added_at: Utc::now(),
                attempts: 0,
                last_attempt: None,
                size_mb,
                kind,
            });
        })
    }

    /// Pops the oldest eligible record for a pin attempt (does not remove
    /// it; the caller reports back via `mark_success`/`mark_failed`).
    pub fn next_ready(&self) -> Result<Option<PendingPin>, PinQueueError> {
        self.with_store(|entries| {
            entries
                .iter()
                .min_by_key(|e| e.added_at)
                .cloned()
        })
    }

    pub fn mark_success(&self, cid: &str) -> Result<(), PinQueueError> {
        self.with_store(|entries| {
            entries.retain(|e| e.cid != cid);
        })
    }

    /// Records a failed attempt; the record is evicted once it reaches
    /// `MAX_ATTEMPTS` (spec.md §4.8 "Records whose attempts reach max are
    /// evicted permanently").
    pub fn mark_failed(&self, cid: &str) -> Result<(), PinQueueError> {
        self.with_store(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.cid == cid) {
                entry.attempts += 1;
                entry.last_attempt = Some(Utc::now());
            }
        })
    }

    /// Evicts attempts-exhausted and retention-expired records; normal
    /// path already evicts on every call, this exposes it as a standalone
    /// operation for periodic maintenance.
    pub fn cleanup(&self) -> Result<usize, PinQueueError> {
        self.with_store(|entries| {
            let before = entries.len();
            evict(entries);
            before - entries.len()
        })
    }

    pub fn stats(&self) -> Result<PinQueueStats, PinQueueError> {
        self.with_store(|entries| PinQueueStats {
            total: entries.len(),
            never_attempted: entries.iter().filter(|e| e.attempts == 0).count(),
            oldest_added_at: entries.iter().map(|e| e.added_at).min(),
        })
    }

    pub fn is_empty(&self) -> Result<bool, PinQueueError> {
        Ok(self.stats()?.total == 0)
    }

    #[cfg(test)]
    pub(crate) fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

fn evict(entries: &mut Vec<PendingPin>) {
    let cutoff = Utc::now() - RETENTION;
    entries.retain(|e| e.attempts < MAX_ATTEMPTS && e.added_at >= cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_next_ready_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingPinStore::new(dir.path().join("pending_pins.json"));
        store.add("QmA", "job1", 12.5, PinKind::Directory).unwrap();
        let next = store.next_ready().unwrap().unwrap();
        assert_eq!(next.cid, "QmA");
        store.mark_success("QmA").unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn add_is_idempotent_per_cid() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingPinStore::new(dir.path().join("pending_pins.json"));
        store.add("QmA", "job1", 1.0, PinKind::File).unwrap();
        store.add("QmA", "job1", 2.0, PinKind::File).unwrap();
        assert_eq!(store.stats().unwrap().total, 1);
    }

    #[test]
    fn mark_failed_evicts_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingPinStore::new(dir.path().join("pending_pins.json"));
        store.add("QmA", "job1", 1.0, PinKind::File).unwrap();
        for _ in 0..MAX_ATTEMPTS {
            store.mark_failed("QmA").unwrap();
        }
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn lock_file_cleaned_up_after_operation() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingPinStore::new(dir.path().join("pending_pins.json"));
        store.add("QmA", "job1", 1.0, PinKind::File).unwrap();
        assert!(!store.lock_path().exists());
    }
}
