//! Advisory PID-based file lock with stale-lock recovery (spec.md §4.8
//! "Locking protocol"). A crash-recovery concern: if the process holding
//! the lock has died, a waiter must reclaim it rather than block forever.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock at {0}")]
    Timeout(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct LockGuard {
    path: PathBuf,
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Blocks (polling) until the OS advisory lock on `lock_path` can be
/// taken, reclaiming it if the PID recorded inside is no longer alive
/// (spec.md §4.8 "Locking protocol"). The OS lock alone already handles
/// the crash case (locks release on process exit); the PID payload is
/// kept for operator diagnostics and the documented stale-lock path.
/// Times out overall at 30s.
pub fn acquire(lock_path: &Path) -> Result<LockGuard, LockError> {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    let my_pid = std::process::id();

    loop {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut file = file;
                file.set_len(0)?;
                use std::io::Seek;
                file.seek(std::io::SeekFrom::Start(0))?;
                let _ = write!(file, "{my_pid}");
                return Ok(LockGuard {
                    path: lock_path.to_path_buf(),
                    file,
                });
            }
            Err(_) => {
                if let Some(holder_pid) = read_holder_pid(lock_path) {
                    if !pid_is_alive(holder_pid) {
                        let _ = fs::remove_file(lock_path);
                        continue;
                    }
                }
                if Instant::now() >= deadline {
                    return Err(LockError::Timeout(lock_path.display().to_string()));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn read_holder_pid(lock_path: &Path) -> Option<i32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn pid_is_alive(pid: i32) -> bool {
    // signal 0 performs no actual delivery, just existence/permission checks.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("pins.lock");
        let guard = acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
        drop(guard);
        assert!(!lock_path.exists());
    }

    #[test]
    fn reclaims_stale_lock_from_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("pins.lock");
        // A PID essentially guaranteed not to be alive in this test process tree.
        fs::write(&lock_path, "999999999").unwrap();
        let guard = acquire(&lock_path).unwrap();
        drop(guard);
    }
}
