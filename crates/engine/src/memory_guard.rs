//! C11 Memory Guard — periodic heap sampler that warns above a soft
//! threshold and kills runaway encoder children + exits above a hard
//! threshold (spec.md §4.9). `sysinfo` also backs the Lazy Pinner's host
//! probe pattern elsewhere in the pack; here it doubles as the child-kill
//! mechanism since ffmpeg children aren't otherwise tracked by pid.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

use crate::event::{emit, EngineEvent, EventSender};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const SOFT_THRESHOLD_BYTES: u64 = 1_500 * 1024 * 1024;
pub const HARD_THRESHOLD_BYTES: u64 = 10_000 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Ok,
    Soft,
    Hard,
}

pub struct MemoryGuard {
    system: System,
    soft_threshold: u64,
    hard_threshold: u64,
    events: EventSender,
}

impl MemoryGuard {
    pub fn new(events: EventSender) -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
            ),
            soft_threshold: SOFT_THRESHOLD_BYTES,
            hard_threshold: HARD_THRESHOLD_BYTES,
            events,
        }
    }

    #[cfg(test)]
    fn with_thresholds(events: EventSender, soft: u64, hard: u64) -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
            ),
            soft_threshold: soft,
            hard_threshold: hard,
            events,
        }
    }

    fn own_memory_bytes(&mut self) -> u64 {
        self.system.refresh_processes();
        let pid = Pid::from_u32(std::process::id());
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn classify(&self, bytes: u64) -> GuardAction {
        if bytes >= self.hard_threshold {
            GuardAction::Hard
        } else if bytes >= self.soft_threshold {
            GuardAction::Soft
        } else {
            GuardAction::Ok
        }
    }

    /// Kills every direct child process named like an encoder binary
    /// (spec.md §4.9 "kill all external encoder child processes").
    fn kill_encoder_children(&mut self) {
        self.system.refresh_processes();
        let our_pid = Pid::from_u32(std::process::id());
        for (pid, process) in self.system.processes() {
            let is_ours = process.parent() == Some(our_pid);
            let looks_like_encoder = process
                .name()
                .to_ascii_lowercase()
                .contains("ffmpeg");
            if is_ours && looks_like_encoder {
                emit(
                    &self.events,
                    EngineEvent::Warning(format!("memory guard killing child process {pid}")),
                );
                process.kill();
            }
        }
    }

    /// Runs the periodic sampling loop until `shutdown` resolves. Returns
    /// `true` if a hard breach occurred and the process should exit
    /// non-zero so the supervisor restarts it.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> bool {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let bytes = self.own_memory_bytes();
                    match self.classify(bytes) {
                        GuardAction::Ok => {}
                        GuardAction::Soft => {
                            emit(
                                &self.events,
                                EngineEvent::Warning(format!(
                                    "memory guard: heap at {} MB exceeds soft threshold",
                                    bytes / (1024 * 1024)
                                )),
                            );
                        }
                        GuardAction::Hard => {
                            emit(
                                &self.events,
                                EngineEvent::Error(format!(
                                    "memory guard: heap at {} MB exceeds hard threshold, restarting",
                                    bytes / (1024 * 1024)
                                )),
                            );
                            self.kill_encoder_children();
                            return true;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_thresholds() {
        let (tx, _rx) = crate::event::channel();
        let guard = MemoryGuard::with_thresholds(tx, 100, 1000);
        assert_eq!(guard.classify(50), GuardAction::Ok);
        assert_eq!(guard.classify(500), GuardAction::Soft);
        assert_eq!(guard.classify(1000), GuardAction::Hard);
    }
}
