//! SIGINT/SIGTERM handling (spec.md §6 "Process signals"), grounded on
//! the teacher's ctrl-c handler (`crates/client/src/shutdown.rs`) but
//! widened: a worker process runs unattended under a supervisor, so both
//! signals must trigger the same graceful shutdown, not only the
//! interactive one. The teacher's two-stage pattern — first signal asks
//! nicely, a second forces an immediate exit — is kept: a stuck shutdown
//! (e.g. an encoder child that won't die) must not hang the process
//! forever.

use tokio::sync::watch;

/// Resolves once the first SIGINT/SIGTERM is received. Other components
/// already select on this `watch` receiver (memory guard, lazy pinner,
/// direct API) so a single signal fans out to every periodic activity.
/// A second signal exits the process immediately (code 130, matching the
/// conventional SIGINT exit status).
pub fn install() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
        wait_for_signal().await;
        eprintln!("second shutdown signal received, exiting immediately");
        std::process::exit(130);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
