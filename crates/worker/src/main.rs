//! Worker process entrypoint: wires the Job Lifecycle Engine (C9) and
//! its satellites — Identity (C1), Gateway Client (C4), Database
//! Verifier (C5), Job Queue (C6), Pending Pin Store (C7), Direct API
//! Server (C8), Webhook Dispatcher (C10), Memory Guard (C11), Lazy
//! Pinner (C12) — into a single running process (spec.md §2, §9
//! "Ambient singletons ... model as explicit dependencies passed at
//! construction").

mod config;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;

use threespeak_content_store::{ContentStoreClient, ContentStoreConfig};
use threespeak_db_verifier::DbVerifier;
use threespeak_direct_api::{disabled_response, router, DirectApiConfig};
use threespeak_engine::{EngineEvent, LazyPinner, LifecycleEngine, MemoryGuard, WebhookDispatcher};
use threespeak_gateway_client::{connectivity_probe, GatewayClient};
use threespeak_identity::Identity;
use threespeak_pin_queue::PendingPinStore;
use threespeak_queue::JobQueue;
use threespeak_transcoder::{Transcoder, TranscoderConfig};

use config::Cli;

/// How long we give the active job set to react to `reject` on graceful
/// shutdown before giving up on any individual call (spec.md §5
/// "attempt C4.Reject for each active job (best-effort, bounded)").
const SHUTDOWN_REJECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall bound on how long shutdown waits for the periodic activities
/// to wind down before the process exits anyway.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;

    let http = reqwest::Client::new();

    let identity = Identity::load_or_create(cli.identity_path(), &cli.display_name)?;
    println!(
        "threespeak-worker starting: did={} jobs_completed={}",
        identity.did(),
        identity.total_jobs_completed()
    );
    let identity = Arc::new(Mutex::new(identity));

    let gateway = Arc::new(GatewayClient::new(
        http.clone(),
        cli.gateway_url.clone(),
        identity.clone(),
    ));
    if connectivity_probe(&gateway).await {
        println!("gateway at {} is reachable", cli.gateway_url);
    } else {
        eprintln!(
            "warning: gateway at {} did not respond to the startup probe; \
             continuing (Direct API jobs still work, spec.md §4.1)",
            cli.gateway_url
        );
    }

    let db = match &cli.mongo_uri {
        Some(uri) => match DbVerifier::connect(uri, &cli.mongo_db, &cli.mongo_collection).await {
            Ok(db) => {
                println!("database verifier connected to {}/{}", cli.mongo_db, cli.mongo_collection);
                Some(Arc::new(db))
            }
            Err(err) => {
                eprintln!("warning: database verifier disabled, connect failed: {err}");
                None
            }
        },
        None => None,
    };

    let content_store = Arc::new(ContentStoreClient::new(
        http.clone(),
        ContentStoreConfig {
            gateway_base: cli.ipfs_gateway.clone(),
            daemon_base: cli.ipfs_daemon.clone(),
            remote_pin_base: cli.remote_pin_url.clone(),
            local_pin_fallback: cli.local_pin_fallback,
        },
    ));
    let peer_id = match content_store.peer_id().await {
        Ok(peer_id) => {
            println!("content store daemon peer id: {peer_id}");
            Some(peer_id)
        }
        Err(err) => {
            eprintln!("warning: could not reach content store daemon: {err}");
            None
        }
    };

    // Best-effort node registration (SPEC_FULL.md §3); named in spec.md §6's
    // interface table but not walked through in §4.7, so failure here must
    // never block startup (same rule as the Gateway connectivity probe).
    if let Err(err) = gateway
        .register_node(
            &cli.display_name,
            &serde_json::json!({}),
            peer_id.as_deref().unwrap_or(""),
            env!("CARGO_PKG_VERSION"),
        )
        .await
    {
        eprintln!("warning: gateway node registration failed (non-fatal): {err}");
    }

    let queue = Arc::new(Mutex::new(JobQueue::new(cli.max_concurrent)));
    let pin_queue = Arc::new(PendingPinStore::new(cli.pending_pins_path()));

    let transcoder = Arc::new(Transcoder::new(
        TranscoderConfig {
            ffmpeg_bin: cli.ffmpeg_bin.clone(),
            ffprobe_bin: cli.ffprobe_bin.clone(),
            work_dir: cli.work_dir(),
        },
        content_store.clone(),
    ));

    let (events_tx, mut events_rx) = threespeak_engine::channel();
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(EngineEvent::Info(msg)) => println!("[info] {msg}"),
                Ok(EngineEvent::Warning(msg)) => eprintln!("[warn] {msg}"),
                Ok(EngineEvent::Error(msg)) => eprintln!("[error] {msg}"),
                Ok(EngineEvent::JobStateChanged { job_id, state, at }) => {
                    println!("[job] {job_id} -> {state} at {at}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("[warn] event log dropped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let webhook = Arc::new(WebhookDispatcher::new(http.clone(), events_tx.clone()));

    let engine = Arc::new(LifecycleEngine::new(
        identity.clone(),
        gateway.clone(),
        db,
        queue.clone(),
        pin_queue.clone(),
        content_store.clone(),
        transcoder,
        webhook,
        events_tx.clone(),
    ));
    let engine_handle = tokio::spawn(engine.clone().run());

    let shutdown_rx = shutdown::install();

    let memory_guard_handle = tokio::spawn(MemoryGuard::new(events_tx.clone()).run(shutdown_rx.clone()));
    let lazy_pinner_handle = tokio::spawn(
        LazyPinner::new(content_store.clone(), pin_queue.clone(), queue.clone(), events_tx.clone())
            .run(shutdown_rx.clone()),
    );

    let direct_api_handle = if cli.direct_api_disabled {
        println!("direct api disabled by configuration");
        let app = disabled_response();
        spawn_http_server(app, cli.direct_api_port, shutdown_rx.clone())
    } else {
        let api_key = cli.direct_api_key.clone().unwrap_or_else(|| {
            eprintln!("warning: no --direct-api-key set; generating an ephemeral one");
            uuid_v4_like()
        });
        let app = router(queue.clone(), DirectApiConfig { api_key });
        println!("direct api listening on 0.0.0.0:{}", cli.direct_api_port);
        spawn_http_server(app, cli.direct_api_port, shutdown_rx.clone())
    };

    // Race the graceful-shutdown signal against a hard memory-guard
    // breach (spec.md §4.9 "kill ... and exit the process with a
    // non-zero code so the supervisor restarts it").
    let mut shutdown_rx_wait = shutdown_rx.clone();
    tokio::select! {
        _ = shutdown_rx_wait.changed() => {
            println!("shutdown signal received, stopping gracefully");
        }
        result = memory_guard_handle => {
            if matches!(result, Ok(true)) {
                eprintln!("memory guard forced a restart");
                std::process::exit(1);
            }
        }
    }

    engine.request_stop();
    reject_active_jobs(&queue, &gateway).await;

    let join_all = async {
        let _ = engine_handle.await;
        let _ = lazy_pinner_handle.await;
        let _ = direct_api_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, join_all).await.is_err() {
        eprintln!("warning: shutdown timed out waiting for periodic activities");
    }

    Ok(())
}

/// spec.md §5 "Shutdown: stop accepting new jobs; attempt C4.Reject for
/// each active job (best-effort, bounded)".
async fn reject_active_jobs(queue: &Arc<Mutex<JobQueue>>, gateway: &Arc<GatewayClient>) {
    let active_gateway_jobs: Vec<String> = {
        let queue = queue.lock().await;
        queue
            .active_ids()
            .filter(|id| {
                queue
                    .get(id)
                    .map(|job| job.origin == threespeak_core::Origin::GatewayJob)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    };
    for id in active_gateway_jobs {
        let _ = tokio::time::timeout(SHUTDOWN_REJECT_TIMEOUT, gateway.reject(&id)).await;
    }
}

fn spawn_http_server(
    app: axum::Router,
    port: u16,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                eprintln!("error: failed to bind direct api port {port}: {err}");
                return;
            }
        };
        let shutdown_signal = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            eprintln!("error: direct api server failed: {err}");
        }
    })
}

fn uuid_v4_like() -> String {
    uuid::Uuid::new_v4().to_string()
}
