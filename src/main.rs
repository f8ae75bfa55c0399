//! Entry point for the user-space scheduling agent: loads configuration,
//! attaches to the kernel bridge, and runs the dispatcher loop on a
//! dedicated thread alongside the strategy-refresh and metrics-egress
//! tasks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use kernel_bridge::bpf::BpfKernelBridge;
use kernel_bridge::mock::MockKernelBridge;
use kernel_bridge::{BssSnapshot, KernelBridge};
use mimalloc_rust::GlobalMiMalloc;
use sched_core::dispatcher::{DispatchOutcome, DispatcherConfig};
use sched_core::Dispatcher;
use strategy::{PriorityCpuTracker, StrategyStore};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL_MIMALLOC: GlobalMiMalloc = GlobalMiMalloc;

#[derive(Parser, Debug)]
#[command(name = "usersched", about = "User-space scheduling agent")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "usersched.yaml")]
    config: PathBuf,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = config::Config::load(&args.config)?;
    tracing::info!(config = ?config, "loaded configuration");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: config::Config) -> color_eyre::Result<()> {
    let strategy_store = Arc::new(StrategyStore::new());
    let priority_cpu_tracker = Arc::new(PriorityCpuTracker::new());
    let bss_snapshot = Arc::new(Mutex::new(BssSnapshot::default()));
    let stop = Arc::new(AtomicBool::new(false));
    let shutdown = CancellationToken::new();

    let dispatcher_handle = spawn_dispatcher(
        config.clone(),
        Arc::clone(&strategy_store),
        Arc::clone(&priority_cpu_tracker),
        Arc::clone(&bss_snapshot),
        Arc::clone(&stop),
    );

    let control_plane_task = if config.api.enabled {
        Some(tokio::spawn(control_plane_loop(
            config.clone(),
            Arc::clone(&strategy_store),
            Arc::clone(&bss_snapshot),
            shutdown.clone(),
        )))
    } else {
        tracing::info!("control plane disabled, running with strategies only from defaults");
        None
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining dispatcher");

    stop.store(true, Ordering::SeqCst);
    shutdown.cancel();

    if let Some(task) = control_plane_task {
        let _ = task.await;
    }

    match dispatcher_handle.join() {
        Ok(()) => tracing::info!("dispatcher exited cleanly"),
        Err(_) => tracing::error!("dispatcher thread panicked"),
    }

    Ok(())
}

/// The dispatcher runs on its own OS thread rather than as a tokio task:
/// its loop is a tight, serial, CPU-bound hot path with a single blocking
/// suspension point when the ready pool runs dry.
fn spawn_dispatcher(
    config: config::Config,
    strategy_store: Arc<StrategyStore>,
    priority_cpu_tracker: Arc<PriorityCpuTracker>,
    bss_snapshot: Arc<Mutex<BssSnapshot>>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || {
            let dispatcher_config = DispatcherConfig {
                slice_ns_default: config.scheduler.slice_ns_default,
                slice_ns_min: config.scheduler.slice_ns_min,
                total_cpus: num_cpus(),
            };

            let bridge = build_kernel_bridge(&config);
            let mode = match config.scheduler.mode {
                config::SchedulerMode::Gthulhu => sched_core::Mode::Gthulhu,
                config::SchedulerMode::Simple => sched_core::Mode::Simple,
            };
            let mut dispatcher = Dispatcher::new(
                bridge,
                mode,
                config.scheduler.slice_ns_default,
                strategy_store,
                priority_cpu_tracker,
                dispatcher_config,
            );
            dispatcher.mark_attached();

            let mut iterations_since_bss_read: u32 = 0;
            loop {
                if stop.load(Ordering::SeqCst) {
                    dispatcher.begin_drain();
                }

                match dispatcher.run_once() {
                    Ok(DispatchOutcome::Dispatched(_)) => {}
                    Ok(DispatchOutcome::Idle) => {
                        if dispatcher.state() == sched_core::DispatcherState::Exited {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "dispatcher iteration failed, exiting");
                        break;
                    }
                }

                iterations_since_bss_read += 1;
                if iterations_since_bss_read >= 128 {
                    iterations_since_bss_read = 0;
                    if let Ok(snapshot) = dispatcher.read_bss() {
                        *bss_snapshot.lock().expect("bss snapshot lock poisoned") = snapshot;
                    }
                }
            }
        })
        .expect("failed to spawn dispatcher thread")
}

/// Loads the configured scheduler-class BPF object if one is set, falling
/// back to an in-memory mock otherwise. A configured object that fails to
/// load is a fatal misconfiguration: logged and substituted with the mock
/// so the process stays observable rather than crash-looping.
fn build_kernel_bridge(config: &config::Config) -> Box<dyn KernelBridge> {
    match &config.scheduler.bpf_object_path {
        Some(path) => match BpfKernelBridge::load(std::path::Path::new(path)) {
            Ok(bridge) => Box::new(bridge),
            Err(err) => {
                tracing::error!(error = %err, path = %path, "failed to load BPF object, falling back to the mock kernel bridge");
                Box::new(MockKernelBridge::new())
            }
        },
        None => {
            tracing::warn!("no BPF object configured; running the dispatcher against an in-memory mock kernel bridge");
            Box::new(MockKernelBridge::new())
        }
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(1)
}

/// Builds the `reqwest::Client` used for every control-plane request,
/// configured for mutual TLS when `mtls.enable` is set. A misconfigured
/// mTLS setup is logged and degrades to a plain client rather than
/// aborting the agent, matching the BPF-load and public-key fallbacks
/// elsewhere in this file.
fn build_http_client(mtls: &config::MtlsConfig) -> reqwest::Client {
    if !mtls.enable {
        return reqwest::Client::new();
    }

    let identity = match (&mtls.cert_pem, &mtls.key_pem) {
        (Some(cert_path), Some(key_path)) => {
            let pem = std::fs::read_to_string(cert_path)
                .and_then(|cert| Ok((cert, std::fs::read_to_string(key_path)?)))
                .map(|(cert, key)| format!("{cert}\n{key}"));
            match pem {
                Ok(pem) => reqwest::Identity::from_pem(pem.as_bytes()).ok(),
                Err(err) => {
                    tracing::error!(error = %err, "failed to read mTLS client cert/key, running without client identity");
                    None
                }
            }
        }
        _ => {
            tracing::error!("api.mtls.enable is true but cert_pem/key_pem is unset");
            None
        }
    };

    let mut builder = reqwest::Client::builder();
    if let Some(identity) = identity {
        builder = builder.identity(identity);
    }
    if let Some(ca_path) = &mtls.ca_pem {
        match std::fs::read(ca_path).and_then(|bytes| reqwest::Certificate::from_pem(&bytes).map_err(std::io::Error::other)) {
            Ok(ca) => builder = builder.add_root_certificate(ca),
            Err(err) => tracing::error!(error = %err, path = %ca_path, "failed to load mTLS CA bundle, using system roots"),
        }
    }

    builder.build().unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to build mTLS-configured HTTP client, falling back to a plain one");
        reqwest::Client::new()
    })
}

async fn control_plane_loop(
    config: config::Config,
    strategy_store: Arc<StrategyStore>,
    bss_snapshot: Arc<Mutex<BssSnapshot>>,
    shutdown: CancellationToken,
) {
    let http = build_http_client(&config.api.mtls);

    let auth = if config.api.auth_enabled {
        match &config.api.public_key_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(pem) => Some(control_plane::AuthClient::new(http.clone(), &config.api.url, pem)),
                Err(err) => {
                    tracing::error!(error = %err, path = %path, "failed to read public key, running unauthenticated");
                    None
                }
            },
            None => {
                tracing::error!("api.auth_enabled is true but api.public_key_path is unset");
                None
            }
        }
    } else {
        None
    };

    let client = control_plane::Client::new(http, &config.api.url, auth);
    let mut ticker = tokio::time::interval(Duration::from_secs(config.api.interval_secs));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let now = now_unix();
                match client.fetch_strategies(now).await {
                    Ok(strategies) => strategy_store.replace_all(strategies),
                    Err(err) => tracing::warn!(error = %err, "failed to refresh scheduling strategies"),
                }

                let snapshot = *bss_snapshot.lock().expect("bss snapshot lock poisoned");
                if let Err(err) = client.post_metrics(snapshot, now).await {
                    tracing::warn!(error = %err, "failed to post metrics");
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
}
