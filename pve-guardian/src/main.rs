use clap::{Parser, Subcommand};
use pve_guardian::config::AppConfig;
use pve_guardian::db::{create_pool, migrate::migrate};
use pve_guardian::models::artifact::{parse_restore_request, scan_local_dir};
use pve_guardian::models::history::{self, HistoryKind};
use pve_guardian::models::settings::{KvStore, KEY_CONFIG_HASH};
use pve_guardian::remote::SshTarget;
use pve_guardian::routes::{self, artifacts::collect_artifacts};
use pve_guardian::services::backup_engine::{self, BackupOutcome};
use pve_guardian::services::coordinator::TaskCoordinator;
use pve_guardian::services::host::probe_host;
use pve_guardian::services::restore_engine;
use pve_guardian::services::scheduler::BackupScheduler;
use pve_guardian::state::AppState;
use pve_guardian::utils::logger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for a running backup or restore
const SHUTDOWN_GRACE: Duration = Duration::from_secs(300);

/// Blocking work still running when the runtime stops is abandoned after this
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "pve-guardian", version, about = "Proxmox VE backup and restore orchestrator")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and HTTP API (default)
    Serve,
    /// Run one backup job now
    Backup,
    /// Restore an archive, e.g. `local|vzdump-qemu-100-....vma.zst`
    Restore { request: String },
    /// Show host and archive status
    Status,
    /// Show recent backup and restore history
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List local and offsite archives
    Artifacts,
    /// Clear both history logs
    ClearHistory,
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let runtime = build_runtime()?;
    let result = runtime.block_on(run(args));
    // A hung dump or transfer must not keep the process alive.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = AppConfig::load(args.config.as_deref())?;

    let level = args.log_level.as_deref().unwrap_or(&config.server.log_level);
    logger::init(level)?;

    std::fs::create_dir_all(&config.server.data_dir)?;
    let pool = create_pool(&config.db_path())?;
    migrate(&pool)?;
    let store = KvStore::new(pool);
    check_config_hash(&store, &config);

    let state = Arc::new(AppState::new(config, store));

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state).await,
        Command::Backup => {
            let outcome = tokio::task::spawn_blocking(move || backup_engine::run_backup_job(&state)).await?;
            match outcome {
                BackupOutcome::Finished(report) => {
                    print_json(&report)?;
                    if !report.success {
                        anyhow::bail!("{}", report.message);
                    }
                    Ok(())
                }
                BackupOutcome::Rejected(reason) => anyhow::bail!("backup not started: {reason}"),
            }
        }
        Command::Restore { request } => {
            let (source, filename) = parse_restore_request(&request).map_err(anyhow::Error::msg)?;
            let outcome =
                tokio::task::spawn_blocking(move || restore_engine::run_restore_job(&state, &filename, source)).await??;
            print_json(&outcome)?;
            if let Some(error) = outcome.error {
                anyhow::bail!("{error}");
            }
            Ok(())
        }
        Command::Status => {
            let status = tokio::task::spawn_blocking(move || -> anyhow::Result<serde_json::Value> {
                let host = SshTarget::from_config(&state.config.ssh)
                    .map(|target| probe_host(state.connector.as_ref(), &target))
                    .map_err(|e| e.to_string());
                let local_count = scan_local_dir(&state.config.local_dir())?.len();
                let last_backup = history::list(&state.store, HistoryKind::Backup)?.into_iter().next();
                let last_restore = history::list(&state.store, HistoryKind::Restore)?.into_iter().next();
                Ok(serde_json::json!({
                    "host": host.as_ref().ok(),
                    "host_error": host.as_ref().err(),
                    "local_count": local_count,
                    "last_backup": last_backup,
                    "last_restore": last_restore,
                }))
            })
            .await??;
            print_json(&status)
        }
        Command::History { limit } => {
            let entries = tokio::task::spawn_blocking(move || history::list_all(&state.store, limit)).await??;
            print_json(&entries)
        }
        Command::Artifacts => {
            let listing = tokio::task::spawn_blocking(move || collect_artifacts(&state)).await??;
            print_json(&listing)
        }
        Command::ClearHistory => {
            tokio::task::spawn_blocking(move || history::clear(&state.store, None)).await??;
            println!("history cleared");
            Ok(())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Log when task-relevant configuration changed since the last start.
fn check_config_hash(store: &KvStore, config: &AppConfig) {
    let current = config.fingerprint();
    match store.get_raw(KEY_CONFIG_HASH) {
        Ok(Some(previous)) if previous == current => {}
        Ok(previous) => {
            if previous.is_some() {
                tracing::info!("Configuration changed since last start");
            }
            if let Err(e) = store.set_raw(KEY_CONFIG_HASH, &current) {
                tracing::warn!("Failed to store config hash: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to read config hash: {}", e),
    }
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let config = state.config.clone();
    tracing::info!("Starting pve-guardian on {}:{}", config.server.bind, config.server.port);

    if let Err(e) = config.validate_credentials() {
        tracing::warn!("{}", e);
    }
    std::fs::create_dir_all(config.local_dir())?;

    let cancel = CancellationToken::new();

    let scheduler = match BackupScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules().await {
                tracing::warn!("Failed to initialize schedule: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            s.spawn_run_on_start();
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down, waiting for running tasks...");
    cancel.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    if !drain_tasks(state.coordinator.clone(), SHUTDOWN_GRACE).await {
        tracing::warn!("Task still running after {}s, exiting anyway", SHUTDOWN_GRACE.as_secs());
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Wait for the running task to finish. `false` when it outlived `grace`.
async fn drain_tasks(coordinator: Arc<TaskCoordinator>, grace: Duration) -> bool {
    tokio::task::spawn_blocking(move || coordinator.wait_idle(grace))
        .await
        .unwrap_or(false)
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_shutdown_abandons_stuck_task() {
        let runtime = build_runtime().unwrap();
        let coordinator = Arc::new(TaskCoordinator::new());
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let worker = coordinator.clone();
        runtime.spawn_blocking(move || {
            let _guard = worker.try_begin_backup().unwrap();
            held_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        held_rx.recv().unwrap();

        let started = Instant::now();
        let drained = runtime.block_on(drain_tasks(coordinator.clone(), Duration::from_millis(50)));
        assert!(!drained);

        runtime.shutdown_timeout(Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(release_tx);
    }

    #[test]
    fn test_drain_returns_once_idle() {
        let runtime = build_runtime().unwrap();
        let coordinator = Arc::new(TaskCoordinator::new());
        assert!(runtime.block_on(drain_tasks(coordinator, Duration::from_millis(50))));
    }
}
