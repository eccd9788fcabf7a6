//! `fleetd run`: wire the registry, client and factory into a
//! [`FleetManager`] and drive it until a signal arrives.

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

use fleet_core::{FleetConfig, FleetPolicy};
use fleet_ctl::CommandClient;
use fleet_manager::{Evictor, FleetManager, ProcFs, ProcessProbe, ProcessWorkerFactory};
use fleet_registry::{RegistryStore, WorkerRegistry};

use crate::{admin, daemon};

pub fn run(config: FleetConfig, foreground: bool) -> anyhow::Result<()> {
    let data_dir = config.manager.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    // Checked before detaching so the refusal reaches the terminal.
    if let Some(pid) = admin::live_instance(&config)? {
        bail!("fleet manager already running (pid {pid})");
    }

    let pid_file = daemon::pid_file(&config);
    if foreground {
        daemon::init_tracing(None)?;
        daemon::write_pid_file(&pid_file)?;
    } else {
        let log_dir = config.manager.log_dir();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        daemon::detach(&pid_file)?;
        daemon::init_tracing(Some(&daemon::log_file(&config)))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(config));
    let _ = std::fs::remove_file(&pid_file);
    result
}

async fn serve(config: FleetConfig) -> anyhow::Result<()> {
    info!(pid = std::process::id(), "fleet daemon starting");

    let db_path = daemon::registry_path(&config);
    let store = RegistryStore::open(&db_path)
        .with_context(|| format!("failed to open registry {}", db_path.display()))?;
    let released = store.release_all_locks()?;
    if released > 0 {
        info!(released, "stale worker locks cleared");
    }
    let registry: Arc<dyn WorkerRegistry> = Arc::new(store);

    let policy = FleetPolicy::resolve(&config);
    info!(
        idle_target = policy.idle_target_count,
        idle_thread_pool = policy.idle_thread_pool_count,
        threshold_check_disabled = policy.threshold_check_disabled,
        "fleet policy"
    );

    let probe: Arc<dyn ProcessProbe> = Arc::new(ProcFs);
    let factory =
        ProcessWorkerFactory::from_config(&config.factory, registry.clone(), probe.clone())?;
    let client = CommandClient::from_config(&config)?;
    let evictor = Evictor::new(registry.clone(), client);

    let manager = FleetManager::new(registry, Arc::new(factory), evictor, policy)
        .with_probe(probe)
        .with_port(config.manager.port())
        .with_tick(config.manager.tick()?)
        .with_process_name(config.manager.process_name());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        info!(signal = name, "handling signal");
        let _ = shutdown_tx.send(true);
    });

    manager.run(shutdown_rx).await?;

    info!("fleet daemon stopped");
    Ok(())
}
