//! Worker spawning.
//!
//! [`WorkerFactory`] is the contract the control loop relies on.
//! [`ProcessWorkerFactory`] starts workers as child processes, one per
//! free control port, and registers each one as an idle row.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use tracing::{debug, info, warn};

use fleet_core::config::FactoryConfig;
use fleet_registry::{WorkerField, WorkerKind, WorkerRecord, WorkerRegistry, WorkerStatus};

use crate::process::ProcessProbe;

/// Creates worker processes and keeps its bookkeeping in line with the registry.
pub trait WorkerFactory: Send + Sync {
    /// Mark rows whose process is gone as `Exited`.
    fn reconcile_against_registry(&self) -> anyhow::Result<()>;

    /// Drop bookkeeping for children that have exited.
    fn reset_tracked_workers(&self) -> anyhow::Result<()>;

    /// Start up to `count` workers. Returns how many were started.
    fn spawn_workers(&self, count: u32) -> anyhow::Result<u32>;
}

/// Spawns the configured worker binary with `--port <port>`.
pub struct ProcessWorkerFactory {
    registry: Arc<dyn WorkerRegistry>,
    probe: Arc<dyn ProcessProbe>,
    command: PathBuf,
    args: Vec<String>,
    base_port: u16,
    port_range: u16,
    children: Mutex<Vec<Child>>,
}

impl ProcessWorkerFactory {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        probe: Arc<dyn ProcessProbe>,
        command: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            probe,
            command: command.into(),
            args: Vec::new(),
            base_port: fleet_core::config::DEFAULT_WORKER_BASE_PORT,
            port_range: fleet_core::config::DEFAULT_WORKER_PORT_RANGE,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        config: &FactoryConfig,
        registry: Arc<dyn WorkerRegistry>,
        probe: Arc<dyn ProcessProbe>,
    ) -> anyhow::Result<Self> {
        let Some(command) = &config.command else {
            bail!("factory.command is not configured");
        };
        Ok(Self::new(registry, probe, command.clone())
            .with_args(config.args.clone())
            .with_ports(config.base_port(), config.port_range()))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_ports(mut self, base_port: u16, port_range: u16) -> Self {
        self.base_port = base_port;
        self.port_range = port_range;
        self
    }

    /// Lowest port in the configured range that no live row holds.
    fn free_port(&self) -> anyhow::Result<Option<u16>> {
        let taken: HashSet<u16> = self
            .registry
            .list_workers()?
            .into_iter()
            .filter(|w| !w.is_exited())
            .map(|w| w.port)
            .collect();
        let end = self.base_port.saturating_add(self.port_range);
        Ok((self.base_port..end).find(|p| !taken.contains(p)))
    }

    fn spawn_one(&self, port: u16) -> anyhow::Result<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start worker {}", self.command.display()))?;

        let pid = child.id();
        if let Err(e) = self
            .registry
            .put_worker(&WorkerRecord::idle(port, pid, epoch_secs()))
        {
            // Never leave a worker running without a row.
            if let Err(kill_err) = child.kill() {
                warn!(port, pid, error = %kill_err, "cannot kill unregistered worker");
            }
            let _ = child.wait();
            return Err(anyhow::Error::new(e)
                .context(format!("failed to register worker on port {port}")));
        }
        self.children
            .lock()
            .map_err(|_| anyhow::anyhow!("worker table poisoned"))?
            .push(child);

        info!(port, pid, "worker spawned");
        Ok(())
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn reconcile_against_registry(&self) -> anyhow::Result<()> {
        let mut exited = 0u32;
        for worker in self.registry.list_workers()? {
            if worker.kind != WorkerKind::Worker || worker.is_exited() {
                continue;
            }
            if !self.probe.is_alive(worker.pid) {
                self.registry
                    .update_field(worker.port, WorkerField::Status(WorkerStatus::Exited))?;
                warn!(port = worker.port, pid = worker.pid, "worker process gone, marked exited");
                exited += 1;
            }
        }
        if exited > 0 {
            debug!(exited, "registry reconciled");
        }
        Ok(())
    }

    fn reset_tracked_workers(&self) -> anyhow::Result<()> {
        let mut children = self
            .children
            .lock()
            .map_err(|_| anyhow::anyhow!("worker table poisoned"))?;
        children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "worker reaped");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = child.id(), error = %e, "cannot poll worker");
                true
            }
        });
        Ok(())
    }

    fn spawn_workers(&self, count: u32) -> anyhow::Result<u32> {
        let mut spawned = 0;
        while spawned < count {
            let Some(port) = self.free_port()? else {
                warn!(
                    requested = count,
                    spawned,
                    base_port = self.base_port,
                    port_range = self.port_range,
                    "no free worker port left"
                );
                break;
            };
            self.spawn_one(port)?;
            spawned += 1;
        }
        Ok(spawned)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
