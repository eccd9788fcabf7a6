//! The fleet control loop.
//!
//! One [`FleetManager`] runs per host. Each tick performs a maintenance
//! pass: reconcile, count available workers, grow the pool when resources
//! allow, then evict corrupted and excess idle workers. Growth is always
//! decided before shrinkage.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleet_core::FleetPolicy;
use fleet_core::config::{DEFAULT_MANAGER_PORT, DEFAULT_PROCESS_NAME, DEFAULT_TICK};
use fleet_registry::{
    ResourceStats, WorkerField, WorkerHealth, WorkerKind, WorkerRecord, WorkerRegistry,
    WorkerStatus,
};

use crate::evictor::{EvictionOutcome, Evictor, corrupted_candidates, excess_idle_candidates};
use crate::factory::WorkerFactory;
use crate::process::{ProcFs, ProcessProbe};

/// Observable state of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub available: u32,
    /// Workers requested from the factory.
    pub requested: u32,
    /// Growth was needed but resource thresholds blocked it.
    pub growth_deferred: bool,
    pub corrupted: Vec<(u16, EvictionOutcome)>,
    pub excess_idle: Vec<(u16, EvictionOutcome)>,
}

/// Whether the host has room for more workers.
///
/// A missing or incomplete sample does not block growth.
pub fn growth_allowed(policy: &FleetPolicy, stats: Option<&ResourceStats>) -> bool {
    if policy.threshold_check_disabled {
        return true;
    }
    let Some((cpu, mem)) = stats.and_then(|s| s.cpu_percent.zip(s.mem_percent)) else {
        warn!("invalid resource statistics");
        return true;
    };
    info!(cpu, mem, "environment resource statistics");
    if cpu > policy.cpu_threshold_pct || mem > policy.mem_threshold_pct {
        warn!(
            cpu,
            mem,
            cpu_threshold = policy.cpu_threshold_pct,
            mem_threshold = policy.mem_threshold_pct,
            "environment utilisation threshold exceeded, no additional worker will be created"
        );
        return false;
    }
    true
}

/// Keeps the worker pool at its idle target.
pub struct FleetManager {
    registry: Arc<dyn WorkerRegistry>,
    factory: Arc<dyn WorkerFactory>,
    evictor: Evictor,
    probe: Arc<dyn ProcessProbe>,
    policy: FleetPolicy,
    id: Uuid,
    port: u16,
    pid: u32,
    process_name: String,
    tick: Duration,
    lifecycle: watch::Sender<Lifecycle>,
}

impl FleetManager {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        factory: Arc<dyn WorkerFactory>,
        evictor: Evictor,
        policy: FleetPolicy,
    ) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Starting);
        Self {
            registry,
            factory,
            evictor,
            probe: Arc::new(ProcFs),
            policy,
            id: Uuid::new_v4(),
            port: DEFAULT_MANAGER_PORT,
            pid: std::process::id(),
            process_name: DEFAULT_PROCESS_NAME.to_string(),
            tick: DEFAULT_TICK,
            lifecycle,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    pub fn policy(&self) -> &FleetPolicy {
        &self.policy
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Pid of another live control loop registered in the registry, if any.
    pub fn running_instance(
        registry: &dyn WorkerRegistry,
        probe: &dyn ProcessProbe,
        process_name: &str,
    ) -> anyhow::Result<Option<u32>> {
        let own = std::process::id();
        Ok(registry
            .list_workers()?
            .into_iter()
            .filter(|w| w.kind == WorkerKind::Workermanager && !w.is_exited())
            .map(|w| w.pid)
            .find(|&pid| pid != own && probe.is_running(pid, process_name)))
    }

    /// Refuse to start next to a live instance, then register this one.
    pub fn start(&self) -> anyhow::Result<()> {
        if let Some(pid) =
            Self::running_instance(self.registry.as_ref(), self.probe.as_ref(), &self.process_name)?
        {
            bail!("fleet manager already running (pid {pid})");
        }

        // Any other manager row left open belongs to a dead instance.
        while let Some(previous) = self.registry.get_worker_by_type(WorkerKind::Workermanager)?
            && previous.port != self.port
            && !previous.is_exited()
        {
            if !self
                .registry
                .update_field(previous.port, WorkerField::Status(WorkerStatus::Exited))?
            {
                break;
            }
            info!(port = previous.port, pid = previous.pid, "stale fleet manager row closed");
        }

        let record = WorkerRecord {
            id: self.id,
            status: WorkerStatus::Wmanaging,
            health: WorkerHealth::Normal,
            kind: WorkerKind::Workermanager,
            port: self.port,
            pid: self.pid,
            last_active_time: epoch_secs(),
            lock_owner: None,
        };
        self.registry.put_worker(&record)?;
        self.lifecycle.send_replace(Lifecycle::Running);
        info!(port = self.port, pid = self.pid, id = %self.id, "fleet manager started");
        Ok(())
    }

    /// Count rows available for dispatch.
    fn available_workers(&self) -> anyhow::Result<u32> {
        Ok(self
            .registry
            .list_workers()?
            .iter()
            .filter(|w| w.kind == WorkerKind::Worker && w.is_available())
            .count() as u32)
    }

    /// One maintenance pass.
    pub async fn maintain(&self) -> anyhow::Result<PassReport> {
        let mut report = PassReport::default();

        if let Err(e) = self.factory.reconcile_against_registry() {
            warn!(error = %e, "worker reconciliation failed");
        }
        if let Err(e) = self.factory.reset_tracked_workers() {
            warn!(error = %e, "worker bookkeeping reset failed");
        }

        report.available = self.available_workers()?;
        let target = self.policy.idle_target_count;
        if report.available < target {
            let stats = match self.registry.resource_stats() {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(error = %e, "cannot read resource statistics");
                    None
                }
            };
            if growth_allowed(&self.policy, stats.as_ref()) {
                report.requested = target - report.available;
                info!(count = report.requested, available = report.available, "creating workers");
                match self.factory.spawn_workers(report.requested) {
                    Ok(started) => debug!(started, "workers created"),
                    Err(e) => warn!(error = %e, "worker creation failed"),
                }
            } else {
                report.growth_deferred = true;
            }
        }

        let workers = self.registry.list_workers()?;
        let corrupted = corrupted_candidates(&workers);
        for port in &corrupted {
            info!(port, "corrupted worker selected for termination");
        }
        report.corrupted = self.evictor.evict(&corrupted).await;

        let workers = self.registry.list_workers()?;
        let idle = excess_idle_candidates(
            &workers,
            target,
            self.policy.idle_timeout(),
            epoch_secs(),
        );
        for port in &idle {
            info!(port, "idle worker queued for termination");
        }
        report.excess_idle = self.evictor.evict(&idle).await;

        Ok(report)
    }

    /// Run passes until `shutdown` flips to true or its sender goes away.
    ///
    /// A pass in flight always completes; the wait between passes is cut
    /// short by the shutdown signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.start()?;
        info!(tick_ms = self.tick.as_millis() as u64, "fleet manager loop started");

        while !*shutdown.borrow() {
            if let Err(e) = self.maintain().await {
                error!(error = %e, "maintenance pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.stop()
    }

    /// Mark this instance `Exited`.
    pub fn stop(&self) -> anyhow::Result<()> {
        self.lifecycle.send_replace(Lifecycle::Stopping);
        info!("exiting fleet manager");
        let result = self
            .registry
            .update_field(self.port, WorkerField::Status(WorkerStatus::Exited));
        self.lifecycle.send_replace(Lifecycle::Stopped);
        result?;
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
