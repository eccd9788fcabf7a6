//! Operator commands: `stop`, `status`, `ctl`.

use std::collections::BTreeMap;

use anyhow::{Context, bail};

use fleet_core::FleetConfig;
use fleet_ctl::CommandClient;
use fleet_manager::{FleetManager, ProcFs, ProcessProbe, terminate};
use fleet_registry::{RegistryStore, WorkerKind, WorkerRegistry};

use crate::daemon;

/// Pid of the live control loop, if any.
///
/// The registry is authoritative. The pid file is consulted only when the
/// registry cannot be opened, e.g. while another process keeps it busy.
pub fn live_instance(config: &FleetConfig) -> anyhow::Result<Option<u32>> {
    let path = daemon::registry_path(config);
    let name = config.manager.process_name();
    if !path.exists() {
        return Ok(None);
    }
    match RegistryStore::open(&path) {
        Ok(store) => FleetManager::running_instance(&store, &ProcFs, name),
        Err(open_err) => match daemon::read_pid_file(&daemon::pid_file(config)) {
            Some(pid) if ProcFs.is_running(pid, name) => Ok(Some(pid)),
            _ => Err(anyhow::Error::new(open_err)
                .context(format!("cannot open registry {}", path.display()))),
        },
    }
}

pub fn stop(config: &FleetConfig) -> anyhow::Result<()> {
    match live_instance(config)? {
        Some(pid) => {
            terminate(pid).with_context(|| format!("failed to signal pid {pid}"))?;
            println!("sent SIGTERM to fleet manager (pid {pid})");
        }
        None => println!("fleet manager is not running"),
    }
    Ok(())
}

pub fn status(config: &FleetConfig) -> anyhow::Result<()> {
    let path = daemon::registry_path(config);
    let store = if path.exists() {
        RegistryStore::open(&path).ok()
    } else {
        None
    };

    let Some(store) = store else {
        match live_instance(config)? {
            Some(pid) => println!("fleet manager: running (pid {pid}), registry in use"),
            None => println!("fleet manager: not running"),
        }
        return Ok(());
    };

    match FleetManager::running_instance(&store, &ProcFs, config.manager.process_name())? {
        Some(pid) => println!("fleet manager: running (pid {pid})"),
        None => println!("fleet manager: not running"),
    }

    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for worker in store.list_workers()? {
        if worker.kind == WorkerKind::Worker {
            *counts.entry(worker.status.to_string()).or_default() += 1;
        }
    }
    println!("workers:");
    for (status, count) in &counts {
        println!("  {status:<12} {count}");
    }
    Ok(())
}

/// Issue `command` to the worker on `port` and print the JSON reply.
pub async fn ctl(config: &FleetConfig, command: &str, port: u16) -> anyhow::Result<()> {
    let client = CommandClient::from_config(config)?;
    let response = client.issue_request(command, port).await?;
    println!("{}", response.to_json());
    if !response.success {
        bail!(
            "command {command} was not successful (error {})",
            response.error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
