//! Process plumbing: detaching, pid file, log destination.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use daemonize::Daemonize;
use tracing_subscriber::EnvFilter;

use fleet_core::FleetConfig;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleet=debug";

pub fn registry_path(config: &FleetConfig) -> PathBuf {
    config.manager.data_dir().join("registry.redb")
}

pub fn pid_file(config: &FleetConfig) -> PathBuf {
    config.manager.data_dir().join("fleetd.pid")
}

pub fn log_file(config: &FleetConfig) -> PathBuf {
    config.manager.log_dir().join("workermanager.log")
}

/// Fork into the background. Standard descriptors end up on /dev/null.
pub fn detach(pid_file: &Path) -> anyhow::Result<()> {
    Daemonize::new()
        .pid_file(pid_file)
        .working_directory("/")
        .start()
        .context("failed to daemonize")?;
    Ok(())
}

pub fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Install the global subscriber, writing to `log_file` or to stderr.
pub fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
