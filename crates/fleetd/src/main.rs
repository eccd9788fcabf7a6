//! fleetd, the fleet daemon.
//!
//! Runs the worker-pool control loop and offers a few operator commands
//! around it.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleetd.toml
//! fleetd status --config /etc/fleet/fleetd.toml
//! fleetd ctl shutdown --port 9001 --config /etc/fleet/fleetd.toml
//! fleetd stop --config /etc/fleet/fleetd.toml
//! ```

mod admin;
mod control_loop;
mod daemon;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use fleet_core::FleetConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "Worker fleet control daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop (detached unless --foreground).
    Run {
        /// Configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stay attached to the terminal and log to stderr.
        #[arg(long)]
        foreground: bool,
    },

    /// Ask the running control loop to exit.
    Stop {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show whether a control loop is running and the worker table summary.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Send one control command to a worker and print its reply.
    Ctl {
        /// Command name (list, status, shutdown, ...).
        command: String,

        /// Worker control port.
        #[arg(long)]
        port: u16,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, foreground } => {
            control_loop::run(load_config(config.as_deref())?, foreground)
        }
        Command::Stop { config } => {
            daemon::init_tracing(None)?;
            admin::stop(&load_config(config.as_deref())?)
        }
        Command::Status { config } => {
            daemon::init_tracing(None)?;
            admin::status(&load_config(config.as_deref())?)
        }
        Command::Ctl {
            command,
            port,
            config,
        } => {
            daemon::init_tracing(None)?;
            let config = load_config(config.as_deref())?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(admin::ctl(&config, &command, port))
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}
