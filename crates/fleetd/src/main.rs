//! fleetd — the fleetgrid daemon.
//!
//! Runs the group manager loop against an in-process cluster, with the
//! optional slot buffer and the migration router in front of the plan
//! store.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --data-dir /var/lib/fleetgrid --plans plans.json
//! fleetd print-config --config fleet.toml
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fleet_core::FleetConfig;
use fleetd::{Fleet, load_plans, open_store};
use fleetgrid_placement::ResourceAllocator;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Run {
        /// TOML config file; built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state (overrides `[state] data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Scheduling interval in milliseconds (overrides `[manager] interval_ms`).
        #[arg(long)]
        interval_ms: Option<u64>,

        /// JSON plan map loaded through the router at startup.
        #[arg(long)]
        plans: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path),
        None => Ok(FleetConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleetgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            interval_ms,
            plans,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.state.data_dir = dir.to_string_lossy().into_owned();
            }
            if let Some(ms) = interval_ms {
                config.manager.interval_ms = ms;
            }
            run(config, plans).await
        }
        Command::PrintConfig { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: FleetConfig, plans: Option<PathBuf>) -> anyhow::Result<()> {
    info!(data_dir = %config.state.data_dir, "fleetd starting");

    let store = open_store(Path::new(&config.state.data_dir))?;
    let fleet = Fleet::assemble(&config, store)?;
    let groups = fleet.recover()?;
    info!(groups, "state recovered");

    if let Some(path) = plans {
        fleet.seed_plans(load_plans(&path)?)?;
    }
    fleet.allocator.start();

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat = tokio::spawn(Fleet::heartbeat(
        fleet.cluster.clone(),
        config.allocator.stale_after() / 2,
        shutdown_rx.clone(),
    ));
    let manager = fleet.manager.clone();
    let manager_handle = tokio::spawn(async move {
        manager.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    if shutdown_tx.send(true).is_err() {
        warn!("background tasks already stopped");
    }

    let _ = manager_handle.await;
    let _ = heartbeat.await;
    fleet.allocator.stop();

    info!("fleetd stopped");
    Ok(())
}
