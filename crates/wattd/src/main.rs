//! wattd — the WattGrid daemon.
//!
//! Runs a full balancing tree against a simulated platform: one agent
//! thread per tree node, wired over the in-process channel transport,
//! with a synthetic workload whose epoch runtime scales inversely with
//! the enforced power limit.
//!
//! # Usage
//!
//! ```text
//! wattd simulate --nodes 4 --packages 2 --power-cap 300 --ticks 4000
//! wattd simulate --nodes 2 --work 150,300 --new-cap 240
//! ```

mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use watt_core::BalanceConfig;

#[derive(Parser)]
#[command(name = "wattd", about = "WattGrid power-balancing daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulated balancing tree and report converged limits.
    Simulate {
        /// Number of compute nodes (leaves).
        #[arg(long, default_value = "2")]
        nodes: usize,

        /// Packages per node.
        #[arg(long, default_value = "2")]
        packages: usize,

        /// Job-level per-node power cap, watts.
        #[arg(long, default_value = "300")]
        power_cap: f64,

        /// Cap injected halfway through the run, watts.
        #[arg(long)]
        new_cap: Option<f64>,

        /// Lowest settable package power limit, watts.
        #[arg(long, default_value = "50")]
        min_power: f64,

        /// Highest settable package power limit, watts.
        #[arg(long, default_value = "200")]
        max_power: f64,

        /// Per-node work units; comma separated, one per node.
        /// Defaults to an even spread from 1x to 2x the cap.
        #[arg(long, value_delimiter = ',')]
        work: Option<Vec<f64>>,

        /// Number of workload epochs to feed before stopping.
        #[arg(long, default_value = "4000")]
        ticks: u64,

        /// Balancing configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wattd=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            nodes,
            packages,
            power_cap,
            new_cap,
            min_power,
            max_power,
            work,
            ticks,
            config,
        } => {
            let config = match config {
                Some(path) => BalanceConfig::from_file(&path)?,
                None => BalanceConfig::default(),
            };
            simulate::run(simulate::SimulateArgs {
                nodes,
                packages,
                power_cap,
                new_cap,
                min_power,
                max_power,
                work,
                ticks,
                config,
            })
        }
    }
}
