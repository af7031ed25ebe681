//! hive CLI
//!
//! Prints the effective node configuration and runs simulated clusters
//! with fault injection.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use hive_core::Config;
use hive_sim::{SimCluster, SimConfig, SimSeed};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hive")]
#[command(about = "hive - SWIM membership and failure detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config {
        /// JSON config file; defaults apply when omitted
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Run a simulated cluster and print every node's view
    Simulate {
        /// Cluster size
        #[arg(short, long, default_value_t = 5)]
        nodes: usize,
        /// Wall-clock run time
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Seed for loss and probe target selection
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Probability of dropping each datagram
        #[arg(long, default_value_t = 0.0)]
        drop_rate: f64,
        /// Node to crash halfway through the run
        #[arg(long)]
        crash: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hive=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Config { file } => print_config(file.as_deref()),
        Commands::Simulate {
            nodes,
            seconds,
            seed,
            drop_rate,
            crash,
        } => simulate(nodes, seconds, seed, drop_rate, crash).await,
    }
}

fn print_config(file: Option<&str>) -> Result<()> {
    let mut config = match file {
        Some(path) => {
            Config::from_json_file(path).wrap_err_with(|| format!("loading {path}"))?
        }
        None => Config::default(),
    };
    config.apply_process_env()?;
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn simulate(
    nodes: usize,
    seconds: u64,
    seed: u64,
    drop_rate: f64,
    crash: Option<usize>,
) -> Result<()> {
    if nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    if let Some(index) = crash {
        if index >= nodes {
            bail!("--crash {index} is outside a cluster of {nodes}");
        }
    }

    let config = SimConfig::new(SimSeed::from_literal(seed), nodes);
    let mut cluster = SimCluster::start(config).await?;
    for node in cluster.nodes() {
        node.transport.set_drop_rate(drop_rate);
    }

    let run = Duration::from_secs(seconds);
    match crash {
        Some(index) => {
            tokio::time::sleep(run / 2).await;
            cluster.crash(index).await?;
            tokio::time::sleep(run - run / 2).await;
        }
        None => tokio::time::sleep(run).await,
    }
    info!(converged = cluster.converged().await, "simulation finished");

    for (index, node) in cluster.nodes().iter().enumerate() {
        if node.is_crashed() {
            println!("{} (crashed)", node.detector.local_id());
            continue;
        }
        println!("{}:", node.detector.local_id());
        for (id, (state, incarnation)) in cluster.view(index).await {
            println!("  {id:<12} {state:<8} inc={incarnation}");
        }
    }

    cluster.shutdown().await?;
    Ok(())
}
