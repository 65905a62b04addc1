use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stash",
    about = "Stash: virtual storage with a reserved physical buffer",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a randomized storage network and check material conservation
    Simulate(SimulateArgs),
    /// Show the contents of a node save file
    Inspect(InspectArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[arg(long, default_value = "2")]
    pub regions: u64,
    #[arg(long, default_value = "3")]
    pub nodes_per_region: usize,
    /// Simulation ticks (60 per simulated second)
    #[arg(short, long, default_value = "3600")]
    pub ticks: u64,
    #[arg(long, default_value = "8")]
    pub workers: u64,
    #[arg(long, default_value = "42")]
    pub seed: u64,
    /// Write every node's save into this directory when done
    #[arg(long)]
    pub save_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Save file (`.json` or bincode)
    pub path: PathBuf,
}
