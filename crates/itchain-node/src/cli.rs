use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// itchain - PBFT consensus node
#[derive(Parser)]
#[command(name = "itchain")]
#[command(about = "itchain consensus node and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process cluster of peers
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Override the number of sequences to run
        #[arg(long)]
        blocks: Option<u64>,
    },

    /// Initialize a new cluster configuration
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,

        /// Number of peers in the cluster
        #[arg(long, default_value_t = 4)]
        peers: usize,
    },
}
