use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod chain;
mod cli;
mod config;
mod network;
mod node;
mod txgen;

use cli::{Cli, Commands};
use config::{generate_sample_config, NodeConfig};
use node::Cluster;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, blocks } => {
            run_cluster(config, blocks).await?;
        }
        Commands::Init { output, peers } => {
            init_config(output, peers)?;
        }
    }

    Ok(())
}

/// Run an itchain cluster
async fn run_cluster(config_path: PathBuf, blocks: Option<u64>) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    let mut config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        error!(
            "Configuration file not found: {:?}. Run 'itchain init' to create one.",
            config_path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    };
    if let Some(blocks) = blocks {
        config.blocks = blocks;
    }

    let cluster = Cluster::start(config)?;
    let heights = cluster.run().await?;

    println!("\nChain heights:");
    for (peer, height) in &heights {
        println!("  {}: {}", peer, height);
    }

    cluster.shutdown().await;
    Ok(())
}

/// Initialize a new configuration file
fn init_config(output: PathBuf, peers: usize) -> Result<()> {
    info!("Generating sample configuration for {} peers", peers);

    let config = generate_sample_config(peers);
    config.validate()?;
    config.save(&output)?;

    info!("Configuration saved to {:?}", output);
    info!(
        "  Quorum: {} of {} (tolerates {} faulty)",
        itchain_consensus::QuorumPolicy::new(peers).threshold(),
        peers,
        config.fault_tolerance()
    );

    println!("\nConfiguration file created: {}", output.display());
    println!("Edit the file to customize the cluster.");
    println!("\nTo start the cluster, run:");
    println!("  itchain run --config {}", output.display());

    Ok(())
}
