//! blockring node daemon
//!
//! Serves blocks to peers and rebalances local volumes toward the ring.

use blockring_metadata::{open_backend, BlockVolume};
use blockring_rebalancer::metrics::{init_metrics, install_exporter};
use blockring_rebalancer::{Node, NodeConfig};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockring-node")]
#[command(about = "blockring storage node with ring-driven rebalancing")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "blockring.toml")]
    config: PathBuf,

    /// Peer id of this node (overrides config file)
    #[arg(long)]
    node_id: Option<String>,

    /// Listen URL, e.g. tdp://0.0.0.0:40000 (overrides config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Data directory for blocks and metadata (overrides config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Blocks examined per rebalance tick (overrides config file)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Metrics HTTP port (overrides config file)
    #[arg(short, long)]
    metrics_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve peers and rebalance (default)
    Run,

    /// Register a block volume
    CreateVolume {
        name: String,

        /// Block size in bytes; defaults to the cluster setting
        #[arg(long)]
        block_size: Option<u64>,
    },

    /// List registered volumes
    ListVolumes,

    /// Remove all metadata
    Wipe {
        /// Skip the interactive confirmation
        #[arg(long)]
        yes_i_am_sure: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Priority: CLI args > environment > config file > defaults
    let config = NodeConfig::load_or_default(&cli.config)?
        .with_env_overrides()?
        .with_overrides(
            cli.node_id,
            cli.listen,
            cli.data_dir,
            cli.batch_size,
            cli.metrics_port,
        );

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        return Err(e.into());
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::CreateVolume { name, block_size } => {
            let metadata = open_backend(&config.metadata)?;
            let block_size = match block_size {
                Some(size) => size,
                None => metadata.global_metadata().await?.block_size,
            };
            let volume = BlockVolume::create_block_volume(metadata, &name, block_size).await?;
            println!("Created volume {} (id {})", volume.volume().name, volume.id());
            Ok(())
        }
        Command::ListVolumes => {
            let metadata = open_backend(&config.metadata)?;
            for volume in metadata.list_volumes().await? {
                let holder = metadata.lease_holder(volume.id).await?;
                println!(
                    "{}\tid={}\tblock_size={}\tlocked={}",
                    volume.name,
                    volume.id,
                    volume.block_size,
                    holder.is_some()
                );
            }
            Ok(())
        }
        Command::Wipe { yes_i_am_sure } => {
            if !yes_i_am_sure {
                println!("This will wipe all blockring metadata.");
                print!("Please type `YES`, all caps, to confirm: ");
                io::stdout().flush()?;
                if !confirm_wipe(io::stdin().lock())? {
                    anyhow::bail!("`YES` not entered, not wiping metadata");
                }
            }
            open_backend(&config.metadata)?.wipe().await?;
            warn!("All metadata removed");
            Ok(())
        }
    }
}

/// Read one line of confirmation; only an exact `YES` counts
fn confirm_wipe(mut input: impl BufRead) -> io::Result<bool> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim() == "YES")
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!(
        node_id = %config.node.id,
        listen = %config.node.listen,
        storage = ?config.storage.kind,
        metadata = %config.metadata.kind,
        batch_size = config.rebalance.batch_size,
        peers = config.peers.len(),
        "Configuration loaded"
    );

    match config.metrics.port {
        Some(port) => {
            if let Err(e) = install_exporter(port) {
                warn!(error = %e, "Failed to start metrics exporter");
            }
        }
        None => init_metrics(),
    }

    let node = Node::start(config).await?;
    info!(addr = %node.local_addr(), "blockring node running, press Ctrl-C to stop");

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wipe_requires_exact_yes() {
        assert!(confirm_wipe("YES\n".as_bytes()).unwrap());
        assert!(confirm_wipe("  YES  \r\n".as_bytes()).unwrap());
        assert!(!confirm_wipe("yes\n".as_bytes()).unwrap());
        assert!(!confirm_wipe("Y\n".as_bytes()).unwrap());
        assert!(!confirm_wipe("".as_bytes()).unwrap());
    }

    #[test]
    fn test_wipe_flag_parses() {
        let cli = Cli::try_parse_from(["blockring-node", "wipe", "--yes-i-am-sure"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Wipe { yes_i_am_sure: true })));
        let cli = Cli::try_parse_from(["blockring-node", "wipe"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Wipe { yes_i_am_sure: false })));
    }
}
