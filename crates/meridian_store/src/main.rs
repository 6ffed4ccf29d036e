//! Meridian node binary: loads the cluster configuration, starts every
//! module of the local machine and serves until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use meridian_store::config::Configuration;
use meridian_store::node::Node;

#[derive(Parser, Debug)]
#[command(name = "meridian-node", about = "Meridian store node")]
struct Args {
    /// Path to the cluster configuration file (JSON).
    #[arg(long, default_value = "meridian.json")]
    config: PathBuf,

    /// Region (replica) number of this machine.
    #[arg(long)]
    region: u32,

    /// Partition number of this machine.
    #[arg(long)]
    partition: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(
        Configuration::from_file(&args.config, args.region, args.partition)
            .context("loading configuration")?,
    );
    if !config.raw().cpu_pinnings.is_empty() {
        tracing::warn!("cpu_pinnings are recorded but not enforced by this build");
    }

    let node = Node::start(config.clone())
        .await
        .context("starting node")?;
    tracing::info!(machine = %config.local_machine(), "node is up");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    drop(node);
    Ok(())
}
