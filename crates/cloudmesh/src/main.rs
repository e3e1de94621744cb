//! Cloudmesh daemon.
//!
//! Runs one node until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use cloudmesh::sync::StaticDiscovery;
use cloudmesh::{Node, NodeConfig};

/// Cloudmesh sync daemon
#[derive(Parser, Debug)]
#[command(name = "cloudmesh")]
#[command(about = "Keep collections and files in sync with peers")]
struct Args {
    /// Path to a JSON config file
    config: Option<PathBuf>,

    /// Listening port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path (overrides the config file)
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.database.is_some() {
        config.database = args.database;
    }

    let discovery = Arc::new(StaticDiscovery::new(config.peers.clone()));
    let node = Node::start(config, discovery)
        .await
        .context("starting node")?;
    info!(addr = %node.local_addr(), name = %node.config().node_name, "listening");

    node.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot wait for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await
    .context("running node")?;

    Ok(())
}
