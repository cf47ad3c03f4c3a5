#![warn(missing_docs)]

//! rtcore node daemon.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rtcore_node::{Node, NodeConfig};
use rtcore_transport::LoopState;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rtcore-node")]
#[command(about = "rtcore resource runtime node", long_about = None)]
struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, env = "RTCORE_CONFIG", default_value = "/etc/rtcore/node.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Overrides `multiplexer.connect_addr`.
    #[arg(long, env = "RTCORE_CONNECT_ADDR")]
    connect_addr: Option<String>,

    /// Overrides `node_context`.
    #[arg(long, env = "RTCORE_NODE_CONTEXT")]
    node_context: Option<String>,

    /// Seconds to wait for scheduled work on shutdown.
    #[arg(long, default_value = "10")]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fmt_layer = if cli.log_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("rtcore node starting...");

    let mut config = if cli.config.exists() {
        NodeConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        NodeConfig::default()
    };
    if let Some(addr) = cli.connect_addr {
        config.multiplexer.connect_addr = addr;
    }
    if cli.node_context.is_some() {
        config.node_context = cli.node_context;
    }
    config.validate()?;

    // Storage recovery and the multiplexer handshake both block.
    let node = tokio::task::spawn_blocking(move || -> Result<Node> {
        let node = Node::build(&config)?;
        node.start()?;
        Ok(node)
    })
    .await??;

    let mut state = node.state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
            }
        }
        result = state.wait_for(|s| matches!(s, LoopState::Failed(_))) => {
            if let Ok(failed) = result {
                tracing::error!(state = ?*failed, "multiplexer failed");
            }
        }
    }

    let timeout = Duration::from_secs(cli.shutdown_timeout_secs);
    tokio::task::spawn_blocking(move || node.shutdown(timeout)).await?;
    Ok(())
}
