//! sandpit-daemon - serves the sandboxed execution engine over a Unix socket
//!
//! Every execution gets its own disposable container. On SIGINT/SIGTERM the
//! daemon stops accepting work and reaps every sandbox still alive.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use sandpit_core::ExecutionEngine;
use sandpit_core::runtime::DockerRuntime;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "sandpit-daemon")]
#[command(author, version, about = "Sandboxed code execution daemon")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SANDPIT_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path, overriding the configuration
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sandpit=info".parse()?))
        .init();

    let args = Args::parse();
    tracing::info!("sandpit-daemon starting");

    let mut config = DaemonConfig::resolve(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    tracing::info!(
        socket = ?config.socket_path,
        disabled = ?config.engine.disabled_languages,
        "configuration loaded"
    );

    let runtime = DockerRuntime::connect().context("failed to connect to docker")?;
    runtime.ping().await.context("docker is not responding")?;
    let engine = Arc::new(ExecutionEngine::new(Arc::new(runtime), config.engine.clone())?);

    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // stale socket from a previous run
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    tracing::info!(socket = ?config.socket_path, "listening");

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    let shutdown = async move {
        if let Some(signal) = signals.next().await {
            tracing::info!(signal, "shutdown requested");
        }
    };

    server::run(
        listener,
        Arc::clone(&engine),
        config.max_frame_bytes,
        shutdown,
    )
    .await?;
    handle.close();

    let reaped = engine.cleanup_all_sandboxes().await;
    tracing::info!(reaped, "sandboxes reaped");

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::warn!(error = %e, "failed to remove socket file");
    }
    tracing::info!("sandpit-daemon stopped");
    Ok(())
}
