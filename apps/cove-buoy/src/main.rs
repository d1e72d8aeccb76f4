use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cove_buoy::config::resolve_listen_addr;
use cove_buoy::server::{router, SignalingState};

#[derive(Debug, Parser)]
#[command(
    name = "cove-buoy",
    about = "Signaling rendezvous for cove communities"
)]
struct Cli {
    /// Listening address. A numeric PORT environment variable overrides the
    /// port.
    #[arg(long, default_value = "0.0.0.0:1337")]
    laddr: String,

    /// Heartbeat interval in seconds: pings go out every half interval, and
    /// peers silent for a full interval are dropped.
    #[arg(long, default_value_t = 10)]
    heartbeat: u64,

    /// Enable verbose logging.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let addr = resolve_listen_addr(&cli.laddr)?;
    let state = SignalingState::new(Duration::from_secs(cli.heartbeat.max(1)));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server terminated")?;
    Ok(())
}
