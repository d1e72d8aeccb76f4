use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cove_mesh::{AdapterConfig, PeerAdapter, SignalingConfig};

mod ethernet;
mod tap;
mod throughput;

#[derive(Debug, Parser)]
#[command(name = "cove", about = "Peer-to-peer overlay networks for communities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct ConnectionArgs {
    /// Rendezvous address.
    #[arg(long, default_value = "ws://127.0.0.1:1337")]
    raddr: String,

    /// Seconds to wait for connections.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Community to join.
    #[arg(long, default_value = "")]
    community: String,

    /// Password for the community.
    #[arg(long, default_value = "")]
    password: String,

    /// Encryption key for community signaling.
    #[arg(long, default_value = "")]
    key: String,

    /// STUN servers (stun:host:port) and TURN servers
    /// (username:credential@turn:host:port).
    #[arg(long = "ice", default_value = "stun:stun.l.google.com:19302")]
    ice: Vec<String>,

    /// Force usage of TURN relays.
    #[arg(long)]
    force_relay: bool,

    /// Enable verbose logging.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Join a layer 2 overlay network.
    #[command(visible_aliases = ["eth", "e"])]
    Ethernet {
        #[command(flatten)]
        conn: ConnectionArgs,

        /// Name to give to the TAP device (default is auto-generated; Linux
        /// only).
        #[arg(long)]
        dev: Option<String>,

        /// MAC address to give to the TAP device; doubles as the peer
        /// identity (default is auto-generated).
        #[arg(long)]
        mac: Option<String>,

        /// Number of threads decoding frames (defaults to the CPU count).
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Measure the throughput of the overlay network.
    #[command(visible_aliases = ["thr", "t"])]
    Throughput {
        #[command(flatten)]
        conn: ConnectionArgs,

        /// Act as a server.
        #[arg(long)]
        server: bool,

        /// Size of each packet.
        #[arg(long, default_value_t = 1000)]
        packet_length: usize,

        /// Packets to send before waiting for an acknowledgement.
        #[arg(long, default_value_t = 1000)]
        packet_count: usize,
    },
}

impl ConnectionArgs {
    fn validate(&self) -> Result<()> {
        if self.community.trim().is_empty() {
            bail!("missing community");
        }
        if self.password.trim().is_empty() {
            bail!("missing password");
        }
        if self.key.trim().is_empty() {
            bail!("missing key");
        }
        Ok(())
    }

    fn adapter(&self, id: Option<String>, channels: Vec<String>) -> Result<PeerAdapter> {
        let signaling = SignalingConfig {
            url: self.raddr.clone(),
            community: self.community.clone(),
            password: self.password.clone(),
        };
        let config = AdapterConfig {
            id,
            channels,
            ice_servers: self.ice.clone(),
            timeout: Duration::from_secs(self.timeout.max(1)),
            force_relay: self.force_relay,
        };
        Ok(PeerAdapter::new(signaling, &self.key, config)?)
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Ethernet {
            conn,
            dev,
            mac,
            parallel,
        } => {
            init_logging(conn.verbose);
            conn.validate()?;
            let parallel = parallel
                .filter(|p| *p > 0)
                .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
                .unwrap_or(1);
            let adapter = conn.adapter(mac.clone(), vec![ethernet::CHANNEL.to_string()])?;
            ethernet::run(
                adapter,
                ethernet::EthernetConfig {
                    device: dev,
                    mac,
                    parallel,
                },
            )
            .await
        }
        Commands::Throughput {
            conn,
            server,
            packet_length,
            packet_count,
        } => {
            init_logging(conn.verbose);
            conn.validate()?;
            let adapter = conn.adapter(None, vec![throughput::CHANNEL.to_string()])?;
            throughput::run(
                adapter,
                throughput::ThroughputConfig {
                    server,
                    packet_length,
                    packet_count,
                },
            )
            .await
        }
    }
}
