//! Marksync relay server
//!
//! Run with: marksync-relay --addr 127.0.0.1:8787

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marksync::relay::{RelayConfig, RelayServer, RelayState};

#[derive(Parser, Debug)]
#[command(name = "marksync-relay")]
#[command(about = "Same-origin relay for WebDAV requests")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, env = "MARKSYNC_RELAY_ADDR", default_value = "127.0.0.1:8787")]
    addr: SocketAddr,

    /// Hosts requests may be forwarded to (comma-separated, empty = any)
    #[arg(long, env = "MARKSYNC_RELAY_ALLOWED_HOSTS", value_delimiter = ',')]
    allowed_hosts: Vec<String>,

    /// Largest accepted request body in MiB
    #[arg(long, env = "MARKSYNC_RELAY_MAX_BODY_MB", default_value = "32")]
    max_body_mb: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        allowed_hosts: args
            .allowed_hosts
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect(),
        max_body_bytes: args.max_body_mb.max(1) * 1024 * 1024,
    };
    if config.allowed_hosts.is_empty() {
        tracing::warn!("No allowed hosts configured; relaying to any host");
    }

    let state = RelayState::new(config)?;
    RelayServer::new(state, args.addr).start().await?;

    Ok(())
}
