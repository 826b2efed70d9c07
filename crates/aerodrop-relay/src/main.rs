//! Standalone relay broker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aerodrop_core::adapters::quic::server::QuicRelayBroker;

const DEFAULT_ADDR: &str = "0.0.0.0:4433";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let raw = std::env::var("AERODROP_RELAY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_owned());
    let addr: SocketAddr = raw
        .parse()
        .with_context(|| format!("invalid AERODROP_RELAY_ADDR {raw:?}"))?;
    info!(%addr, "Relay broker starting");
    let broker = Arc::new(QuicRelayBroker::new(addr)?);
    broker.run().await
}
