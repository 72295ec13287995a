//! `agen-broker`: the standalone message broker process (§6.1).

use std::path::PathBuf;

use agen_cell::broker::protocol::DEFAULT_PORT;
use agen_cell::broker::server::Broker;
use agen_cell::domain_types::{ChannelCapacity, MaxFrameBytes};
use agen_cell::observability;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Runs the cell broker: pub/sub topics and point-to-point pipes over a
/// line-delimited JSON-RPC wire protocol.
#[derive(Parser, Debug)]
#[command(name = "agen-broker", version, about)]
struct Args {
    /// Address to bind the broker's TCP listener to.
    #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_PORT}"))]
    listen: String,

    /// Explicit config file path, taking priority over every other
    /// resolution level (§6.2 level 1).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bounded capacity for topic history and pipe channels.
    #[arg(long, default_value_t = ChannelCapacity::default().as_usize())]
    channel_capacity: usize,

    /// Maximum accepted frame size, in bytes.
    #[arg(long, default_value_t = MaxFrameBytes::default().as_usize())]
    max_frame_bytes: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_tracing("agen_broker=info,agen_cell=info");

    if let Some(config) = &args.config {
        tracing::info!(path = %config.display(), "broker config flag accepted but broker has no configurable behavior beyond CLI flags yet");
    }

    let channel_capacity = ChannelCapacity::try_from(args.channel_capacity)?;
    let max_frame_bytes = MaxFrameBytes::try_from(args.max_frame_bytes)?;
    let broker = Broker::new(channel_capacity, max_frame_bytes);

    let listener = TcpListener::bind(&args.listen).await?;
    tracing::info!(addr = %args.listen, "broker listening");

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    broker.serve(listener, shutdown).await?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
