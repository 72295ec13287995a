//! Minimal [`Runner`] implementation: echoes every envelope it receives
//! back out its egress, tagging the response with its own agent id.
//!
//! Run against a broker listening on `127.0.0.1:9001` with a cell that
//! wires this agent's ingress/egress as, e.g., `sub:requests` /
//! `pub:replies`:
//!
//! ```sh
//! cargo run --example echo_agent -- --agent-name echo --ingress sub:requests --egress pub:replies
//! ```

use agen_cell::domain_types::MaxFrameBytes;
use agen_cell::observability;
use agen_cell::runtime::{self, BaseAgent, RunConfig, Runner, RuntimeError};
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;

const EMBEDDED_DEFAULTS: &str = "log_level: info\n";

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "echo")]
    agent_name: String,
    #[arg(long, default_value = "sub:requests")]
    ingress: String,
    #[arg(long, default_value = "pub:replies")]
    egress: String,
    #[arg(long, default_value = "127.0.0.1:9001")]
    broker_addr: String,
}

struct EchoRunner;

#[async_trait]
impl Runner for EchoRunner {
    async fn init(&self, base: &BaseAgent) -> Result<(), RuntimeError> {
        tracing::info!(agent_id = %base.agent_id(), "echo agent ready");
        // Orchestrator-spawned instances signal readiness this way (§4.7).
        println!("READY");
        Ok(())
    }

    async fn process_message(
        &self,
        msg: agen_cell::envelope::Envelope,
        base: &BaseAgent,
    ) -> Result<Option<agen_cell::envelope::Envelope>, RuntimeError> {
        let mut response = agen_cell::envelope::Envelope::new("echo-reply", base.agent_id().to_string(), msg.payload.clone());
        response.correlation_id = Some(msg.id);
        Ok(Some(response))
    }

    async fn cleanup(&self, base: &BaseAgent) {
        tracing::info!(agent_id = %base.agent_id(), "echo agent stopping");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_tracing("echo_agent=info,agen_cell=info");

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_shutdown.cancel();
    });

    let config = RunConfig {
        agent_name: args.agent_name,
        ingress: args.ingress,
        egress: args.egress,
        broker_addr: args.broker_addr,
        fs_root: std::env::temp_dir().join("echo_agent"),
        config_cli_flag: None,
        embedded_defaults: EMBEDDED_DEFAULTS,
        max_frame_bytes: MaxFrameBytes::default(),
        token_counter: None,
        shutdown,
    };

    runtime::run(&EchoRunner, config).await?;
    Ok(())
}
