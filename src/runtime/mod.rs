//! Agent framework runtime: the `Runner` contract and the `run` entry point
//! every agent binary calls into (§4.6).

pub mod base;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::chunking::{self, ChunkCollector};
use crate::client::{Client, ClientError};
use crate::config::{self, AgentConfig, ConfigError};
use crate::domain_types::{AgentId, MaxFrameBytes, SafetyMargin};
use crate::envelope::Envelope;
use crate::orchestrator::channel_uri::{self, ChannelUri, Side};
use crate::token_counter::{CounterRegistry, TokenCounter};

pub use base::{BaseAgent, ScopedFs, ScopedFsError};

/// Key an agent's single egress token counter is registered under in the
/// ephemeral [`CounterRegistry`] built for each send (§4.3.1, §4.5: the
/// client "asks the chunking engine to split the envelope based on the
/// destination's token budget" before sending).
const EGRESS_COUNTER_KEY: &str = "egress";

/// Bounded time the dispatch loop waits for an in-flight `ProcessMessage`
/// call to return after a shutdown signal, before giving up and calling
/// `Cleanup` anyway (§4.6 step 7, §8 scenario 6).
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The capability set an agent author implements (§4.6).
///
/// `Init`/`ProcessMessage`/`Cleanup` all receive the same [`BaseAgent`],
/// which is cheap to clone (its parts are reference-counted) so a runner
/// can stash a clone for use outside these calls if it spawns its own
/// background work.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Called once before the dispatch loop starts accepting envelopes.
    ///
    /// # Errors
    /// Any error aborts startup; `run` disconnects from the broker and
    /// returns it without entering the dispatch loop.
    async fn init(&self, base: &BaseAgent) -> Result<(), RuntimeError>;

    /// Called once per fully reassembled envelope. The returned envelope,
    /// if any, is sent to the egress target using the same publish/send
    /// method the ingress arrived on (§4.6 step 6).
    ///
    /// # Errors
    /// An error is logged; the dispatch loop continues to the next
    /// envelope rather than aborting the agent.
    async fn process_message(&self, msg: Envelope, base: &BaseAgent) -> Result<Option<Envelope>, RuntimeError>;

    /// Called once after the dispatch loop stops, whether due to shutdown
    /// or an unrecoverable error, so the runner can release resources it
    /// acquired in `init`.
    async fn cleanup(&self, base: &BaseAgent);
}

/// Errors raised by the runtime while starting or running an agent.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The broker client failed to connect or a broker call failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The agent's declared ingress or egress channel URI was invalid.
    #[error(transparent)]
    ChannelUri(#[from] channel_uri::ChannelUriError),

    /// `runner.init` failed.
    #[error("runner init failed: {0}")]
    InitFailed(String),

    /// `runner.process_message` failed.
    #[error("runner process_message failed: {0}")]
    ProcessMessageFailed(String),
}

/// Parameters describing one agent instance's wiring, normally derived
/// from its cell declaration by the orchestrator before spawning it
/// (§4.6 step 4).
pub struct RunConfig {
    /// This instance's declared name, used as both the broker agent id
    /// and the config-resolution key (§6.2).
    pub agent_name: String,
    /// Channel URI string this instance consumes from.
    pub ingress: String,
    /// Channel URI string this instance produces to.
    pub egress: String,
    /// Address of the broker to connect to, e.g. `127.0.0.1:9001`.
    pub broker_addr: String,
    /// Root directory this instance's [`ScopedFs`] is confined to.
    pub fs_root: std::path::PathBuf,
    /// `--config` CLI flag, if the agent binary was given one.
    pub config_cli_flag: Option<std::path::PathBuf>,
    /// Embedded default configuration YAML, the final fallback of the
    /// 7-level search (§6.2 level 7).
    pub embedded_defaults: &'static str,
    /// Maximum broker frame size this client accepts.
    pub max_frame_bytes: MaxFrameBytes,
    /// Token counter registered for this agent's egress destination, if
    /// any.
    pub token_counter: Option<Arc<dyn TokenCounter>>,
    /// Fires to signal the dispatch loop to stop accepting new work and
    /// drain (§4.6 step 7).
    pub shutdown: CancellationToken,
}

/// Runs `runner` to completion against `config` (§4.6 `Run`).
///
/// Implements the full sequence: resolve configuration, build the base
/// agent, connect to the broker, subscribe/bind the declared ingress,
/// invoke `runner.init`, dispatch reassembled envelopes to
/// `runner.process_message` until `config.shutdown` fires, then drain,
/// invoke `runner.cleanup`, and close the broker client.
///
/// # Errors
/// Returns [`RuntimeError`] if configuration resolution, the broker
/// connection, ingress binding, or `runner.init` fails. Per-message
/// failures from `runner.process_message` are logged, not propagated.
pub async fn run(runner: &dyn Runner, config: RunConfig) -> Result<(), RuntimeError> {
    let agent_config: AgentConfig =
        config::resolve(&config.agent_name, config.config_cli_flag.as_deref(), config.embedded_defaults)?;

    let agent_id = AgentId::from_name(&config.agent_name);
    let fs = ScopedFs::new(config.fs_root);
    let base = BaseAgent::new(
        agent_id,
        agent_config,
        fs,
        config.egress.clone(),
        config.token_counter,
        config.shutdown.clone(),
    );

    let client = Client::connect(&config.broker_addr, &config.agent_name, config.max_frame_bytes).await?;

    let ingress = channel_uri::parse(&config.ingress, Side::Ingress)?;
    let egress = channel_uri::parse(&config.egress, Side::Egress)?;

    let mut inbox = match &ingress {
        ChannelUri::Subscribe(topic) => client.subscribe(&topic.to_string()).await?,
        ChannelUri::PipeIn(_) | ChannelUri::FileSource(_) | ChannelUri::Stream(_) | ChannelUri::Route(_) => {
            // Pipe/file/stream/route ingress is pulled rather than pushed;
            // the dispatch loop below polls `receive_pipe` for the pipe
            // case and simply has nothing to subscribe to otherwise.
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            rx
        }
        ChannelUri::Publish(_) | ChannelUri::FileSink(_) => {
            return Err(RuntimeError::InitFailed(format!("{} is not a valid ingress", config.ingress)));
        }
    };

    runner.init(&base).await?;

    let collector = ChunkCollector::new(crate::time_provider::production_time_provider(), crate::chunking::collector::DEFAULT_GROUP_TIMEOUT);
    let pipe_name = if let ChannelUri::PipeIn(pipe) = &ingress { Some(pipe.clone()) } else { None };

    loop {
        let envelope = if let Some(pipe) = &pipe_name {
            tokio::select! {
                () = config.shutdown.cancelled() => break,
                result = client.receive_pipe(&pipe.to_string(), Duration::from_secs(5)) => match result {
                    Ok(envelope) => envelope,
                    Err(ClientError::Rejected { .. } | ClientError::Timeout) => continue,
                    Err(err) => {
                        tracing::warn!(%err, "pipe receive failed");
                        continue;
                    }
                },
            }
        } else {
            tokio::select! {
                () = config.shutdown.cancelled() => break,
                received = inbox.recv() => match received {
                    Some(envelope) => envelope,
                    None => break,
                },
            }
        };

        let (mut reassembled, complete) = collector.collect(envelope).await;
        if !complete {
            continue;
        }
        reassembled.add_hop(&agent_id);

        // If shutdown was already requested before this call started (a
        // message landed in the same tick the signal fired), bound how
        // long we wait for it rather than draining indefinitely (§4.6
        // step 7).
        let outcome = if config.shutdown.is_cancelled() {
            match tokio::time::timeout(DEFAULT_DRAIN_TIMEOUT, runner.process_message(reassembled, &base)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(agent_id = %agent_id, "drain timeout exceeded, abandoning in-flight process_message");
                    continue;
                }
            }
        } else {
            runner.process_message(reassembled, &base).await
        };

        match outcome {
            Ok(Some(response)) => {
                if let Err(err) = send_via(&client, &egress, response, base.token_counter().as_ref()).await {
                    tracing::warn!(%err, "failed to deliver response to egress");
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(agent_id = %agent_id, %err, "process_message failed"),
        }
    }

    runner.cleanup(&base).await;
    client.close().await;
    Ok(())
}

/// Sends `envelope` to `egress`, first asking the chunking engine to split
/// it against the destination's registered token budget if one is known
/// (§2, §4.5). With no counter registered the envelope goes out whole,
/// exactly as before — chunking only ever engages when there is a budget to
/// chunk against.
async fn send_via(
    client: &Client,
    egress: &ChannelUri,
    envelope: Envelope,
    token_counter: Option<&Arc<dyn TokenCounter>>,
) -> Result<(), ClientError> {
    let outgoing = match token_counter {
        Some(counter) => split_for_egress(envelope, counter),
        None => vec![envelope],
    };

    for chunk in outgoing {
        match egress {
            ChannelUri::Publish(topic) => client.publish(&topic.to_string(), chunk).await?,
            ChannelUri::PipeOut(pipe) => client.send_pipe(&pipe.to_string(), chunk).await?,
            ChannelUri::FileSink(_) | ChannelUri::Stream(_) | ChannelUri::Route(_) => {
                tracing::debug!("egress kind has no broker-side delivery; runner is expected to handle it directly");
            }
            ChannelUri::Subscribe(_) | ChannelUri::FileSource(_) => {
                tracing::warn!("ingress-only channel kind used as egress, dropping response");
            }
        }
    }
    Ok(())
}

/// Budgets `envelope` against `counter` and splits it if it would exceed
/// the destination's limit, falling back to a single unsplit envelope if
/// the split itself fails (e.g. a `Content-Type: application/json` payload
/// that isn't valid JSON).
fn split_for_egress(envelope: Envelope, counter: &Arc<dyn TokenCounter>) -> Vec<Envelope> {
    let registry = CounterRegistry::new();
    registry.register(EGRESS_COUNTER_KEY, Arc::clone(counter));
    let budget = chunking::compute_budget(&envelope, EGRESS_COUNTER_KEY, &registry, SafetyMargin::default());

    if !budget.needs_splitting {
        return vec![envelope];
    }

    match chunking::split(&envelope, budget.suggested_chunks) {
        Ok(chunks) => chunks,
        Err(err) => {
            tracing::warn!(%err, "failed to split oversized envelope for egress, sending unsplit");
            vec![envelope]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct EchoRunner;

    #[async_trait]
    impl Runner for EchoRunner {
        async fn init(&self, _base: &BaseAgent) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn process_message(&self, msg: Envelope, base: &BaseAgent) -> Result<Option<Envelope>, RuntimeError> {
            let mut response = Envelope::new("echo-reply", base.agent_id().to_string(), msg.payload.clone());
            response.correlation_id = Some(msg.id);
            Ok(Some(response))
        }

        async fn cleanup(&self, _base: &BaseAgent) {}
    }

    #[tokio::test]
    async fn echo_runner_replies_with_correlated_payload() {
        let runner = EchoRunner;
        let base = BaseAgent::new(
            AgentId::from_name("test-agent"),
            AgentConfig::default(),
            ScopedFs::new(std::env::temp_dir()),
            "pub:out".to_string(),
            None,
            CancellationToken::new(),
        );
        let request = Envelope::new("greet", "caller", Bytes::from_static(b"hi"));
        let request_id = request.id.clone();
        let response = runner.process_message(request, &base).await.unwrap().unwrap();
        assert_eq!(response.correlation_id, Some(request_id));
        assert_eq!(response.payload, Bytes::from_static(b"hi"));
    }
}
