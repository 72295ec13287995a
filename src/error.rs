//! Crate-wide error aggregation.
//!
//! Each subsystem owns a focused error enum (`EnvelopeError`, `ChunkingError`,
//! `broker::BrokerError`, `ClientError`, `RuntimeError`, `OrchestratorError`,
//! `ConfigError`); this module only aggregates them for call sites — binaries,
//! top-level API — that want a single `Result` type.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::chunking::ChunkingError;
use crate::client::ClientError;
use crate::config::ConfigError;
use crate::envelope::EnvelopeError;
use crate::orchestrator::OrchestratorError;
use crate::runtime::RuntimeError;

/// Aggregated crate error.
#[derive(Debug, Error)]
pub enum CellError {
    /// An envelope was malformed or failed validation.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Chunking or reassembly failed.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    /// The broker rejected or could not process a request.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker client failed to connect, send or receive.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The agent framework runtime failed to start or run an agent.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The orchestrator failed to plan, start or supervise a cell.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Configuration could not be resolved or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
