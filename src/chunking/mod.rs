//! Budget-aware splitting and reassembly of oversized envelopes (§4.3).

pub mod budget;
pub mod collector;
pub mod splitter;

use thiserror::Error;

pub use budget::{compute as compute_budget, Budget};
pub use collector::ChunkCollector;
pub use splitter::split;

/// Errors produced by the chunking engine.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// The payload was declared JSON but failed to parse, so it could not
    /// be inspected for element-wise splitting.
    #[error("failed to split payload: {reason}")]
    SplitFailed {
        /// Description of why the split attempt failed.
        reason: String,
    },
}
