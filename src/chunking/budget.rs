//! Token budget calculation for a candidate envelope (§4.3.1).

use std::sync::Arc;

use crate::domain_types::SafetyMargin;
use crate::envelope::Envelope;
use crate::token_counter::{CounterRegistry, HeuristicCounter, TokenCounter};

/// Fixed per-envelope overhead charged against the token budget to account
/// for message framing (id, correlation id, routing fields) beyond the raw
/// header bytes (§4.3.1).
pub const FRAMING_OVERHEAD_TOKENS: usize = 64;

/// Below this many total tokens an envelope is never chunked, regardless of
/// how tight the destination's limit is (§4.3.4).
pub const MIN_VIABLE_CHUNK_TOKENS: usize = 32;

/// Result of budgeting one envelope against a destination's token counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Tokens attributed to the payload.
    pub payload_tokens: usize,
    /// Tokens attributed to headers and framing overhead.
    pub header_tokens: usize,
    /// `payload_tokens + header_tokens`.
    pub total_tokens: usize,
    /// The effective limit chunks must each stay under.
    pub per_chunk_limit: usize,
    /// Whether the envelope should be split.
    pub needs_splitting: bool,
    /// Number of chunks to aim for if splitting (`1` if not splitting).
    pub suggested_chunks: usize,
}

/// Computes a [`Budget`] for `envelope` against the counter registered for
/// `destination`, falling back to a heuristic counter if none is registered
/// (§4.3.4: "counter not registered" and "counter errors" both degrade to
/// the character-ratio estimate rather than failing the send).
#[must_use]
pub fn compute(
    envelope: &Envelope,
    destination: &str,
    registry: &CounterRegistry,
    safety_margin: SafetyMargin,
) -> Budget {
    if envelope.payload.is_empty() {
        return Budget {
            payload_tokens: 0,
            header_tokens: 0,
            total_tokens: 0,
            per_chunk_limit: usize::MAX,
            needs_splitting: false,
            suggested_chunks: 1,
        };
    }

    let counter = resolve_counter(destination, registry);
    let payload_text = String::from_utf8_lossy(&envelope.payload);
    let payload_tokens = counter.count(&payload_text);
    let header_tokens = estimate_header_tokens(envelope);
    let total_tokens = payload_tokens + header_tokens;

    let effective_limit =
        (counter.limit() as f64 * (1.0 - safety_margin.as_f64())).floor() as usize;

    let needs_splitting =
        total_tokens > MIN_VIABLE_CHUNK_TOKENS && total_tokens > effective_limit;

    let suggested_chunks = if needs_splitting {
        total_tokens.div_ceil(effective_limit.max(1))
    } else {
        1
    };

    Budget {
        payload_tokens,
        header_tokens,
        total_tokens,
        per_chunk_limit: effective_limit,
        needs_splitting,
        suggested_chunks,
    }
}

/// Conservative header-token estimate: sum of key/value character lengths
/// divided by four, rounded up, plus the fixed framing overhead (§4.3.1).
fn estimate_header_tokens(envelope: &Envelope) -> usize {
    let header_chars = envelope.headers.total_chars();
    header_chars.div_ceil(4) + FRAMING_OVERHEAD_TOKENS
}

fn resolve_counter(destination: &str, registry: &CounterRegistry) -> Arc<dyn TokenCounter> {
    match registry.get(destination) {
        Ok(counter) => counter,
        Err(_) => {
            tracing::debug!(destination, "no token counter registered, using heuristic fallback");
            Arc::new(HeuristicCounter::new(usize::MAX))
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::token_counter::HeuristicCounter;

    fn envelope_with_payload(bytes: &[u8]) -> Envelope {
        Envelope::new("test", "agent-a", Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn empty_payload_never_chunked() {
        let env = envelope_with_payload(b"");
        let registry = CounterRegistry::new();
        let budget = compute(&env, "agent-b", &registry, SafetyMargin::try_from(0.10).unwrap());
        assert!(!budget.needs_splitting);
        assert_eq!(budget.total_tokens, 0);
    }

    #[test]
    fn small_payload_under_minimum_never_chunked_even_with_tiny_limit() {
        let env = envelope_with_payload(b"hi");
        let registry = CounterRegistry::new();
        registry.register("agent-b", Arc::new(HeuristicCounter::new(1)));
        let budget = compute(&env, "agent-b", &registry, SafetyMargin::try_from(0.10).unwrap());
        assert!(!budget.needs_splitting);
    }

    #[test]
    fn missing_counter_falls_back_to_heuristic_without_chunking_small_payload() {
        let env = envelope_with_payload(b"a modestly sized payload of text");
        let registry = CounterRegistry::new();
        let budget = compute(&env, "agent-unknown", &registry, SafetyMargin::try_from(0.10).unwrap());
        assert!(!budget.needs_splitting);
    }

    #[test]
    fn just_above_limit_splits_into_exactly_two() {
        let payload = "word ".repeat(2000);
        let env = envelope_with_payload(payload.as_bytes());
        let registry = CounterRegistry::new();
        registry.register("agent-b", Arc::new(HeuristicCounter::new(1300)));
        let budget = compute(&env, "agent-b", &registry, SafetyMargin::try_from(0.0).unwrap());
        assert!(budget.needs_splitting);
        assert_eq!(budget.suggested_chunks, 2);
    }
}
