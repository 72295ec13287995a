//! Token counters for budget and chunking decisions (§4.2).
//!
//! A [`TokenCounter`] answers "how many tokens would this text cost against
//! model X's limit". Providers are registered once per process and looked up
//! by the destination name the chunking engine is about to send to.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

/// Characters-per-token ratio used by the heuristic fallback counter and by
/// callers estimating cost when a provider's own counter errors out
/// (§4.3.4).
pub const HEURISTIC_CHARS_PER_TOKEN: f64 = 4.0;

/// Errors produced by token counting.
#[derive(Debug, Error)]
pub enum CounterError {
    /// No counter is registered for the requested destination.
    #[error("no token counter registered for destination {0}")]
    CounterUnavailable(String),
}

/// Capability set a token counter exposes to the chunking engine (§4.2).
pub trait TokenCounter: Send + Sync + std::fmt::Debug {
    /// Counts tokens in `text` under this counter's model.
    fn count(&self, text: &str) -> usize;

    /// The provider family, e.g. `"anthropic"` or `"openai"`.
    fn provider(&self) -> &str;

    /// The specific model name this counter was built for.
    fn model(&self) -> &str;

    /// The model's maximum context length in tokens.
    fn limit(&self) -> usize;
}

/// Counts tokens the way Anthropic-family models roughly tokenize: close to
/// the heuristic ratio, but the distinct type lets a destination declare its
/// actual provider and limit.
#[derive(Debug, Clone)]
pub struct AnthropicCounter {
    model: String,
    limit: usize,
}

impl AnthropicCounter {
    /// Creates a counter for the named Anthropic model with the given
    /// context limit.
    #[must_use]
    pub fn new(model: impl Into<String>, limit: usize) -> Self {
        Self { model: model.into(), limit }
    }
}

impl TokenCounter for AnthropicCounter {
    fn count(&self, text: &str) -> usize {
        heuristic_count(text)
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

/// Counts tokens the way OpenAI-family models roughly tokenize.
#[derive(Debug, Clone)]
pub struct OpenAiCounter {
    model: String,
    limit: usize,
}

impl OpenAiCounter {
    /// Creates a counter for the named OpenAI model with the given context
    /// limit.
    #[must_use]
    pub fn new(model: impl Into<String>, limit: usize) -> Self {
        Self { model: model.into(), limit }
    }
}

impl TokenCounter for OpenAiCounter {
    fn count(&self, text: &str) -> usize {
        heuristic_count(text)
    }

    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

/// Fallback counter for destinations with no known tokenizer: a flat
/// character-per-token ratio (§4.2).
#[derive(Debug, Clone)]
pub struct HeuristicCounter {
    limit: usize,
}

impl HeuristicCounter {
    /// Creates a heuristic counter with the given context limit.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        heuristic_count(text)
    }

    fn provider(&self) -> &str {
        "heuristic"
    }

    fn model(&self) -> &str {
        "unknown"
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

fn heuristic_count(text: &str) -> usize {
    (text.chars().count() as f64 / HEURISTIC_CHARS_PER_TOKEN).ceil() as usize
}

/// Process-wide registry mapping a destination name to its counter.
///
/// Registration happens once at startup (typically from config); lookups
/// happen on the chunking engine's hot path, so the registry is a lock-free
/// concurrent map rather than a mutex-guarded `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct CounterRegistry {
    counters: Arc<DashMap<String, Arc<dyn TokenCounter>>>,
}

impl CounterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the counter used for `destination`.
    pub fn register(&self, destination: impl Into<String>, counter: Arc<dyn TokenCounter>) {
        self.counters.insert(destination.into(), counter);
    }

    /// Looks up the counter registered for `destination`.
    ///
    /// # Errors
    /// Returns [`CounterError::CounterUnavailable`] if nothing is registered.
    pub fn get(&self, destination: &str) -> Result<Arc<dyn TokenCounter>, CounterError> {
        self.counters
            .get(destination)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CounterError::CounterUnavailable(destination.to_string()))
    }
}
