//! Domain types shared across the crate.
//!
//! Strongly-typed wrappers prevent primitive obsession (a bare `String` or
//! `usize` flowing through broker, chunking and orchestrator code without any
//! indication of what it represents or what values are valid).

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for an agent instance, unique within a running cell.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a fresh random agent id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Deterministic id derived from an agent's declared name, stable across
    /// restarts so reconnects resolve to the same identity.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

/// Human-readable agent name as declared in a cell definition.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentName(String);

/// Name of a pub/sub topic.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct TopicName(String);

/// Name of a point-to-point pipe.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct PipeName(String);

/// Broker-generated identifier for a live connection.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a fresh random connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Bounded capacity for topic ring-buffers and pipe channels.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Value as `usize`, the shape tokio's bounded channels want.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum frame size accepted on the broker wire, in bytes.
#[nutype(
    validate(greater_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 16_777_216
)]
pub struct MaxFrameBytes(usize);

impl MaxFrameBytes {
    /// Value as `usize`.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Safety margin subtracted from a token limit before deciding to split,
/// expressed as a fraction in `[0, 1)`.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 0.9),
    derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 0.10
)]
pub struct SafetyMargin(f64);

impl SafetyMargin {
    /// Value as `f64`.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Restart policy for an orchestrator-managed agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart a crashed instance.
    Never,
    /// Restart only after a non-graceful exit (the default).
    OnFailure,
    /// Always restart, even after a clean exit.
    Always,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::OnFailure
    }
}
