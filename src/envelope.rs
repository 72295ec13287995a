//! The canonical inter-agent message and its lightweight sibling.
//!
//! An [`Envelope`] is never mutated in place except to append a hop or fill
//! in a missing destination (§3 Lifecycle). Every other change — chunking,
//! header rewriting — produces a new envelope.

use std::collections::HashMap;

use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain_types::AgentId;

/// Header name the broker stamps with the receive time on first ingress, if
/// the producer didn't already set one (§4.1).
pub const HEADER_RECEIVED_AT: &str = "X-Received-At";
/// Header carrying the shared chunk-group identifier.
pub const HEADER_CHUNK_ID: &str = "X-Chunk-ID";
/// Header carrying a chunk's zero-based index within its group.
pub const HEADER_CHUNK_INDEX: &str = "X-Chunk-Index";
/// Header carrying the total chunk count in a group.
pub const HEADER_CHUNK_TOTAL: &str = "X-Chunk-Total";
/// Header marking a lone oversize chunk that could not be split further.
pub const HEADER_CHUNK_OVERSIZE: &str = "X-Chunk-Oversize";
/// Header signaling the payload is base64-encoded binary, not UTF-8 text.
pub const HEADER_PAYLOAD_ENCODING: &str = "X-Payload-Encoding";
/// Value of [`HEADER_PAYLOAD_ENCODING`] marking a base64-encoded payload.
pub const PAYLOAD_ENCODING_BASE64: &str = "base64";
/// Header naming the payload's structural content type. Defaults to JSON.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Default value of [`HEADER_CONTENT_TYPE`] when a producer doesn't set one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Errors produced while constructing, validating or (de)serializing an
/// envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A required field (`id`, `message_type`, `source`) was empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// `X-Chunk-Index` was not less than `X-Chunk-Total`.
    #[error("chunk index {index} is not less than chunk total {total}")]
    ChunkIndexOutOfRange {
        /// The offending index.
        index: u32,
        /// The group's declared total.
        total: u32,
    },

    /// A chunk header was present but not a valid unsigned integer.
    #[error("malformed chunk header {header}: {value}")]
    MalformedChunkHeader {
        /// Which header failed to parse.
        header: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },

    /// JSON encode/decode of the wire frame failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The payload was declared base64 but did not decode.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Case-insensitive header map, per the transport convention in §4.1.
///
/// Keys are normalized to lowercase on insert and lookup so
/// `X-Chunk-ID`/`x-chunk-id` are the same header. The broker "MUST NOT
/// rewrite them except to stamp `X-Received-At`".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    /// An empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a header case-insensitively.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Sets a header, normalizing the key to lowercase for storage.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), value.into());
    }

    /// Removes a header case-insensitively, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    /// True if no headers are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sum of key and value character lengths, used by the budget engine's
    /// conservative header-token estimate (§4.3.1).
    #[must_use]
    pub fn total_chars(&self) -> usize {
        self.0.iter().map(|(k, v)| k.chars().count() + v.chars().count()).sum()
    }

    /// Returns a copy with all `X-Chunk-*` headers removed — used when
    /// reassembling a chunk group back into the original envelope (§4.3.3).
    #[must_use]
    pub fn without_chunk_headers(&self) -> Self {
        let mut copy = self.clone();
        copy.remove(HEADER_CHUNK_ID);
        copy.remove(HEADER_CHUNK_INDEX);
        copy.remove(HEADER_CHUNK_TOTAL);
        copy.remove(HEADER_CHUNK_OVERSIZE);
        copy
    }
}

/// The canonical structured inter-agent message (§3).
///
/// Serializes via [`WireEnvelope`]: the payload is carried as UTF-8 text on
/// the wire, or base64 text when `headers` declares
/// `X-Payload-Encoding: base64` — producers set that header themselves when
/// handing the framework non-UTF-8 bytes (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "WireEnvelope", try_from = "WireEnvelope")]
pub struct Envelope {
    /// Opaque unique identifier.
    pub id: String,
    /// Links chunks/responses back to an originating envelope.
    pub correlation_id: Option<String>,
    /// Routing/dispatch discriminator.
    pub message_type: String,
    /// Logical identifier of the producing agent.
    pub source: String,
    /// Logical identifier of the destination — topic, pipe, agent or role.
    /// May be empty at construction time and filled in once by the runtime.
    pub destination: String,
    /// Opaque byte payload — semantically JSON or arbitrary bytes.
    pub payload: Bytes,
    /// Transport and chunk metadata.
    pub headers: Headers,
    /// Ordered, append-only traversal history.
    pub hops: Vec<String>,
    /// Distributed tracing identifier.
    pub trace_id: Option<String>,
    /// Distributed tracing span identifier.
    pub span_id: Option<String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// Wire shape of [`Envelope`]: identical except `payload` is text, never raw
/// bytes, matching the JSON frames on the broker's TCP wire (§4.1, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    id: String,
    correlation_id: Option<String>,
    message_type: String,
    source: String,
    destination: String,
    payload: String,
    headers: Headers,
    hops: Vec<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl From<Envelope> for WireEnvelope {
    fn from(env: Envelope) -> Self {
        let is_base64 = env.headers.get(HEADER_PAYLOAD_ENCODING) == Some(PAYLOAD_ENCODING_BASE64)
            || std::str::from_utf8(&env.payload).is_err();
        let mut headers = env.headers;
        let payload = if is_base64 {
            headers.insert(HEADER_PAYLOAD_ENCODING, PAYLOAD_ENCODING_BASE64);
            base64::engine::general_purpose::STANDARD.encode(&env.payload)
        } else {
            // Safe: we only reach this branch when `from_utf8` succeeded above.
            String::from_utf8_lossy(&env.payload).into_owned()
        };
        Self {
            id: env.id,
            correlation_id: env.correlation_id,
            message_type: env.message_type,
            source: env.source,
            destination: env.destination,
            payload,
            headers,
            hops: env.hops,
            trace_id: env.trace_id,
            span_id: env.span_id,
            timestamp: env.timestamp,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let payload = if wire.headers.get(HEADER_PAYLOAD_ENCODING) == Some(PAYLOAD_ENCODING_BASE64) {
            Bytes::from(base64::engine::general_purpose::STANDARD.decode(wire.payload)?)
        } else {
            Bytes::from(wire.payload.into_bytes())
        };
        Ok(Self {
            id: wire.id,
            correlation_id: wire.correlation_id,
            message_type: wire.message_type,
            source: wire.source,
            destination: wire.destination,
            payload,
            headers: wire.headers,
            hops: wire.hops,
            trace_id: wire.trace_id,
            span_id: wire.span_id,
            timestamp: wire.timestamp,
        })
    }
}

impl Envelope {
    /// Creates a fresh envelope with a random id and the current timestamp.
    #[must_use]
    pub fn new(message_type: impl Into<String>, source: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            message_type: message_type.into(),
            source: source.into(),
            destination: String::new(),
            payload: payload.into(),
            headers: Headers::new(),
            hops: Vec::new(),
            trace_id: None,
            span_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Appends a hop, recording that `agent_id` handled this envelope.
    /// Hops are append-only (§3 Invariants).
    pub fn add_hop(&mut self, agent_id: &AgentId) {
        self.hops.push(agent_id.to_string());
    }

    /// Fills in the destination if it hasn't been set yet. The only other
    /// permitted in-place mutation besides appending a hop (§3 Lifecycle).
    pub fn set_destination_if_missing(&mut self, destination: impl Into<String>) {
        if self.destination.is_empty() {
            self.destination = destination.into();
        }
    }

    /// Validates required fields and chunk-header consistency, returning an
    /// error describing the first problem found (§4.1).
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        if self.message_type.is_empty() {
            return Err(EnvelopeError::MissingField("message_type"));
        }
        if self.source.is_empty() {
            return Err(EnvelopeError::MissingField("source"));
        }

        if let (Some(index), Some(total)) = (
            self.headers.get(HEADER_CHUNK_INDEX),
            self.headers.get(HEADER_CHUNK_TOTAL),
        ) {
            let index: u32 = index
                .parse()
                .map_err(|_| EnvelopeError::MalformedChunkHeader {
                    header: HEADER_CHUNK_INDEX,
                    value: index.to_string(),
                })?;
            let total: u32 = total
                .parse()
                .map_err(|_| EnvelopeError::MalformedChunkHeader {
                    header: HEADER_CHUNK_TOTAL,
                    value: total.to_string(),
                })?;
            if index >= total {
                return Err(EnvelopeError::ChunkIndexOutOfRange { index, total });
            }
        }

        Ok(())
    }

    /// Serializes to the wire's JSON text encoding.
    pub fn marshal(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the wire's JSON text encoding back into an [`Envelope`].
    pub fn unmarshal(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Stamps `X-Received-At` with `now` if the envelope doesn't already
    /// carry one — the only header rewrite the broker is allowed to make
    /// (§4.1).
    pub fn stamp_received_at(&mut self, now: DateTime<Utc>) {
        if self.headers.get(HEADER_RECEIVED_AT).is_none() {
            self.headers.insert(HEADER_RECEIVED_AT, now.to_rfc3339());
        }
    }

    /// The content type declared by `Content-Type`, defaulting to
    /// `application/json` (§4.1, §9).
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.headers.get(HEADER_CONTENT_TYPE).unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// True if this envelope is one chunk of a larger group.
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        self.headers.get(HEADER_CHUNK_ID).is_some()
    }
}

/// Lightweight message variant used where envelope metadata is overkill
/// (§3). Routed identically to [`Envelope`] but without hop tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Opaque unique identifier.
    pub id: String,
    /// Routing/dispatch discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Destination — topic, pipe, agent or role.
    pub target: String,
    /// Any JSON-serializable payload.
    pub payload: serde_json::Value,
    /// Free-form metadata.
    pub meta: HashMap<String, String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a fresh message with a random id and the current timestamp.
    #[must_use]
    pub fn new(kind: impl Into<String>, target: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            target: target.into(),
            payload,
            meta: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new("greet", "agent-a", Bytes::from_static(b"hello"))
    }

    #[test]
    fn new_envelope_validates() {
        let env = sample();
        assert!(env.validate().is_ok());
    }

    #[test]
    fn missing_message_type_fails_validation() {
        let mut env = sample();
        env.message_type.clear();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::MissingField("message_type"))
        ));
    }

    #[test]
    fn hops_are_appended_in_order() {
        let mut env = sample();
        let a = AgentId::generate();
        let b = AgentId::generate();
        env.add_hop(&a);
        env.add_hop(&b);
        assert_eq!(env.hops, vec![a.to_string(), b.to_string()]);
    }

    #[test]
    fn destination_set_only_once() {
        let mut env = sample();
        env.set_destination_if_missing("topic:a");
        env.set_destination_if_missing("topic:b");
        assert_eq!(env.destination, "topic:a");
    }

    #[test]
    fn marshal_unmarshal_round_trips_text_payload() {
        let mut env = sample();
        env.headers.insert("X-Custom", "value");
        let wire = env.marshal().unwrap();
        let back = Envelope::unmarshal(&wire).unwrap();
        assert_eq!(back.id, env.id);
        assert_eq!(back.payload, env.payload);
        assert_eq!(back.headers.get("x-custom"), Some("value"));
    }

    #[test]
    fn marshal_unmarshal_round_trips_binary_payload() {
        let binary: Vec<u8> = vec![0xff, 0x00, 0x01, 0xfe, 0x80];
        let env = Envelope::new("blob", "agent-a", Bytes::from(binary.clone()));
        let wire = env.marshal().unwrap();
        assert!(wire.contains(PAYLOAD_ENCODING_BASE64));
        let back = Envelope::unmarshal(&wire).unwrap();
        assert_eq!(back.payload.as_ref(), binary.as_slice());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("X-Chunk-ID", "abc");
        assert_eq!(headers.get("x-chunk-id"), Some("abc"));
        assert_eq!(headers.get("X-CHUNK-ID"), Some("abc"));
    }

    #[test]
    fn chunk_index_must_be_less_than_total() {
        let mut env = sample();
        env.headers.insert(HEADER_CHUNK_INDEX, "3");
        env.headers.insert(HEADER_CHUNK_TOTAL, "3");
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::ChunkIndexOutOfRange { index: 3, total: 3 })
        ));
    }

    #[test]
    fn received_at_stamped_only_if_absent() {
        let mut env = sample();
        let t1 = Utc::now();
        env.stamp_received_at(t1);
        let stamped = env.headers.get(HEADER_RECEIVED_AT).unwrap().to_string();
        env.stamp_received_at(t1 + chrono::Duration::seconds(5));
        assert_eq!(env.headers.get(HEADER_RECEIVED_AT).unwrap(), stamped);
    }

    #[test]
    fn without_chunk_headers_drops_only_chunk_keys() {
        let mut headers = Headers::new();
        headers.insert(HEADER_CHUNK_ID, "g1");
        headers.insert(HEADER_CHUNK_INDEX, "0");
        headers.insert(HEADER_CHUNK_TOTAL, "2");
        headers.insert("X-Trace", "t1");
        let cleaned = headers.without_chunk_headers();
        assert!(cleaned.get(HEADER_CHUNK_ID).is_none());
        assert_eq!(cleaned.get("x-trace"), Some("t1"));
    }
}
