//! Payload-aware splitting of an oversized envelope into a chunk group
//! (§4.3.2).

use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{
    Envelope, HEADER_CHUNK_ID, HEADER_CHUNK_INDEX, HEADER_CHUNK_OVERSIZE, HEADER_CHUNK_TOTAL,
};

use super::ChunkingError;

/// Splits `envelope` into a chunk group sized to `suggested_chunks`,
/// choosing a strategy based on the payload's `Content-Type` and shape.
///
/// Returns the chunks in index order. Never returns an empty vector: a
/// payload that can't be meaningfully divided comes back as a single,
/// possibly oversize, chunk.
///
/// # Errors
/// Returns [`ChunkingError::SplitFailed`] if `envelope`'s payload is
/// declared JSON (`Content-Type: application/json`) but is not valid JSON.
pub fn split(envelope: &Envelope, suggested_chunks: usize) -> Result<Vec<Envelope>, ChunkingError> {
    let suggested_chunks = suggested_chunks.max(1);
    let chunk_id = Uuid::new_v4().to_string();

    let bodies = if envelope.content_type() == "application/json" {
        let value: Value = serde_json::from_slice(&envelope.payload)
            .map_err(|source| ChunkingError::SplitFailed { reason: source.to_string() })?;
        match value {
            Value::Array(elements) => split_json_array(&elements, suggested_chunks),
            _ => vec![(envelope.payload.clone(), false)],
        }
    } else if is_probably_text(&envelope.payload) {
        split_text(&envelope.payload, suggested_chunks)
    } else {
        split_bytes(&envelope.payload, suggested_chunks)
    };

    let total = bodies.len() as u32;
    Ok(bodies
        .into_iter()
        .enumerate()
        .map(|(index, (body, oversize))| {
            build_chunk(envelope, &chunk_id, index as u32, total, body, oversize)
        })
        .collect())
}

fn build_chunk(
    original: &Envelope,
    chunk_id: &str,
    index: u32,
    total: u32,
    body: Bytes,
    oversize: bool,
) -> Envelope {
    let mut chunk = Envelope::new(original.message_type.clone(), original.source.clone(), body);
    chunk.correlation_id = Some(original.id.clone());
    chunk.destination = original.destination.clone();
    chunk.trace_id = original.trace_id.clone();
    chunk.headers = original.headers.clone();
    chunk.headers.insert(HEADER_CHUNK_ID, chunk_id);
    chunk.headers.insert(HEADER_CHUNK_INDEX, index.to_string());
    chunk.headers.insert(HEADER_CHUNK_TOTAL, total.to_string());
    if oversize {
        chunk.headers.insert(HEADER_CHUNK_OVERSIZE, "true");
    }
    chunk
}

/// Weighted-contiguous assignment of array elements to chunks: elements are
/// walked in order, accumulating into the current bucket until it reaches
/// its share of the total weight, then the next bucket starts. Buckets are
/// always contiguous slices of the original array, so concatenating their
/// elements back together in index order reproduces the original sequence
/// (§8: "merges to … an array equal element-wise to E's payload"). A single
/// element bigger than the rest still lands alone if it dominates its
/// bucket; we mark oversize only when there is exactly one element in the
/// entire array (the degenerate case named in §4.3.2).
fn split_json_array(elements: &[Value], suggested_chunks: usize) -> Vec<(Bytes, bool)> {
    if elements.is_empty() {
        return vec![(Bytes::from_static(b"[]"), false)];
    }
    if elements.len() == 1 {
        let body = serde_json::to_vec(elements).unwrap_or_default();
        return vec![(Bytes::from(body), true)];
    }

    let chunk_count = suggested_chunks.min(elements.len()).max(1);
    let weights: Vec<usize> =
        elements.iter().map(|e| serde_json::to_string(e).map(|s| s.len()).unwrap_or(1)).collect();
    let total_weight: usize = weights.iter().sum();
    let target_weight = (total_weight / chunk_count).max(1);

    let mut buckets: Vec<Vec<Value>> = Vec::with_capacity(chunk_count);
    let mut current: Vec<Value> = Vec::new();
    let mut current_weight = 0usize;

    for (element, weight) in elements.iter().zip(weights.iter()) {
        current.push(element.clone());
        current_weight += weight;
        if current_weight >= target_weight && buckets.len() + 1 < chunk_count {
            buckets.push(std::mem::take(&mut current));
            current_weight = 0;
        }
    }
    if !current.is_empty() {
        buckets.push(current);
    }

    buckets
        .into_iter()
        .map(|bucket| {
            let body = serde_json::to_vec(&bucket).unwrap_or_default();
            (Bytes::from(body), false)
        })
        .collect()
}

/// Splits text at whitespace-run boundaries without dropping any bytes:
/// the payload is tokenized into alternating whitespace/non-whitespace
/// runs, and a chunk boundary is only placed right after a non-whitespace
/// token, so every byte of the original (including runs of internal
/// whitespace) ends up in exactly one chunk. Concatenating the chunks in
/// order reproduces the input exactly (§8).
fn split_text(payload: &Bytes, suggested_chunks: usize) -> Vec<(Bytes, bool)> {
    let Ok(text) = std::str::from_utf8(payload) else {
        return split_bytes(payload, suggested_chunks);
    };
    if text.is_empty() {
        return vec![(payload.clone(), false)];
    }

    let tokens = whitespace_runs(text);
    let word_count = tokens.iter().filter(|t| !t.trim().is_empty()).count();
    if word_count == 0 {
        return vec![(payload.clone(), false)];
    }

    let chunk_count = suggested_chunks.min(word_count).max(1);
    let words_per_chunk = word_count.div_ceil(chunk_count);

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut words_in_current = 0;

    for token in tokens {
        current.push_str(token);
        if !token.trim().is_empty() {
            words_in_current += 1;
        }
        if words_in_current >= words_per_chunk && chunks.len() + 1 < chunk_count {
            chunks.push(std::mem::take(&mut current));
            words_in_current = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks.into_iter().map(|s| (Bytes::from(s.into_bytes()), false)).collect()
}

/// Splits `text` into maximal runs of whitespace and non-whitespace
/// characters, preserving order and exact byte content.
fn whitespace_runs(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut current_is_whitespace: Option<bool> = None;

    for (index, ch) in text.char_indices() {
        let is_whitespace = ch.is_whitespace();
        match current_is_whitespace {
            None => current_is_whitespace = Some(is_whitespace),
            Some(previous) if previous != is_whitespace => {
                tokens.push(&text[start..index]);
                start = index;
                current_is_whitespace = Some(is_whitespace);
            }
            _ => {}
        }
    }
    tokens.push(&text[start..]);
    tokens
}

fn split_bytes(payload: &Bytes, suggested_chunks: usize) -> Vec<(Bytes, bool)> {
    if payload.is_empty() {
        return vec![(payload.clone(), false)];
    }
    let chunk_count = suggested_chunks.min(payload.len()).max(1);
    let per_chunk = payload.len().div_ceil(chunk_count);

    payload
        .chunks(per_chunk.max(1))
        .map(|slice| (Bytes::copy_from_slice(slice), false))
        .collect()
}

fn is_probably_text(payload: &Bytes) -> bool {
    std::str::from_utf8(payload).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_array_envelope(count: usize) -> Envelope {
        let elements: Vec<Value> = (0..count).map(|i| Value::from(format!("item-{i}"))).collect();
        let body = serde_json::to_vec(&Value::Array(elements)).unwrap();
        let mut env = Envelope::new("data", "agent-a", Bytes::from(body));
        env.headers.insert("Content-Type", "application/json");
        env
    }

    #[test]
    fn json_array_splits_by_element_without_splitting_any_one() {
        let env = json_array_envelope(10);
        let chunks = split(&env, 4).unwrap();
        assert!(chunks.len() <= 4);
        let total_elements: usize = chunks
            .iter()
            .map(|c| {
                let value: Value = serde_json::from_slice(&c.payload).unwrap();
                value.as_array().unwrap().len()
            })
            .sum();
        assert_eq!(total_elements, 10);
    }

    #[test]
    fn chunk_headers_are_consistent_across_the_group() {
        let env = json_array_envelope(10);
        let chunks = split(&env, 3).unwrap();
        let total = chunks.len() as u32;
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.headers.get(HEADER_CHUNK_INDEX).unwrap(), index.to_string());
            assert_eq!(chunk.headers.get(HEADER_CHUNK_TOTAL).unwrap(), total.to_string());
        }
    }

    #[test]
    fn single_element_array_is_oversize_lone_chunk() {
        let env = json_array_envelope(1);
        let chunks = split(&env, 4).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].headers.get(HEADER_CHUNK_OVERSIZE), Some("true"));
    }

    #[test]
    fn json_object_payload_is_indivisible() {
        let body = serde_json::to_vec(&serde_json::json!({"a": 1, "b": 2})).unwrap();
        let mut env = Envelope::new("data", "agent-a", Bytes::from(body));
        env.headers.insert("Content-Type", "application/json");
        let chunks = split(&env, 4).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    fn text_envelope(text: &str) -> Envelope {
        let mut env = Envelope::new("note", "agent-a", Bytes::from(text.as_bytes().to_vec()));
        env.headers.insert("Content-Type", "text/plain");
        env
    }

    #[test]
    fn text_payload_splits_on_word_boundaries_preserving_order() {
        let text = "the quick brown fox jumps over the lazy dog";
        let chunks = split(&text_envelope(text), 3).unwrap();
        let reassembled: String = chunks.iter().map(|c| std::str::from_utf8(&c.payload).unwrap()).collect();
        assert_eq!(reassembled, text);
    }

    #[test]
    fn text_payload_with_irregular_whitespace_concatenates_back_exactly() {
        let text = "alpha  beta\tgamma\n\ndelta   epsilon";
        let chunks = split(&text_envelope(text), 3).unwrap();
        let reassembled: String = chunks.iter().map(|c| std::str::from_utf8(&c.payload).unwrap()).collect();
        assert_eq!(reassembled, text);
    }

    #[test]
    fn json_array_buckets_are_contiguous_and_order_preserving() {
        let env = json_array_envelope(10);
        let chunks = split(&env, 4).unwrap();
        let mut reassembled: Vec<String> = Vec::new();
        for chunk in &chunks {
            let value: Value = serde_json::from_slice(&chunk.payload).unwrap();
            for element in value.as_array().unwrap() {
                reassembled.push(element.as_str().unwrap().to_string());
            }
        }
        let expected: Vec<String> = (0..10).map(|i| format!("item-{i}")).collect();
        assert_eq!(reassembled, expected);
    }
}
