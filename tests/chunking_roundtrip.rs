//! End-to-end chunk round trip: an oversized envelope is split against a
//! destination's token budget, then reassembled by the collector (§8
//! scenario 3).

use std::sync::Arc;

use agen_cell::chunking::{compute_budget, split, ChunkCollector};
use agen_cell::domain_types::SafetyMargin;
use agen_cell::envelope::Envelope;
use agen_cell::time_provider::test_time_provider;
use agen_cell::token_counter::{AnthropicCounter, CounterRegistry};
use bytes::Bytes;
use serde_json::Value;

#[tokio::test]
async fn oversized_text_payload_splits_and_reassembles_intact() {
    let registry = CounterRegistry::new();
    registry.register("downstream", Arc::new(AnthropicCounter::new("claude-test", 50_000)));

    let big_text = "word ".repeat(150_000); // ~600k chars, well beyond the 50k-token limit
    let mut original = Envelope::new("bulk-text", "producer", Bytes::from(big_text.clone()));
    original.headers.insert("Content-Type", "text/plain");

    let budget = compute_budget(&original, "downstream", &registry, SafetyMargin::try_from(0.10).unwrap());
    assert!(budget.needs_splitting);

    let chunks = split(&original, budget.suggested_chunks).unwrap();
    assert!(chunks.len() > 1);

    let collector = ChunkCollector::new(test_time_provider(), std::time::Duration::from_secs(60));
    let mut reassembled = None;
    for chunk in chunks {
        let (envelope, complete) = collector.collect(chunk).await;
        if complete {
            reassembled = Some(envelope);
        }
    }

    let reassembled = reassembled.expect("final chunk should complete the group");
    assert_eq!(reassembled.payload.as_ref(), big_text.as_bytes());
}

#[tokio::test]
async fn oversized_json_array_payload_splits_and_reassembles_to_the_same_array() {
    let registry = CounterRegistry::new();
    registry.register("downstream", Arc::new(AnthropicCounter::new("claude-test", 500)));

    let elements: Vec<Value> = (0..2_000).map(|i| Value::from(format!("element-{i}"))).collect();
    let original_array = Value::Array(elements);
    let body = serde_json::to_vec(&original_array).unwrap();
    let mut original = Envelope::new("bulk-array", "producer", Bytes::from(body));
    original.headers.insert("Content-Type", "application/json");

    let budget = compute_budget(&original, "downstream", &registry, SafetyMargin::try_from(0.10).unwrap());
    assert!(budget.needs_splitting);

    let chunks = split(&original, budget.suggested_chunks).unwrap();
    assert!(chunks.len() > 1);

    let collector = ChunkCollector::new(test_time_provider(), std::time::Duration::from_secs(60));
    let mut reassembled = None;
    for chunk in chunks {
        let (envelope, complete) = collector.collect(chunk).await;
        if complete {
            reassembled = Some(envelope);
        }
    }

    let reassembled = reassembled.expect("final chunk should complete the group");
    let reassembled_array: Value = serde_json::from_slice(&reassembled.payload).unwrap();
    assert_eq!(reassembled_array, original_array);
}

#[tokio::test]
async fn chunk_group_is_discarded_after_timeout_elapses() {
    let registry = CounterRegistry::new();
    registry.register("downstream", Arc::new(AnthropicCounter::new("claude-test", 500)));

    let payload = "word ".repeat(5_000);
    let mut original = Envelope::new("bulk-text", "producer", Bytes::from(payload));
    original.headers.insert("Content-Type", "text/plain");
    let budget = compute_budget(&original, "downstream", &registry, SafetyMargin::try_from(0.10).unwrap());
    let mut chunks = split(&original, budget.suggested_chunks.max(3)).unwrap();
    assert!(chunks.len() >= 3);

    let time_provider = Arc::new(agen_cell::time_provider::MockTimeProvider::new());
    let collector = ChunkCollector::new(time_provider.clone(), std::time::Duration::from_millis(100));

    // Deliver all but the last chunk, then let the group age out.
    let last = chunks.pop().unwrap();
    for chunk in chunks {
        let (_, complete) = collector.collect(chunk).await;
        assert!(!complete);
    }

    time_provider.advance(std::time::Duration::from_millis(150));
    collector.sweep().await;

    let (_, complete) = collector.collect(last).await;
    assert!(!complete, "group should have been discarded, so the final chunk starts a fresh incomplete group");
}
