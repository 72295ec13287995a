//! Benchmarks the token-budget computation and envelope splitting on the
//! chunking engine's hot path (§4.3).

use agen_cell::chunking::{compute_budget, split};
use agen_cell::domain_types::SafetyMargin;
use agen_cell::envelope::Envelope;
use agen_cell::token_counter::{CounterRegistry, HeuristicCounter};
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn payload_of(tokens: usize) -> Bytes {
    Bytes::from("word ".repeat(tokens))
}

fn bench_budget(c: &mut Criterion) {
    let registry = CounterRegistry::new();
    registry.register("agent-b", Arc::new(HeuristicCounter::new(4_000)));
    let margin = SafetyMargin::try_from(0.10).unwrap();

    let mut group = c.benchmark_group("compute_budget");
    for tokens in [100, 10_000, 600_000] {
        let envelope = Envelope::new("bench", "agent-a", payload_of(tokens));
        group.bench_with_input(BenchmarkId::from_parameter(tokens), &envelope, |b, envelope| {
            b.iter(|| compute_budget(envelope, "agent-b", &registry, margin));
        });
    }
    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    for tokens in [10_000, 600_000] {
        let mut envelope = Envelope::new("bench", "agent-a", payload_of(tokens));
        envelope.headers.insert("Content-Type", "text/plain");
        group.bench_with_input(BenchmarkId::from_parameter(tokens), &envelope, |b, envelope| {
            b.iter(|| split(envelope, 8).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_budget, bench_split);
criterion_main!(benches);
