//! Benchmarks broker publish fan-out throughput for a topic with several
//! subscribers (§4.4, §5 ordering guarantees).

use agen_cell::broker::connection::Connection;
use agen_cell::broker::topic::TopicRegistry;
use agen_cell::domain_types::{ChannelCapacity, ConnectionId, TopicName};
use agen_cell::envelope::Envelope;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dashmap::DashMap;

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("topic_publish_fan_out");

    for subscriber_count in [1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(subscriber_count), &subscriber_count, |b, &subscriber_count| {
            b.to_async(&rt).iter(|| async {
                let registry = TopicRegistry::new(ChannelCapacity::try_from(1000).unwrap());
                let topic = TopicName::try_from("bench-topic").unwrap();
                let connections: DashMap<ConnectionId, Connection> = DashMap::new();
                let mut receivers = Vec::with_capacity(subscriber_count);

                for _ in 0..subscriber_count {
                    let id = ConnectionId::generate();
                    let (tx, rx) = tokio::sync::mpsc::channel(subscriber_count.max(1));
                    connections.insert(id, Connection::new(id, tx));
                    registry.subscribe(&topic, id).await;
                    receivers.push(rx);
                }

                let publisher = ConnectionId::generate();
                let envelope = Envelope::new("bench", "publisher", bytes::Bytes::from_static(b"payload"));
                registry.publish(&topic, envelope, publisher, &connections).await;

                for rx in &mut receivers {
                    let _ = rx.recv().await;
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fan_out);
criterion_main!(benches);
