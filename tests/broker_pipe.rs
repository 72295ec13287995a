//! End-to-end pipe semantics: strict FIFO delivery and overflow reporting
//! (§8 scenario 2).

use agen_cell::broker::server::Broker;
use agen_cell::client::{Client, ClientError};
use agen_cell::domain_types::{ChannelCapacity, MaxFrameBytes};
use agen_cell::envelope::Envelope;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn spawn_broker(capacity: ChannelCapacity) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let broker = Broker::new(capacity, MaxFrameBytes::default());
    let shutdown = CancellationToken::new();
    tokio::spawn(async move {
        let _ = broker.serve(listener, shutdown).await;
    });
    addr
}

#[tokio::test]
async fn pipe_delivers_in_fifo_order() {
    let addr = spawn_broker(ChannelCapacity::default()).await;
    let producer = Client::connect(&addr, "producer", MaxFrameBytes::default()).await.unwrap();
    let consumer = Client::connect(&addr, "consumer", MaxFrameBytes::default()).await.unwrap();

    for i in 0u8..5 {
        producer.send_pipe("results", Envelope::new("item", "producer", Bytes::copy_from_slice(&[i]))).await.unwrap();
    }

    for i in 0u8..5 {
        let envelope = consumer.receive_pipe("results", std::time::Duration::from_secs(1)).await.unwrap();
        assert_eq!(envelope.payload.as_ref(), &[i]);
    }
}

#[tokio::test]
async fn pipe_overflow_is_reported_to_the_sender() {
    let addr = spawn_broker(ChannelCapacity::try_from(1).unwrap()).await;
    let producer = Client::connect(&addr, "producer", MaxFrameBytes::default()).await.unwrap();

    producer.send_pipe("tight", Envelope::new("item", "producer", Bytes::from_static(b"a"))).await.unwrap();
    let err = producer.send_pipe("tight", Envelope::new("item", "producer", Bytes::from_static(b"b"))).await.unwrap_err();

    assert!(matches!(err, ClientError::Rejected { .. }));
}

#[tokio::test]
async fn receive_times_out_when_pipe_is_empty() {
    let addr = spawn_broker(ChannelCapacity::default()).await;
    let consumer = Client::connect(&addr, "consumer", MaxFrameBytes::default()).await.unwrap();

    let err = consumer.receive_pipe("nothing-here", std::time::Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { .. }));
}
