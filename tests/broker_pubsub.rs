//! End-to-end pub/sub: two subscribers on one topic, no self-echo to the
//! publisher (§8 scenario 1).

use agen_cell::broker::server::Broker;
use agen_cell::client::Client;
use agen_cell::domain_types::{ChannelCapacity, MaxFrameBytes};
use agen_cell::envelope::{Envelope, Message};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn spawn_broker() -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let broker = Broker::new(ChannelCapacity::default(), MaxFrameBytes::default());
    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = broker.serve(listener, serve_shutdown).await;
    });
    (addr, shutdown)
}

#[tokio::test]
async fn two_subscribers_both_receive_one_publish() {
    let (addr, _shutdown) = spawn_broker().await;

    let publisher = Client::connect(&addr, "publisher", MaxFrameBytes::default()).await.unwrap();
    let subscriber_a = Client::connect(&addr, "consumer-a", MaxFrameBytes::default()).await.unwrap();
    let subscriber_b = Client::connect(&addr, "consumer-b", MaxFrameBytes::default()).await.unwrap();

    let mut rx_a = subscriber_a.subscribe("documents").await.unwrap();
    let mut rx_b = subscriber_b.subscribe("documents").await.unwrap();

    let envelope = Envelope::new("doc-created", "publisher", Bytes::from_static(b"{\"id\":1}"));
    publisher.publish("documents", envelope).await.unwrap();

    let received_a = tokio::time::timeout(std::time::Duration::from_secs(2), rx_a.recv()).await.unwrap().unwrap();
    let received_b = tokio::time::timeout(std::time::Duration::from_secs(2), rx_b.recv()).await.unwrap().unwrap();

    assert_eq!(received_a.message_type, "doc-created");
    assert_eq!(received_b.payload, Bytes::from_static(b"{\"id\":1}"));
}

#[tokio::test]
async fn publisher_does_not_receive_its_own_publish() {
    let (addr, _shutdown) = spawn_broker().await;

    let publisher = Client::connect(&addr, "publisher", MaxFrameBytes::default()).await.unwrap();
    let mut own_sub = publisher.subscribe("documents").await.unwrap();

    let envelope = Envelope::new("doc-created", "publisher", Bytes::from_static(b"hi"));
    publisher.publish("documents", envelope).await.unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_millis(200), own_sub.recv()).await;
    assert!(result.is_err(), "publisher should not observe its own publish");
}

#[tokio::test]
async fn lightweight_message_is_routed_through_the_same_topic_as_an_envelope() {
    let (addr, _shutdown) = spawn_broker().await;

    let publisher = Client::connect(&addr, "publisher", MaxFrameBytes::default()).await.unwrap();
    let subscriber = Client::connect(&addr, "consumer", MaxFrameBytes::default()).await.unwrap();
    let mut rx = subscriber.subscribe("notices").await.unwrap();

    let message = Message::new("notice", "notices", serde_json::json!({"level": "info"}));
    publisher.publish_message("notices", &message).await.unwrap();

    let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&received.payload).unwrap();
    assert_eq!(payload["type"], "notice");
    assert_eq!(payload["payload"]["level"], "info");
}
