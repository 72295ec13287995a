//! Broker client: a single TCP connection per agent, with a pending-request
//! table and per-topic subscription channels (§4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::protocol::{Request, Response};
use crate::domain_types::MaxFrameBytes;
use crate::envelope::Envelope;

/// Errors raised by the broker client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The TCP connection or handshake failed.
    #[error("failed to connect to broker: {0}")]
    ConnectFailed(String),

    /// The broker rejected the request (propagated `{code, message}`).
    #[error("broker error {code}: {message}")]
    Rejected {
        /// JSON-RPC error code from the response.
        code: i64,
        /// Human-readable message from the response.
        message: String,
    },

    /// `receive_pipe` (or any pending request) ran past its timeout.
    #[error("timed out waiting for broker response")]
    Timeout,

    /// The reader task (and so the connection) has gone away.
    #[error("connection closed")]
    Closed,

    /// The broker's response body didn't decode into the expected shape.
    #[error("malformed broker response: {0}")]
    Malformed(String),
}

type PendingTable = Arc<DashMap<String, oneshot::Sender<Response>>>;
type SubscriptionTable = Arc<Mutex<HashMap<String, mpsc::Sender<Envelope>>>>;

/// A connected broker client. Cloning shares the underlying connection: the
/// writer half and pending/subscription tables are reference-counted.
#[derive(Clone)]
pub struct Client {
    outbound: mpsc::Sender<String>,
    pending: PendingTable,
    subscriptions: SubscriptionTable,
    shutdown: CancellationToken,
}

impl Client {
    /// Connects to the broker at `addr` and performs the `connect`
    /// handshake as `agent_id`.
    ///
    /// # Errors
    /// Returns [`ClientError::ConnectFailed`] on any transport or handshake
    /// failure.
    pub async fn connect(addr: &str, agent_id: &str, max_frame_bytes: MaxFrameBytes) -> Result<Self, ClientError> {
        let socket = TcpStream::connect(addr).await.map_err(|err| ClientError::ConnectFailed(err.to_string()))?;
        let codec = LinesCodec::new_with_max_length(max_frame_bytes.as_usize());
        let framed = Framed::new(socket, codec);
        let (mut sink, mut stream) = framed.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(128);
        let pending: PendingTable = Arc::new(DashMap::new());
        let subscriptions: SubscriptionTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_shutdown.cancelled() => break,
                    line = outbound_rx.recv() => {
                        let Some(line) = line else { break };
                        if sink.send(line).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Drain whatever sink we were handed (closes the write half).
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader_subscriptions = Arc::clone(&subscriptions);
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_shutdown.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(line)) => dispatch_incoming(&line, &reader_pending, &reader_subscriptions).await,
                            _ => break,
                        }
                    }
                }
            }
            fail_pending_requests(&reader_pending);
        });

        let client = Self { outbound: outbound_tx, pending, subscriptions, shutdown };
        client.call("connect", json!({ "agent_id": agent_id })).await?;
        Ok(client)
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, ClientError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = Request { id: id.clone(), method: method.to_string(), params };
        let line = serde_json::to_string(&request).map_err(|err| ClientError::Malformed(err.to_string()))?;
        self.outbound.send(line).await.map_err(|_| ClientError::Closed)?;

        match tokio::time::timeout(Duration::from_secs(30), rx).await {
            Ok(Ok(response)) => match response.error {
                Some(err) => Err(ClientError::Rejected { code: err.code, message: err.message }),
                None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
            },
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Subscribes to `topic`, returning a receiver of envelopes delivered
    /// to it. The channel closes when the connection is torn down.
    ///
    /// # Errors
    /// Propagates the broker's rejection if the subscribe call fails.
    pub async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>, ClientError> {
        self.call("subscribe", json!({ "topic": topic })).await?;
        let (tx, rx) = mpsc::channel(128);
        self.subscriptions.lock().await.insert(topic.to_string(), tx);
        Ok(rx)
    }

    /// Publishes `envelope` to `topic`. Resolves once the broker
    /// acknowledges the publish.
    ///
    /// # Errors
    /// Propagates the broker's rejection or a transport failure.
    pub async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), ClientError> {
        self.call("publish_envelope", json!({ "topic": topic, "envelope": envelope })).await?;
        Ok(())
    }

    /// Sends `envelope` on `pipe`. Resolves once the broker acknowledges
    /// receipt into the pipe's buffer.
    ///
    /// # Errors
    /// Propagates [`ClientError::Rejected`] with the broker's `BufferFull`
    /// message on overflow.
    pub async fn send_pipe(&self, pipe: &str, envelope: Envelope) -> Result<(), ClientError> {
        self.call("send_pipe_envelope", json!({ "pipe": pipe, "envelope": envelope })).await?;
        Ok(())
    }

    /// Publishes a lightweight [`crate::envelope::Message`] to `topic`,
    /// routed through the same `publish` method an [`Envelope`] uses, but
    /// without hop tracking (§3: the two shapes are "routed identically").
    ///
    /// # Errors
    /// Propagates the broker's rejection or a transport failure.
    pub async fn publish_message(&self, topic: &str, message: &crate::envelope::Message) -> Result<(), ClientError> {
        self.call("publish", json!({ "topic": topic, "message": message })).await?;
        Ok(())
    }

    /// Sends a lightweight [`crate::envelope::Message`] on `pipe`, routed
    /// through the same `send_pipe` method an [`Envelope`] uses (§3).
    ///
    /// # Errors
    /// Propagates [`ClientError::Rejected`] with the broker's `BufferFull`
    /// message on overflow.
    pub async fn send_pipe_message(&self, pipe: &str, message: &crate::envelope::Message) -> Result<(), ClientError> {
        self.call("send_pipe", json!({ "pipe": pipe, "message": message })).await?;
        Ok(())
    }

    /// Waits up to `timeout` for the next envelope on `pipe`.
    ///
    /// # Errors
    /// Returns [`ClientError::Rejected`] carrying the broker's timeout
    /// message if nothing arrives in time.
    pub async fn receive_pipe(&self, pipe: &str, timeout: Duration) -> Result<Envelope, ClientError> {
        let result = self
            .call("receive_pipe", json!({ "pipe": pipe, "timeout_ms": timeout.as_millis() as u64 }))
            .await?;
        result
            .get("envelope")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| ClientError::Malformed("receive_pipe response missing envelope".to_string()))
    }

    /// Cooperatively shuts down: cancels the reader and writer tasks,
    /// which close the underlying socket, and drops every subscription
    /// channel so receivers observe a closed stream (§4.5).
    pub async fn close(&self) {
        self.subscriptions.lock().await.clear();
        self.shutdown.cancel();
        fail_pending_requests(&self.pending);
    }
}

/// Fails every still-outstanding request with [`ClientError::Closed`] by
/// dropping its `oneshot` sender side effect-free — the waiting `call`
/// observes a closed channel and maps it to `Closed` itself.
fn fail_pending_requests(pending: &PendingTable) {
    pending.clear();
}

async fn dispatch_incoming(line: &str, pending: &PendingTable, subscriptions: &SubscriptionTable) {
    let Ok(response) = serde_json::from_str::<Response>(line) else {
        tracing::warn!("discarding malformed broker frame");
        return;
    };

    if let Some((_, sender)) = pending.remove(&response.id) {
        let _ = sender.send(response);
        return;
    }

    if let Some(result) = &response.result {
        if let Some(topic) = result.get("topic").and_then(|v| v.as_str()) {
            if let Some(envelope) = result.get("envelope").and_then(|v| serde_json::from_value::<Envelope>(v.clone()).ok()) {
                let subs = subscriptions.lock().await;
                if let Some(sender) = subs.get(topic) {
                    let _ = sender.send(envelope).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_error_carries_broker_code_and_message() {
        let err = ClientError::Rejected { code: -32603, message: "Pipe buffer full".to_string() };
        assert!(err.to_string().contains("Pipe buffer full"));
    }
}
