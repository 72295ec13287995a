//! TCP accept loop and per-connection request dispatch (§4.4).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::broker::connection::{Connection, ConnectionState};
use crate::broker::pipe::{PipeError, PipeRegistry};
use crate::broker::protocol::{Request, Response, RpcErrorCode};
use crate::broker::topic::TopicRegistry;
use crate::domain_types::{AgentId, ChannelCapacity, ConnectionId, MaxFrameBytes, PipeName, TopicName};
use crate::envelope::Envelope;

/// Default timeout `receive_pipe` waits before giving up (§5).
pub const DEFAULT_RECEIVE_PIPE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Errors raised while running the broker listener itself (not
/// request-level errors, which are reported over the wire as
/// [`crate::broker::protocol::RpcError`]).
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Binding or accepting on the configured address failed.
    #[error("broker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared broker state, cheaply cloneable, handed to every connection task.
#[derive(Clone)]
pub struct Broker {
    topics: TopicRegistry,
    pipes: PipeRegistry,
    connections: Arc<DashMap<ConnectionId, Connection>>,
    max_frame_bytes: MaxFrameBytes,
}

impl Broker {
    /// Creates a broker with fresh topic/pipe registries.
    #[must_use]
    pub fn new(channel_capacity: ChannelCapacity, max_frame_bytes: MaxFrameBytes) -> Self {
        Self {
            topics: TopicRegistry::new(channel_capacity),
            pipes: PipeRegistry::new(channel_capacity),
            connections: Arc::new(DashMap::new()),
            max_frame_bytes,
        }
    }

    /// Accepts connections on `listener` until `shutdown` is cancelled.
    /// Existing connections close on their next I/O attempt once shutdown
    /// fires (§4.4.3); buffered pipe messages are discarded along with the
    /// registries when the broker process exits.
    ///
    /// # Errors
    /// Returns [`BrokerError::Io`] if accepting fails in a way that isn't
    /// recoverable per-connection (the listener socket itself is broken).
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), BrokerError> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("broker accept loop shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let broker = self.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tracing::info!(%peer, "connection accepted");
                        broker.handle_connection(socket, conn_shutdown).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, shutdown: CancellationToken) {
        let connection_id = ConnectionId::generate();
        let codec = LinesCodec::new_with_max_length(self.max_frame_bytes.as_usize());
        let mut framed = Framed::new(socket, codec);

        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Response>(128);
        self.connections.insert(connection_id, Connection::new(connection_id, outbox_tx));

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                outgoing = outbox_rx.recv() => {
                    let Some(response) = outgoing else { break };
                    let Ok(text) = serde_json::to_string(&response) else { continue };
                    if framed.send(text).await.is_err() {
                        break;
                    }
                }
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(line)) => {
                            if let Some(response) = self.dispatch(connection_id, &line).await {
                                if framed.send(serde_json::to_string(&response).unwrap_or_default()).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(%err, "decode error, closing connection");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some((_, mut conn)) = self.connections.remove(&connection_id) {
            conn.mark_closed();
        }
        self.topics.unsubscribe_everywhere(connection_id);
        tracing::info!(connection_id = %connection_id, "connection closed");
    }

    #[tracing::instrument(skip(self, line), fields(connection_id = %connection_id))]
    async fn dispatch(&self, connection_id: ConnectionId, line: &str) -> Option<Response> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                return Some(Response::err("", RpcErrorCode::InvalidParams, format!("malformed request: {err}")));
            }
        };

        let connected = self
            .connections
            .get(&connection_id)
            .is_some_and(|conn| conn.state() == ConnectionState::Connected);

        if request.method != "connect" && !connected {
            return Some(Response::err(
                request.id,
                RpcErrorCode::InvalidParams,
                "connection has not completed the connect handshake",
            ));
        }

        let response = match request.method.as_str() {
            "connect" => self.handle_connect(connection_id, &request).await,
            "publish" => self.handle_publish(connection_id, &request, false).await,
            "publish_envelope" => self.handle_publish(connection_id, &request, true).await,
            "subscribe" => self.handle_subscribe(connection_id, &request).await,
            "send_pipe" => self.handle_send_pipe(&request, false),
            "send_pipe_envelope" => self.handle_send_pipe(&request, true),
            "receive_pipe" => self.handle_receive_pipe(&request).await,
            other => Response::err(request.id.clone(), RpcErrorCode::MethodNotFound, format!("unknown method: {other}")),
        };
        Some(response)
    }

    async fn handle_connect(&self, connection_id: ConnectionId, request: &Request) -> Response {
        let Some(agent_id) = request.params.get("agent_id").and_then(|v| v.as_str()) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "missing agent_id");
        };
        let agent_id = AgentId::from_name(agent_id);
        if let Some(mut conn) = self.connections.get_mut(&connection_id) {
            conn.mark_connected(agent_id);
        }
        Response::ok(request.id.clone(), json!({ "status": "connected" }))
    }

    async fn handle_publish(&self, connection_id: ConnectionId, request: &Request, as_envelope: bool) -> Response {
        let Some(topic) = request.params.get("topic").and_then(|v| v.as_str()) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "missing topic");
        };
        let Ok(topic) = TopicName::try_from(topic) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "invalid topic name");
        };

        let envelope = if as_envelope {
            request.params.get("envelope").and_then(|v| serde_json::from_value::<Envelope>(v.clone()).ok())
        } else {
            request.params.get("message").map(|message| {
                Envelope::new(
                    "message",
                    "",
                    bytes::Bytes::from(serde_json::to_vec(message).unwrap_or_default()),
                )
            })
        };
        let Some(envelope) = envelope else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "missing or invalid payload");
        };

        let delivered = self.topics.publish(&topic, envelope, connection_id, &self.connections).await;
        Response::ok(request.id.clone(), json!({ "delivered": delivered }))
    }

    async fn handle_subscribe(&self, connection_id: ConnectionId, request: &Request) -> Response {
        let Some(topic) = request.params.get("topic").and_then(|v| v.as_str()) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "missing topic");
        };
        let Ok(topic) = TopicName::try_from(topic) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "invalid topic name");
        };
        self.topics.subscribe(&topic, connection_id).await;
        Response::ok(request.id.clone(), json!({ "subscribed": topic.to_string() }))
    }

    fn handle_send_pipe(&self, request: &Request, as_envelope: bool) -> Response {
        let Some(pipe) = request.params.get("pipe").and_then(|v| v.as_str()) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "missing pipe");
        };
        let Ok(pipe) = PipeName::try_from(pipe) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "invalid pipe name");
        };

        let envelope = if as_envelope {
            request.params.get("envelope").and_then(|v| serde_json::from_value::<Envelope>(v.clone()).ok())
        } else {
            request.params.get("message").map(|message| {
                Envelope::new("message", "", bytes::Bytes::from(serde_json::to_vec(message).unwrap_or_default()))
            })
        };
        let Some(envelope) = envelope else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "missing or invalid payload");
        };

        match self.pipes.send(&pipe, envelope) {
            Ok(()) => Response::ok(request.id.clone(), json!({ "status": "sent" })),
            Err(PipeError::BufferFull) => {
                Response::err(request.id.clone(), RpcErrorCode::Internal, "Pipe buffer full")
            }
            Err(other) => Response::err(request.id.clone(), RpcErrorCode::Internal, other.to_string()),
        }
    }

    async fn handle_receive_pipe(&self, request: &Request) -> Response {
        let Some(pipe) = request.params.get("pipe").and_then(|v| v.as_str()) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "missing pipe");
        };
        let Ok(pipe) = PipeName::try_from(pipe) else {
            return Response::err(request.id.clone(), RpcErrorCode::InvalidParams, "invalid pipe name");
        };
        let timeout_ms = request.params.get("timeout_ms").and_then(serde_json::Value::as_u64);
        let timeout = timeout_ms.map_or(DEFAULT_RECEIVE_PIPE_TIMEOUT, Duration::from_millis);

        match self.pipes.receive(&pipe, timeout).await {
            Ok(envelope) => Response::ok(request.id.clone(), json!({ "envelope": envelope })),
            Err(PipeError::Timeout) => {
                Response::err(request.id.clone(), RpcErrorCode::Internal, "Timeout waiting for message")
            }
            Err(other) => Response::err(request.id.clone(), RpcErrorCode::Internal, other.to_string()),
        }
    }
}
