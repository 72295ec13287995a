//! Per-socket connection state (§3 Connection, §4.4.2).

use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::broker::protocol::Response;
use crate::domain_types::{AgentId, ConnectionId};

/// A connection's lifecycle state. Transitions only forward:
/// `Connecting -> Connected -> Closed` (§4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but has not completed the `connect` handshake.
    Connecting,
    /// Handshake complete; `agent_id` is set and immutable.
    Connected,
    /// Socket closed; entry is about to be (or has been) removed from the
    /// connection table.
    Closed,
}

/// Handle to a live (or recently live) agent session on the broker.
///
/// Owns the channel used to push frames to the connection's writer task —
/// unsolicited topic deliveries and RPC responses both flow through it, so a
/// slow or blocked subscriber socket can't stall the broker's fan-out loop
/// (§4.4.4).
pub struct Connection {
    id: ConnectionId,
    agent_id: Option<AgentId>,
    state: ConnectionState,
    last_seen: SystemTime,
    outbox: mpsc::Sender<Response>,
}

impl Connection {
    /// Creates a connection in the `Connecting` state, paired with the
    /// outbox the writer task drains.
    #[must_use]
    pub fn new(id: ConnectionId, outbox: mpsc::Sender<Response>) -> Self {
        Self { id, agent_id: None, state: ConnectionState::Connecting, last_seen: SystemTime::now(), outbox }
    }

    /// This connection's broker-assigned id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The agent identifier set by the `connect` handshake, if completed.
    #[must_use]
    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Completes the handshake, setting the agent identifier once. The
    /// identifier is immutable thereafter (§3 Connection invariants).
    pub fn mark_connected(&mut self, agent_id: AgentId) {
        self.agent_id = Some(agent_id);
        self.state = ConnectionState::Connected;
    }

    /// Marks the connection closed.
    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Updates the last-activity timestamp.
    pub fn touch(&mut self, at: SystemTime) {
        self.last_seen = at;
    }

    /// Last time this connection was observed active.
    #[must_use]
    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    /// Enqueues a frame for delivery on this connection's socket. Returns
    /// `false` if the outbox is closed or full — callers treat a full
    /// outbox as a disconnect candidate for this subscriber only (§4.4.4).
    pub fn try_send(&self, response: Response) -> bool {
        self.outbox.try_send(response).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_connecting() {
        let (tx, _rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::generate(), tx);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.agent_id().is_none());
    }

    #[test]
    fn mark_connected_sets_agent_id_and_state() {
        let (tx, _rx) = mpsc::channel(8);
        let mut conn = Connection::new(ConnectionId::generate(), tx);
        let agent = AgentId::generate();
        conn.mark_connected(agent);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.agent_id(), Some(agent));
    }

    #[tokio::test]
    async fn try_send_delivers_into_the_outbox() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::generate(), tx);
        assert!(conn.try_send(Response::ok("1", serde_json::json!(null))));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "1");
    }
}
