//! Point-to-point pipes: bounded, strictly FIFO, single consumer at a time
//! (§3 Pipe, §4.4.1, §8).

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::domain_types::{ChannelCapacity, PipeName};
use crate::envelope::Envelope;

/// Errors specific to pipe send/receive.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The pipe's bounded channel is at capacity (§4.4.3).
    #[error("pipe buffer full")]
    BufferFull,

    /// `receive_pipe` waited the full timeout with nothing delivered
    /// (§4.4.3).
    #[error("timeout waiting for message")]
    Timeout,

    /// A second receiver tried to read while another was already waiting
    /// (§4.4.2: at most one consumer blocks at a time).
    #[error("another consumer is already receiving on this pipe")]
    ConsumerBusy,
}

struct Pipe {
    sender: mpsc::Sender<Envelope>,
    receiver: Mutex<mpsc::Receiver<Envelope>>,
    receiving: Mutex<()>,
}

/// Registry of all pipes the broker has lazily created (§3 Pipe Lifecycle).
#[derive(Clone)]
pub struct PipeRegistry {
    pipes: Arc<DashMap<PipeName, Arc<Pipe>>>,
    capacity: ChannelCapacity,
}

impl PipeRegistry {
    /// Creates an empty registry whose pipes all share `capacity`.
    #[must_use]
    pub fn new(capacity: ChannelCapacity) -> Self {
        Self { pipes: Arc::new(DashMap::new()), capacity }
    }

    fn pipe_handle(&self, name: &PipeName) -> Arc<Pipe> {
        Arc::clone(self.pipes.entry(name.clone()).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(self.capacity.as_usize());
            Arc::new(Pipe { sender, receiver: Mutex::new(receiver), receiving: Mutex::new(()) })
        }).value())
    }

    /// Sends `envelope` on `pipe`, non-blocking. Overflow returns
    /// [`PipeError::BufferFull`] to the caller, who decides whether to
    /// retry or drop (§4.4.3).
    ///
    /// # Errors
    /// Returns [`PipeError::BufferFull`] if the pipe's bounded channel has
    /// no free capacity.
    pub fn send(&self, pipe: &PipeName, envelope: Envelope) -> Result<(), PipeError> {
        let handle = self.pipe_handle(pipe);
        handle.sender.try_send(envelope).map_err(|_| PipeError::BufferFull)
    }

    /// Waits up to `timeout` for the next envelope on `pipe`, in FIFO
    /// order. Only one caller may be receiving on a given pipe at a time
    /// (§4.4.2); a concurrent caller gets [`PipeError::ConsumerBusy`]
    /// immediately rather than queueing behind the first.
    ///
    /// # Errors
    /// Returns [`PipeError::Timeout`] if nothing arrives in time, or
    /// [`PipeError::ConsumerBusy`] if another receive is already in flight.
    pub async fn receive(
        &self,
        pipe: &PipeName,
        timeout: std::time::Duration,
    ) -> Result<Envelope, PipeError> {
        let handle = self.pipe_handle(pipe);
        let Ok(_guard) = handle.receiving.try_lock() else {
            return Err(PipeError::ConsumerBusy);
        };
        let mut receiver = handle.receiver.lock().await;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => Err(PipeError::Timeout),
            Err(_) => Err(PipeError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn pipe_name(s: &str) -> PipeName {
        PipeName::try_from(s).unwrap()
    }

    #[tokio::test]
    async fn send_then_receive_is_fifo() {
        let registry = PipeRegistry::new(ChannelCapacity::try_from(100).unwrap());
        let name = pipe_name("q");
        for i in 0..5u8 {
            registry.send(&name, Envelope::new("m", "p", Bytes::copy_from_slice(&[i]))).unwrap();
        }
        for i in 0..5u8 {
            let env = registry.receive(&name, Duration::from_millis(50)).await.unwrap();
            assert_eq!(env.payload.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn overflow_returns_buffer_full() {
        let registry = PipeRegistry::new(ChannelCapacity::try_from(1).unwrap());
        let name = pipe_name("q");
        registry.send(&name, Envelope::new("m", "p", Bytes::from_static(b"a"))).unwrap();
        let err = registry.send(&name, Envelope::new("m", "p", Bytes::from_static(b"b"))).unwrap_err();
        assert!(matches!(err, PipeError::BufferFull));
    }

    #[tokio::test]
    async fn receive_times_out_when_empty() {
        let registry = PipeRegistry::new(ChannelCapacity::try_from(10).unwrap());
        let name = pipe_name("q");
        let err = registry.receive(&name, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PipeError::Timeout));
    }

    #[tokio::test]
    async fn after_overflow_one_receive_frees_capacity_for_next_send() {
        let registry = PipeRegistry::new(ChannelCapacity::try_from(1).unwrap());
        let name = pipe_name("q");
        registry.send(&name, Envelope::new("m", "p", Bytes::from_static(b"a"))).unwrap();
        assert!(registry.send(&name, Envelope::new("m", "p", Bytes::from_static(b"b"))).is_err());
        registry.receive(&name, Duration::from_millis(50)).await.unwrap();
        assert!(registry.send(&name, Envelope::new("m", "p", Bytes::from_static(b"c"))).is_ok());
    }
}
