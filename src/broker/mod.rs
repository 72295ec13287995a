//! The broker service: topics, pipes, connections and the wire protocol
//! that ties them together (§4.4).

pub mod connection;
pub mod pipe;
pub mod protocol;
pub mod server;
pub mod topic;

pub use protocol::{Request, Response, RpcErrorCode};
pub use server::{Broker, BrokerError};
