use async_trait::async_trait;
use thiserror::Error;

use fedlink_core::task::{Fab, Run};

use crate::codec::Message;
use crate::retry::RetryInvoker;

/// Failures surfaced by a connection after its retries are exhausted.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("rpc failure: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("transport failure: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("http failure: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode failure: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("no node registered on this connection")]
    NoNode,
    #[error("{0}")]
    Protocol(String),
}

/// Capability set every transport variant provides.
///
/// One logical node id per connection instance: `create_node` writes
/// the cell, `receive`/`send`/`delete_node` reuse it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Register with the fleet and remember the assigned node id.
    async fn create_node(&self) -> Result<u64, ConnectionError>;

    /// Deregister the remembered node.
    async fn delete_node(&self) -> Result<(), ConnectionError>;

    /// Pull the next instruction; `None` when nothing is waiting.
    async fn receive(&self) -> Result<Option<Message>, ConnectionError>;

    /// Push a reply; fails when the link server refuses it.
    async fn send(&self, message: Message) -> Result<(), ConnectionError>;

    async fn get_run(&self, run_id: u64) -> Result<Run, ConnectionError>;

    async fn get_fab(&self, fab_hash: &str) -> Result<Fab, ConnectionError>;
}

/// Transport variants a SuperNode can ride.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    GrpcRere,
    GrpcAdapter,
    Rest,
}

/// Open a connection over the chosen transport.
pub async fn connect(
    transport: Transport,
    address: &str,
    retry: RetryInvoker,
) -> Result<Box<dyn Connection>, ConnectionError> {
    Ok(match transport {
        Transport::GrpcRere => Box::new(
            crate::grpc_rere::GrpcRereConnection::connect(address, retry).await?,
        ),
        Transport::GrpcAdapter => Box::new(
            crate::grpc_adapter::GrpcAdapterConnection::connect(address, retry).await?,
        ),
        Transport::Rest => Box::new(crate::rest::RestConnection::new(address, retry)?),
    })
}

/// The node-id cell shared by all transport variants.
#[derive(Default)]
pub(crate) struct NodeCell(std::sync::Mutex<Option<u64>>);

impl NodeCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, node_id: u64) {
        *self.0.lock().unwrap() = Some(node_id);
    }

    pub fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }

    pub fn get(&self) -> Result<u64, ConnectionError> {
        self.0.lock().unwrap().ok_or(ConnectionError::NoNode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_cell_lifecycle() {
        let cell = NodeCell::new();
        assert!(matches!(cell.get(), Err(ConnectionError::NoNode)));
        cell.set(42);
        assert_eq!(cell.get().unwrap(), 42);
        cell.clear();
        assert!(matches!(cell.get(), Err(ConnectionError::NoNode)));
    }
}
