//! Transport trait abstraction for pluggable command links

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Failures reported by a single write
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Link disconnected")]
    Disconnected,

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),
}

/// A half-duplex link that accepts one command payload per write.
///
/// Callers must not start a second write before the previous one resolved.
#[async_trait]
pub trait CommandLink: Send + Sync + 'static {
    /// Write a payload and wait for the peer to acknowledge it
    async fn write(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Tear the link down
    async fn close(&self) -> Result<(), TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// An established link plus its disconnect notification
pub struct Connection {
    pub link: Arc<dyn CommandLink>,
    /// Resolves with a reason once the peer goes away
    pub disconnected: oneshot::Receiver<String>,
    /// Peer description for logging (address or socket)
    pub peer: String,
}

/// Factory for creating command links
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Attempt to connect, returning a link on success
    async fn connect(&self) -> Result<Connection>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
