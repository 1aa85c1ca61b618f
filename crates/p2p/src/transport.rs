use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::Message;
use crate::peer::Peer;

/// Anything that moves bytes between nodes: TCP, Unix sockets, an in-memory
/// test harness. The application layer only ever talks to this contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind the configured address and start accepting in the background.
    /// Returns the address actually bound.
    async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError>;

    /// Connect to `addr` and complete the handshake. The returned peer is
    /// already registered and its read loop is running.
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Peer>, TransportError>;

    /// Take the inbound message stream. Only the first call gets it.
    fn consume(&self) -> Option<mpsc::Receiver<Message>>;

    /// Take the stream of non-fatal operational errors. Only the first call
    /// gets it.
    fn errors(&self) -> Option<mpsc::Receiver<TransportError>>;

    /// Registered peers at this instant.
    fn peers(&self) -> Vec<Arc<dyn Peer>>;

    /// Stop accepting and close every peer. Safe to call repeatedly and
    /// concurrently.
    async fn close(&self);
}
