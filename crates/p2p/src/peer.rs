use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::codec::Encoder;
use crate::error::TransportError;

/// An established, handshake-completed connection to a remote node.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Write raw bytes to the remote. Callers frame with an [`Encoder`].
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);

    fn remote_addr(&self) -> SocketAddr;

    fn is_outbound(&self) -> bool;
}

/// Remote node reached over a TCP stream.
///
/// The transport owns the read half and drives it from the peer's read loop;
/// this handle only carries the write half and the close signal.
pub struct TcpPeer {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outbound: bool,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl TcpPeer {
    pub(crate) fn new(
        id: u64,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        outbound: bool,
        writer: OwnedWriteHalf,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            local_addr,
            remote_addr,
            outbound,
            writer: Mutex::new(writer),
            closed,
        }
    }

    /// Connection id, unique within one transport.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Our end of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Frame `payload` with `encoder` and send it.
    pub async fn send_frame(&self, encoder: &dyn Encoder, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encoder.frame(payload)?;
        self.send(&frame).await
    }

    /// Flag the peer closed without waiting on the writer. Returns false if it
    /// was already closed.
    pub(crate) fn signal_close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Resolves once the peer has been closed locally.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so an error cannot happen here.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[async_trait]
impl Peer for TcpPeer {
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::PeerClosed(self.remote_addr));
        }
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(payload).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        // A local close abandons the write and releases the writer, even when
        // the remote has stopped reading.
        tokio::select! {
            biased;
            _ = self.closed() => Err(TransportError::PeerClosed(self.remote_addr)),
            written = write => written.map_err(TransportError::from),
        }
    }

    async fn close(&self) {
        self.signal_close();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(remote = %self.remote_addr, error = ?err, "shutdown of closed peer failed");
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }
}

impl std::fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeer")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}
