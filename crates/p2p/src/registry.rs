use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::TransportError;
use crate::peer::{Peer, TcpPeer};

/// Live peers keyed by remote address.
///
/// Every mutation path (accept, dial, read-loop exit, shutdown) goes through
/// the one lock, and no lock is held across an `.await`.
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<SocketAddr, Arc<TcpPeer>>,
    closed: bool,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handshaken peer, replacing any live peer at the same address.
    ///
    /// The replaced peer is flagged closed before the lock is released and is
    /// returned so the caller can finish tearing down its connection.
    pub fn insert(&self, peer: Arc<TcpPeer>) -> Result<Option<Arc<TcpPeer>>, TransportError> {
        let mut state = self.inner.write();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let replaced = state.peers.insert(peer.remote_addr(), peer);
        if let Some(old) = &replaced {
            old.signal_close();
        }
        Ok(replaced)
    }

    /// Deregister the connection `id` at `addr`. A newer connection that
    /// replaced it is left alone.
    pub fn remove(&self, addr: SocketAddr, id: u64) -> Option<Arc<TcpPeer>> {
        let mut state = self.inner.write();
        match state.peers.get(&addr) {
            Some(current) if current.id() == id => state.peers.remove(&addr),
            _ => None,
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<TcpPeer>> {
        self.inner.read().peers.get(addr).cloned()
    }

    /// Consistent point-in-time copy of the live peers.
    pub fn snapshot(&self) -> Vec<Arc<TcpPeer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further registrations and hand back everything still live,
    /// already flagged closed.
    pub fn close_all(&self) -> Vec<Arc<TcpPeer>> {
        let mut state = self.inner.write();
        state.closed = true;
        let drained: Vec<_> = state.peers.drain().map(|(_, peer)| peer).collect();
        for peer in &drained {
            peer.signal_close();
        }
        drained
    }
}
