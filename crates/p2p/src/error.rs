use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake with {remote} failed: {source}")]
    Handshake {
        remote: SocketAddr,
        #[source]
        source: HandshakeError,
    },
    #[error("decoding from {remote} failed: {source}")]
    Decode {
        remote: SocketAddr,
        #[source]
        source: DecodeError,
    },
    #[error("peer {0} disconnected")]
    PeerDisconnected(SocketAddr),
    #[error("peer {0} is closed")]
    PeerClosed(SocketAddr),
    #[error("inbound queue full, dropped message from {0}")]
    InboundOverflow(SocketAddr),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("transport is already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("transport is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True for errors caused by a local close rather than a remote failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::PeerClosed(_))
    }

    /// Remote address the error relates to, when it is tied to one connection.
    pub fn remote(&self) -> Option<SocketAddr> {
        match self {
            TransportError::Handshake { remote, .. }
            | TransportError::Decode { remote, .. } => Some(*remote),
            TransportError::PeerDisconnected(addr)
            | TransportError::PeerClosed(addr)
            | TransportError::InboundOverflow(addr) => Some(*addr),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error("network magic mismatch: expected {expected:02x?}, got {actual:02x?}")]
    BadMagic { expected: [u8; 4], actual: [u8; 4] },
    #[error("peer failed authentication")]
    AuthenticationFailed,
    #[error("timed out waiting for handshake")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The remote closed the stream between two frames.
    #[error("connection closed")]
    Eof,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    /// The frame was consumed in full but rejected; the stream is still aligned.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl DecodeError {
    /// Recoverable errors leave the stream positioned at the next frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::InvalidFrame(_))
    }
}
