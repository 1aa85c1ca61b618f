use std::net::SocketAddr;

use bytes::Bytes;

/// A decoded frame together with the address of the peer it arrived from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub from: SocketAddr,
    pub payload: Bytes,
}

impl Message {
    pub fn new(from: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            from,
            payload: payload.into(),
        }
    }
}
