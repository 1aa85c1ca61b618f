//! Pluggable stream transport for peer-to-peer nodes.
//!
//! A [`Transport`] listens for and dials connections, runs a [`Handshake`]
//! once per connection, registers the resulting [`Peer`] and decodes its byte
//! stream into [`Message`]s with a [`Decoder`]. What the messages mean, and
//! where they get routed, is left to the application sitting on top.
//!
//! [`TcpTransport`] is the TCP implementation. Decoded messages arrive on the
//! bounded channel returned by [`TcpTransport::consume`]; per-connection
//! failures go to a separate channel returned by [`TcpTransport::errors`] and
//! never affect other peers.

mod codec;
mod config;
mod error;
mod handshake;
mod message;
mod peer;
mod registry;
mod tcp;
mod transport;

pub use codec::{Decoder, DelimitedCodec, Encoder, LengthPrefixedCodec};
pub use config::{DEFAULT_MAX_FRAME_SIZE, TcpTransportOpts, TransportConfig};
pub use error::{DecodeError, HandshakeError, TransportError};
pub use handshake::{Connection, Handshake, MagicHandshake, NopHandshake, PeerInfo, SharedKeyHandshake};
pub use message::Message;
pub use peer::{Peer, TcpPeer};
pub use registry::PeerRegistry;
pub use tcp::TcpTransport;
pub use transport::Transport;
