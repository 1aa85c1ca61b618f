use std::net::SocketAddr;

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;

const NONCE_LEN: usize = 32;
const TAG_LEN: usize = 32;
const AUTH_ACK: u8 = 0x01;

/// A raw, not yet trusted byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// What a handshake knows about the connection it is negotiating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
    /// True when this side dialed the connection.
    pub outbound: bool,
}

/// Negotiation run once per connection before the peer is registered.
///
/// The handshake has exclusive use of the connection; no read loop is
/// running yet. Returning an error drops the connection.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(&self, conn: &mut dyn Connection, peer: &PeerInfo) -> Result<(), HandshakeError>;
}

/// Accepts every connection without exchanging any bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _conn: &mut dyn Connection, _peer: &PeerInfo) -> Result<(), HandshakeError> {
        Ok(())
    }
}

/// Both sides must speak the same 4-byte network magic.
///
/// The dialer writes the magic and waits for the acceptor to echo it back.
#[derive(Clone, Copy, Debug)]
pub struct MagicHandshake {
    magic: [u8; 4],
}

impl MagicHandshake {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }

    async fn expect_magic(&self, conn: &mut dyn Connection) -> Result<(), HandshakeError> {
        let mut actual = [0u8; 4];
        conn.read_exact(&mut actual).await?;
        if actual != self.magic {
            return Err(HandshakeError::BadMagic {
                expected: self.magic,
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Handshake for MagicHandshake {
    async fn handshake(&self, conn: &mut dyn Connection, peer: &PeerInfo) -> Result<(), HandshakeError> {
        if peer.outbound {
            conn.write_all(&self.magic).await?;
            conn.flush().await?;
            self.expect_magic(conn).await
        } else {
            self.expect_magic(conn).await?;
            conn.write_all(&self.magic).await?;
            conn.flush().await?;
            Ok(())
        }
    }
}

/// Mutual challenge/response over a pre-shared 32-byte key.
///
/// Each side proves knowledge of the key by tagging the other side's random
/// nonce with `blake3::keyed_hash`, bound to its own role so a tag can never
/// be reflected back.
#[derive(Clone)]
pub struct SharedKeyHandshake {
    key: [u8; 32],
}

impl SharedKeyHandshake {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the key from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(blake3::derive_key("p2p shared-key handshake v1", passphrase.as_bytes()))
    }

    fn tag(&self, outbound: bool, nonce: &[u8; NONCE_LEN]) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(if outbound { b"outbound" } else { b"inbound" });
        hasher.update(nonce);
        hasher.finalize()
    }

    fn verify(&self, outbound: bool, nonce: &[u8; NONCE_LEN], tag: [u8; TAG_LEN]) -> Result<(), HandshakeError> {
        // Hash equality is constant time.
        if self.tag(outbound, nonce) == blake3::Hash::from(tag) {
            Ok(())
        } else {
            Err(HandshakeError::AuthenticationFailed)
        }
    }
}

impl std::fmt::Debug for SharedKeyHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyHandshake").finish_non_exhaustive()
    }
}

#[async_trait]
impl Handshake for SharedKeyHandshake {
    async fn handshake(&self, conn: &mut dyn Connection, peer: &PeerInfo) -> Result<(), HandshakeError> {
        let mut local_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut local_nonce);

        if peer.outbound {
            conn.write_all(&local_nonce).await?;
            conn.flush().await?;

            let mut remote_nonce = [0u8; NONCE_LEN];
            let mut remote_tag = [0u8; TAG_LEN];
            conn.read_exact(&mut remote_nonce).await?;
            conn.read_exact(&mut remote_tag).await?;
            self.verify(false, &local_nonce, remote_tag)?;

            conn.write_all(self.tag(true, &remote_nonce).as_bytes()).await?;
            conn.flush().await?;
            let ack = conn.read_u8().await?;
            if ack != AUTH_ACK {
                return Err(HandshakeError::Rejected(format!("unexpected ack byte {ack:#04x}")));
            }
            Ok(())
        } else {
            let mut remote_nonce = [0u8; NONCE_LEN];
            conn.read_exact(&mut remote_nonce).await?;

            conn.write_all(&local_nonce).await?;
            conn.write_all(self.tag(false, &remote_nonce).as_bytes()).await?;
            conn.flush().await?;

            let mut remote_tag = [0u8; TAG_LEN];
            conn.read_exact(&mut remote_tag).await?;
            self.verify(true, &local_nonce, remote_tag)?;
            conn.write_u8(AUTH_ACK).await?;
            conn.flush().await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn info(outbound: bool) -> PeerInfo {
        PeerInfo {
            remote_addr: "127.0.0.1:4000".parse().unwrap(),
            outbound,
        }
    }

    async fn run_pair<A, B>(dialer: A, acceptor: B) -> (Result<(), HandshakeError>, Result<(), HandshakeError>)
    where
        A: Handshake + 'static,
        B: Handshake + 'static,
    {
        let (mut client, mut server) = duplex(256);
        let accept = tokio::spawn(async move {
            let result = acceptor.handshake(&mut server, &info(false)).await;
            drop(server);
            result
        });
        let dial = dialer.handshake(&mut client, &info(true)).await;
        drop(client);
        (dial, accept.await.expect("acceptor task"))
    }

    #[tokio::test]
    async fn magic_handshake_accepts_matching_magic() {
        let (dial, accept) = run_pair(MagicHandshake::new(*b"P2P1"), MagicHandshake::new(*b"P2P1")).await;
        assert!(dial.is_ok());
        assert!(accept.is_ok());
    }

    #[tokio::test]
    async fn magic_handshake_rejects_wrong_magic_on_both_sides() {
        let (dial, accept) = run_pair(MagicHandshake::new(*b"NOPE"), MagicHandshake::new(*b"P2P1")).await;
        assert!(matches!(accept, Err(HandshakeError::BadMagic { actual, .. }) if &actual == b"NOPE"));
        assert!(matches!(dial, Err(HandshakeError::Io(_))));
    }

    #[tokio::test]
    async fn shared_key_handshake_authenticates_both_sides() {
        let key = SharedKeyHandshake::from_passphrase("correct horse");
        let (dial, accept) = run_pair(key.clone(), key).await;
        assert!(dial.is_ok());
        assert!(accept.is_ok());
    }

    #[tokio::test]
    async fn shared_key_handshake_rejects_wrong_key() {
        let (dial, accept) = run_pair(
            SharedKeyHandshake::from_passphrase("alice"),
            SharedKeyHandshake::from_passphrase("mallory"),
        )
        .await;
        assert!(matches!(dial, Err(HandshakeError::AuthenticationFailed)));
        assert!(accept.is_err());
    }

    #[test]
    fn tags_are_bound_to_role() {
        let handshake = SharedKeyHandshake::new([9u8; 32]);
        let nonce = [3u8; NONCE_LEN];
        assert_ne!(handshake.tag(true, &nonce), handshake.tag(false, &nonce));
        let reflected = *handshake.tag(false, &nonce).as_bytes();
        assert!(handshake.verify(true, &nonce, reflected).is_err());
    }
}
