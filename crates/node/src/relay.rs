use p2p::{Encoder, Message, Peer, TcpTransport, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frame `payload` once and send it to every registered peer. Returns how
/// many peers accepted the write.
pub async fn broadcast(transport: &TcpTransport, encoder: &dyn Encoder, payload: &[u8]) -> anyhow::Result<usize> {
    let frame = encoder.frame(payload)?;
    let mut delivered = 0;
    for peer in transport.tcp_peers() {
        match peer.send(&frame).await {
            Ok(()) => delivered += 1,
            Err(err) => warn!(remote = %peer.remote_addr(), error = %err, "broadcast to peer failed"),
        }
    }
    debug!(delivered, bytes = payload.len(), "broadcast complete");
    Ok(delivered)
}

/// Log every inbound message until the transport closes.
pub async fn run_inbound_loop(mut inbound: mpsc::Receiver<Message>) -> usize {
    let mut seen = 0;
    while let Some(message) = inbound.recv().await {
        seen += 1;
        info!(
            from = %message.from,
            payload = %String::from_utf8_lossy(&message.payload),
            "message received"
        );
    }
    seen
}

/// Log operational errors until the transport closes.
pub async fn run_error_loop(mut errors: mpsc::Receiver<TransportError>) {
    while let Some(err) = errors.recv().await {
        match err {
            TransportError::PeerDisconnected(remote) => info!(%remote, "peer disconnected"),
            other => warn!(error = %other, remote = ?other.remote(), "transport reported an error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2p::{LengthPrefixedCodec, TcpTransportOpts, TransportConfig};

    fn transport() -> TcpTransport {
        TcpTransport::new(TcpTransportOpts::new(TransportConfig::new("127.0.0.1:0")))
    }

    #[tokio::test]
    async fn broadcast_reaches_every_dialed_peer() {
        let codec = LengthPrefixedCodec::default();
        let hub = transport();
        let mut listeners = Vec::new();
        for _ in 0..2 {
            let node = transport();
            let addr = node.listen_and_accept().await.unwrap();
            hub.connect(&addr.to_string()).await.unwrap();
            listeners.push(node);
        }

        assert_eq!(broadcast(&hub, &codec, b"hi all").await.unwrap(), 2);
        hub.close().await;

        for node in listeners {
            let inbound = node.consume().unwrap();
            let counter = tokio::spawn(run_inbound_loop(inbound));
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            node.close().await;
            assert_eq!(counter.await.unwrap(), 1);
        }
    }
}
