//! Stream transport over TCP.
//!
//! One task runs the accept loop. Every accepted connection gets its own task
//! for the handshake and, once registered, its read loop, so a slow remote
//! never stalls acceptance of the others. Dialing runs the handshake on the
//! caller's task and only returns a registered peer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{TcpTransportOpts, TransportConfig};
use crate::error::{DecodeError, HandshakeError, TransportError};
use crate::handshake::PeerInfo;
use crate::message::Message;
use crate::peer::{Peer, TcpPeer};
use crate::registry::PeerRegistry;
use crate::transport::Transport;

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    opts: TcpTransportOpts,
    registry: PeerRegistry,
    // Taken on close so both streams end once the last read loop exits.
    inbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    errors_tx: Mutex<Option<mpsc::Sender<TransportError>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<TransportError>>>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<ListenerState>,
    next_peer_id: AtomicU64,
}

#[derive(Default)]
struct ListenerState {
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(opts.config.inbound_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(opts.config.error_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                opts,
                registry: PeerRegistry::new(),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                inbound_rx: Mutex::new(Some(inbound_rx)),
                errors_tx: Mutex::new(Some(errors_tx)),
                errors_rx: Mutex::new(Some(errors_rx)),
                shutdown,
                listener: Mutex::new(ListenerState::default()),
                next_peer_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.opts.config
    }

    /// Address the listener is bound to, once `listen_and_accept` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<Arc<TcpPeer>> {
        self.inner.registry.get(addr)
    }

    pub fn tcp_peers(&self) -> Vec<Arc<TcpPeer>> {
        self.inner.registry.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(addr) = self.local_addr() {
            return Err(TransportError::AlreadyListening(addr));
        }

        let listen_addr = &self.inner.opts.config.listen_addr;
        let bind_addr = resolve_listen_addr(listen_addr).await?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        self.install_listener(listener, local_addr)?;
        info!(addr = %local_addr, "p2p listening");
        Ok(local_addr)
    }

    fn install_listener(&self, listener: TcpListener, local_addr: SocketAddr) -> Result<(), TransportError> {
        let mut state = self.inner.listener.lock();
        // Re-checked under the lock: `close` may have run while binding.
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(addr) = state.local_addr {
            return Err(TransportError::AlreadyListening(addr));
        }
        state.local_addr = Some(local_addr);
        state.accept_task = Some(tokio::spawn(accept_loop(self.inner.clone(), listener)));
        Ok(())
    }

    /// Dial `addr`, run the handshake and register the outbound peer.
    pub async fn connect(&self, addr: &str) -> Result<Arc<TcpPeer>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let stream = match timeout(self.inner.opts.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Dial {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(TransportError::Dial {
                    addr: addr.to_string(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        let remote = stream.peer_addr()?;
        let peer = establish(&self.inner, stream, remote, true).await?;
        debug!(%remote, "outbound peer connected");
        Ok(peer)
    }

    pub fn consume(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.inbound_rx.lock().take()
    }

    pub fn errors(&self) -> Option<mpsc::Receiver<TransportError>> {
        self.inner.errors_rx.lock().take()
    }

    pub async fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("closing p2p transport");
        let peers = self.inner.registry.close_all();
        let accept_task = self.inner.listener.lock().accept_task.take();
        self.inner.inbound_tx.lock().take();
        self.inner.errors_tx.lock().take();
        for peer in peers {
            peer.close().await;
        }
        if let Some(task) = accept_task {
            if let Err(err) = task.await {
                warn!(error = ?err, "accept task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        TcpTransport::listen_and_accept(self).await
    }

    async fn dial(&self, addr: &str) -> Result<Arc<dyn Peer>, TransportError> {
        let peer = self.connect(addr).await?;
        Ok(peer)
    }

    fn consume(&self) -> Option<mpsc::Receiver<Message>> {
        TcpTransport::consume(self)
    }

    fn errors(&self) -> Option<mpsc::Receiver<TransportError>> {
        TcpTransport::errors(self)
    }

    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.tcp_peers()
            .into_iter()
            .map(|peer| peer as Arc<dyn Peer>)
            .collect()
    }

    async fn close(&self) {
        TcpTransport::close(self).await
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.local_addr())
            .field("peers", &self.peer_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn report(&self, err: TransportError) {
        match &err {
            TransportError::PeerDisconnected(_) => debug!(error = %err, "peer disconnected"),
            _ => warn!(error = %err, "transport error"),
        }
        let errors_tx = self.errors_tx.lock().clone();
        if let Some(errors_tx) = errors_tx {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = errors_tx.try_send(err) {
                debug!(error = %dropped, "error queue full, dropping");
            }
        }
    }

    /// Hand a message to the application. Returns false when the read loop
    /// should stop.
    async fn publish(&self, peer: &TcpPeer, inbound: &mpsc::Sender<Message>, message: Message) -> bool {
        let remote = message.from;
        let send = timeout(self.opts.config.inbound_send_timeout, inbound.send(message));
        tokio::select! {
            biased;
            _ = peer.closed() => false,
            sent = send => match sent {
                Ok(Ok(())) => true,
                Ok(Err(_)) => {
                    debug!(%remote, "inbound consumer dropped, closing peer");
                    false
                }
                Err(_) => {
                    self.report(TransportError::InboundOverflow(remote));
                    true
                }
            },
        }
    }
}

async fn resolve_listen_addr(addr: &str) -> Result<SocketAddr, TransportError> {
    let invalid = |reason: String| TransportError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };
    // A bare ":port" binds every interface.
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    let mut candidates = lookup_host(normalized.as_str())
        .await
        .map_err(|err| invalid(err.to_string()))?;
    candidates
        .next()
        .ok_or_else(|| invalid("resolved to no addresses".to_string()))
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the transport is gone, which also ends the wait.
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "new incoming connection");
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        if let Err(err) = establish(&inner, stream, remote, false).await {
                            if err.is_shutdown() {
                                debug!(%remote, "dropping connection accepted during shutdown");
                            } else {
                                inner.report(err);
                            }
                        }
                    });
                }
                Err(err) => {
                    inner.report(TransportError::Accept(err));
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = sleep(inner.opts.config.accept_backoff) => {}
                    }
                }
            },
        }
    }
    debug!("accept loop stopped");
}

/// Handshake a fresh connection, register it and start its read loop.
/// On any failure the stream is dropped and nothing is registered.
async fn establish(
    inner: &Arc<Inner>,
    mut stream: TcpStream,
    remote: SocketAddr,
    outbound: bool,
) -> Result<Arc<TcpPeer>, TransportError> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%remote, error = ?err, "failed to set TCP_NODELAY");
    }

    let info = PeerInfo {
        remote_addr: remote,
        outbound,
    };
    let mut shutdown = inner.shutdown.subscribe();
    let handshake = timeout(
        inner.opts.config.handshake_timeout,
        inner.opts.handshake.handshake(&mut stream, &info),
    );
    let outcome = tokio::select! {
        biased;
        _ = shutdown_requested(&mut shutdown) => return Err(TransportError::Closed),
        outcome = handshake => outcome,
    };
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(source)) => return Err(TransportError::Handshake { remote, source }),
        Err(_) => {
            return Err(TransportError::Handshake {
                remote,
                source: HandshakeError::Timeout,
            });
        }
    }

    let inbound = inner.inbound_tx.lock().clone().ok_or(TransportError::Closed)?;
    let local = stream.local_addr()?;
    let (reader, writer) = stream.into_split();
    let id = inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
    let peer = Arc::new(TcpPeer::new(id, local, remote, outbound, writer));
    if let Some(old) = inner.registry.insert(peer.clone())? {
        debug!(%remote, old = old.id(), new = id, "replacing existing peer");
        old.close().await;
    }
    info!(%remote, outbound, "peer connected");

    tokio::spawn(read_loop(inner.clone(), peer.clone(), reader, inbound));
    Ok(peer)
}

async fn read_loop(
    inner: Arc<Inner>,
    peer: Arc<TcpPeer>,
    reader: OwnedReadHalf,
    inbound: mpsc::Sender<Message>,
) {
    let remote = peer.remote_addr();
    let mut reader = BufReader::new(reader);
    let failure = loop {
        let decoded = tokio::select! {
            biased;
            _ = peer.closed() => break None,
            decoded = inner.opts.decoder.decode(&mut reader) => decoded,
        };
        match decoded {
            Ok(payload) => {
                if !inner.publish(&peer, &inbound, Message::new(remote, payload)).await {
                    break None;
                }
            }
            Err(err) if err.is_recoverable() => {
                inner.report(TransportError::Decode { remote, source: err });
            }
            Err(err) => break Some(err),
        }
    };

    let closed_locally = peer.is_closed();
    inner.registry.remove(remote, peer.id());
    peer.close().await;

    match failure {
        Some(err) if closed_locally => {
            debug!(%remote, error = %err, "read loop stopped by local close");
        }
        Some(DecodeError::Eof) => inner.report(TransportError::PeerDisconnected(remote)),
        Some(source) => inner.report(TransportError::Decode { remote, source }),
        None => debug!(%remote, "read loop stopped"),
    }
}
