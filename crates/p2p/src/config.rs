use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Decoder, LengthPrefixedCodec};
use crate::handshake::{Handshake, NopHandshake};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Runtime tuning for a stream transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Address handed to `listen_and_accept`. `":3000"` binds every interface.
    pub listen_addr: String,
    /// Largest payload a decoder will accept.
    pub max_frame_size: usize,
    /// Decoded messages buffered for the application before backpressure.
    pub inbound_capacity: usize,
    /// Operational errors buffered before new ones are dropped.
    pub error_capacity: usize,
    /// How long a read loop waits for inbound queue space before dropping.
    pub inbound_send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Pause after a failed accept before trying again.
    pub accept_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            inbound_capacity: 1024,
            error_capacity: 256,
            inbound_send_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

impl TransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity.max(1);
        self
    }

    pub fn with_inbound_send_timeout(mut self, timeout: Duration) -> Self {
        self.inbound_send_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }
}

/// Everything a [`TcpTransport`](crate::TcpTransport) is built from.
///
/// The handshake and decoder are shared strategy objects, so one instance can
/// serve every connection the transport accepts or dials.
#[derive(Clone)]
pub struct TcpTransportOpts {
    pub config: TransportConfig,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
}

impl TcpTransportOpts {
    /// No-op handshake and a length-prefixed decoder bounded by the config.
    pub fn new(config: TransportConfig) -> Self {
        let decoder = LengthPrefixedCodec::new(config.max_frame_size);
        Self {
            config,
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(decoder),
        }
    }

    pub fn with_handshake(mut self, handshake: impl Handshake + 'static) -> Self {
        self.handshake = Arc::new(handshake);
        self
    }

    pub fn with_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }
}

impl Default for TcpTransportOpts {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl std::fmt::Debug for TcpTransportOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransportOpts")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
