use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use p2p::{
    DEFAULT_MAX_FRAME_SIZE, LengthPrefixedCodec, MagicHandshake, SharedKeyHandshake, TcpTransportOpts,
    TransportConfig,
};
use serde::Deserialize;
use tracing::{info, warn};

/// High level runtime configuration for the demo node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    pub listen: String,
    pub seeds: Vec<String>,
    /// 4-character network magic; enables the magic handshake.
    pub magic: Option<String>,
    /// Passphrase for the shared-key handshake; wins over `magic`.
    pub handshake_key: Option<String>,
    pub max_frame_size: usize,
}

/// Values given on the command line. Each one that is set replaces the file
/// value; seeds are appended.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub seeds: Vec<String>,
    pub magic: Option<String>,
    pub handshake_key: Option<String>,
}

impl NodeConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let candidate = path.map(PathBuf::from).unwrap_or_else(default_config_path);
        if !candidate.exists() {
            if let Some(explicit) = path {
                info!(path = %explicit.display(), "configuration file not found, using defaults");
            }
            return Ok(config);
        }

        let contents = fs::read_to_string(&candidate)
            .with_context(|| format!("failed to read config at {}", candidate.display()))?;
        let raw: RawNodeConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", candidate.display()))?;

        if let Some(listen) = raw.listen {
            config.listen = listen;
        }
        if let Some(seeds) = raw.seeds {
            config.seeds = seeds;
        }
        if raw.magic.is_some() {
            config.magic = raw.magic;
        }
        if raw.handshake_key.is_some() {
            config.handshake_key = raw.handshake_key;
        }
        if let Some(max) = raw.max_frame_size {
            config.max_frame_size = max;
        }

        info!(path = %candidate.display(), "loaded configuration overrides");
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if overrides.magic.is_some() {
            self.magic = overrides.magic;
        }
        if overrides.handshake_key.is_some() {
            self.handshake_key = overrides.handshake_key;
        }
        self.seeds.extend(overrides.seeds);
    }

    /// Transport options matching this configuration.
    pub fn transport_opts(&self) -> anyhow::Result<TcpTransportOpts> {
        let transport = TransportConfig::new(self.listen.clone()).with_max_frame_size(self.max_frame_size);
        let opts = TcpTransportOpts::new(transport).with_decoder(self.codec());
        if let Some(key) = &self.handshake_key {
            if let Some(magic) = &self.magic {
                warn!(%magic, "handshake_key is set, ignoring network magic");
            }
            return Ok(opts.with_handshake(SharedKeyHandshake::from_passphrase(key)));
        }
        if let Some(magic) = &self.magic {
            let magic: [u8; 4] = match magic.as_bytes().try_into() {
                Ok(bytes) => bytes,
                Err(_) => bail!("network magic must be exactly 4 bytes, got {magic:?}"),
            };
            return Ok(opts.with_handshake(MagicHandshake::new(magic)));
        }
        Ok(opts)
    }

    pub fn codec(&self) -> LengthPrefixedCodec {
        LengthPrefixedCodec::new(self.max_frame_size)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            seeds: Vec::new(),
            magic: None,
            handshake_key: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

fn default_config_path() -> PathBuf {
    PathBuf::from("node.toml")
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawNodeConfig {
    listen: Option<String>,
    seeds: Option<Vec<String>>,
    magic: Option<String>,
    handshake_key: Option<String>,
    max_frame_size: Option<usize>,
}
