use std::path::PathBuf;

use clap::Parser;
use node::{NodeConfig, Overrides, broadcast, run_error_loop, run_inbound_loop};
use p2p::TcpTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Demo node for the p2p stream transport")]
struct Cli {
    /// Optional path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides config file).
    #[arg(long)]
    listen: Option<String>,

    /// Peer to dial on startup; repeatable (adds to config file seeds).
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// 4-byte network magic (overrides config file).
    #[arg(long)]
    magic: Option<String>,

    /// Shared-key handshake passphrase (overrides config file, wins over magic).
    #[arg(long)]
    handshake_key: Option<String>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    config.apply_overrides(Overrides {
        listen: cli.listen,
        seeds: cli.seeds,
        magic: cli.magic,
        handshake_key: cli.handshake_key,
    });

    let transport = TcpTransport::new(config.transport_opts()?);
    let addr = transport.listen_and_accept().await?;
    info!(%addr, "node started, type a line to broadcast it");

    if let Some(inbound) = transport.consume() {
        tokio::spawn(run_inbound_loop(inbound));
    }
    if let Some(errors) = transport.errors() {
        tokio::spawn(run_error_loop(errors));
    }

    for seed in &config.seeds {
        match transport.connect(seed).await {
            Ok(peer) => info!(remote = %seed, local = %peer.local_addr(), "connected to seed"),
            Err(err) => warn!(remote = %seed, error = %err, "failed to connect to seed"),
        }
    }

    let codec = config.codec();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let delivered = broadcast(&transport, &codec, line.as_bytes()).await?;
                    info!(delivered, "line broadcast");
                }
                None => {
                    // stdin closed; keep serving until interrupted
                    signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    transport.close().await;
    Ok(())
}
