//! Msgr node binary.
//!
//! Runs one cluster messaging endpoint: listens for inbound links, dials
//! the configured peers, and logs session lifecycle plus delivered
//! messages. Mostly a harness around [`msgr_proto::Registry`].

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use msgr_proto::{ConnectionHandler, OpenPolicy, PresharedPolicy, QueueHandler, Registry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{parse_peer, MsgrConfig};

/// Cluster messaging node
#[derive(Parser, Debug)]
#[command(name = "strata-msgr", version, about = "Strata cluster messaging node")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:9100 (overrides config)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer to dial, as kind.id@host:port (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Keepalive interval, e.g. 10s
    #[arg(long)]
    keepalive: Option<humantime::Duration>,

    /// Configuration file path
    #[arg(long, default_value = "msgr.yaml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("msgr_proto={}", args.log_level).parse()?)
        .add_directive(format!("msgr_wire={}", args.log_level).parse()?)
        .add_directive(format!("strata_msgr={}", args.log_level).parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let mut config = MsgrConfig::load_from_file(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(keepalive) = args.keepalive {
        config.keepalive_interval = keepalive.as_secs();
    }
    config.peers.extend(args.peer.iter().cloned());

    let local_name = config.local_name()?;
    let proto_cfg = config.protocol_config();
    let keepalive = proto_cfg.keepalive_interval;

    let auth_policy: Arc<dyn msgr_proto::AuthPolicy> = if config.auth_secret.is_empty() {
        Arc::new(OpenPolicy)
    } else {
        Arc::new(PresharedPolicy::new(Bytes::from(
            config.auth_secret.clone().into_bytes(),
        )))
    };

    let registry = Registry::new(
        local_name,
        config.listen_addr,
        proto_cfg,
        auth_policy,
        Box::new(move || {
            let (handler, mut delivered) = QueueHandler::new(keepalive);
            tokio::spawn(async move {
                while let Some(message) = delivered.recv().await {
                    info!(
                        seq = message.seq,
                        len = message.body.len(),
                        "delivered message"
                    );
                }
            });
            let handler: Arc<dyn ConnectionHandler> = handler;
            handler
        }),
    );

    info!(name = %local_name, listen = %config.listen_addr, "msgr node starting");

    // Accept loop
    let listener = TcpListener::bind(config.listen_addr).await?;
    let accept_registry = registry.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!(%addr, "inbound link");
                    if let Err(e) = accept_registry.start_accept(socket).await {
                        warn!(%addr, "failed to accept link: {}", e);
                    }
                }
                Err(e) => {
                    warn!("listener error: {}", e);
                    break;
                }
            }
        }
    });

    // Dial configured peers
    for spec in &config.peers {
        match parse_peer(spec) {
            Ok((name, addr)) => {
                registry.connect_to(addr, name).await;
            }
            Err(e) => warn!(spec = %spec, "skipping bad peer spec: {}", e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    registry.shutdown().await;
    Ok(())
}
