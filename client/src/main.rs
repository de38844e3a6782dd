use anyhow::{Context, Result};
use clap::Parser;
use pktunnel_shared::handshake::{connect, Connector, HandshakeOutcome, TcpConnector};
use pktunnel_shared::{Kite, KiteRequest, KiteStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod config;
mod tls;
mod tunnel;

use config::{ClientConfig, KiteConfig};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "pktunnel")]
#[command(author = "PkTunnel Team")]
#[command(version)]
#[command(about = "Fly kites: expose local services through a tunnel frontend", long_about = None)]
struct Cli {
    /// Frontend relay, host:port
    #[arg(short, long)]
    frontend: Option<String>,

    /// Connect to the frontend over TLS
    #[arg(long)]
    tls: bool,

    /// Name to verify the frontend certificate against
    #[arg(long)]
    tls_name: Option<String>,

    /// Kite to fly, proto:domain[:port]
    #[arg(short, long, requires_all = ["secret", "local_port"])]
    kite: Option<String>,

    /// Shared secret for --kite
    #[arg(short, long)]
    secret: Option<String>,

    /// Local port --kite forwards to
    #[arg(short, long)]
    local_port: Option<u16>,

    /// Config file (default: pktunnel.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let config = build_config(cli)?;
    let (host, port) = config.frontend_addr()?;
    let kites: Vec<Arc<Kite>> = config.kites.iter().map(|k| Arc::new(k.to_kite())).collect();

    for kite in &kites {
        println!(
            "  {} -> {}:{}",
            kite.name(),
            kite.local_domain,
            kite.local_port
        );
    }

    let fly = async {
        if config.tls {
            let name = config.tls_name.clone().unwrap_or_else(|| host.clone());
            let connector = tls::connector(&name)?;
            run(&connector, &host, port, &kites).await
        } else {
            run(&TcpConnector, &host, port, &kites).await
        }
    };

    tokio::select! {
        result = fly => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    }
}

/// Merges command-line flags over the config file.
fn build_config(cli: Cli) -> Result<ClientConfig> {
    let mut config = match (&cli.kite, &cli.config) {
        (Some(arg), _) => {
            let secret = cli.secret.clone().context("--kite needs --secret")?;
            let local_port = cli.local_port.context("--kite needs --local-port")?;
            ClientConfig {
                frontend: config::default_frontend(),
                tls: false,
                tls_name: None,
                kites: vec![KiteConfig::from_arg(arg, secret, local_port)?],
            }
        }
        (None, Some(path)) => ClientConfig::load(path)?,
        (None, None) => {
            let path = ClientConfig::find_config()
                .context("No --kite given and no pktunnel.yml found")?;
            info!("Using config {}", path.display());
            ClientConfig::load(&path)?
        }
    };

    if let Some(frontend) = cli.frontend {
        config.frontend = frontend;
    }
    if cli.tls {
        config.tls = true;
    }
    if cli.tls_name.is_some() {
        config.tls_name = cli.tls_name;
    }

    config.validate()?;
    Ok(config)
}

/// Keeps the kites flying: handshake, serve, and reconnect after a delay.
/// Returns only when the frontend refuses every kite.
async fn run<C: Connector>(connector: &C, host: &str, port: u16, kites: &[Arc<Kite>]) -> Result<()>
where
    C::Stream: 'static,
{
    let mut requests: Vec<KiteRequest> = kites.iter().cloned().map(KiteRequest::new).collect();
    let mut session: Option<String> = None;

    loop {
        match establish(connector, host, port, &mut requests, session.as_deref()).await {
            Ok(handshake) => match handshake.outcome {
                HandshakeOutcome::Rejected => {
                    anyhow::bail!("Frontend {}:{} rejected every kite", host, port);
                }
                HandshakeOutcome::Unknown => {
                    warn!("No kite confirmed by {}. Reconnecting in {}s...", host, RECONNECT_DELAY.as_secs());
                }
                HandshakeOutcome::Flying => {
                    if handshake.session_id.is_some() {
                        session = handshake.session_id.clone();
                    }
                    let flying: Vec<Arc<Kite>> = requests
                        .iter()
                        .filter(|r| r.status == KiteStatus::Flying)
                        .map(|r| r.kite.clone())
                        .collect();
                    for request in requests.iter().filter(|r| r.status == KiteStatus::Rejected) {
                        warn!("Kite {} was rejected", request.kite.name());
                    }
                    println!("  ✓ {} kite(s) flying via {}", flying.len(), handshake.peer);

                    match tunnel::serve(handshake, flying).await {
                        Ok(()) => info!("Tunnel closed. Reconnecting in {}s...", RECONNECT_DELAY.as_secs()),
                        Err(e) => error!("Tunnel error: {:#}. Reconnecting in {}s...", e, RECONNECT_DELAY.as_secs()),
                    }
                }
            },
            Err(e) => {
                error!("Handshake with {}:{} failed: {:#}. Reconnecting in {}s...", host, port, e, RECONNECT_DELAY.as_secs());
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// One handshake with fresh salts, plus a second round if the frontend
/// answered with a sign-this challenge.
async fn establish<C: Connector>(
    connector: &C,
    host: &str,
    port: u16,
    requests: &mut [KiteRequest],
    session: Option<&str>,
) -> Result<pktunnel_shared::Handshake<C::Stream>> {
    for request in requests.iter_mut() {
        request.bsalt = None;
        request.fsalt = None;
        request.signature = None;
    }

    let handshake = connect(connector, host, port, requests, session).await?;
    let challenged = requests
        .iter()
        .any(|r| r.status == KiteStatus::Unknown && r.fsalt.is_some());
    if handshake.outcome == HandshakeOutcome::Flying || !challenged {
        return Ok(handshake);
    }

    info!("Frontend sent a challenge, signing again");
    drop(handshake);
    Ok(connect(connector, host, port, requests, session).await?)
}
