//! PkTunnel Relay
//!
//! Frontend for PageKite-style tunnels. One port serves backends (which
//! connect with `CONNECT PageKite:1`), liveness checks, and the public
//! visitors whose traffic is multiplexed over the backends' tunnels.

use anyhow::{Context, Result};
use bytes::BytesMut;
use pktunnel_shared::kite::random_salt;
use pktunnel_shared::PK_FRONTEND_PONG;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod head;
mod public;
mod tls;
mod tunnel;

use config::{KiteTable, RelayConfig};
use head::FirstRequest;
use public::Route;
use tunnel::TunnelRegistry;

/// How long a fresh connection gets to say who it is.
const FIRST_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    config: Arc<RelayConfig>,
    kites: Arc<KiteTable>,
    tunnels: Arc<TunnelRegistry>,
    /// Keys the frontend salts handed out in challenges
    challenge_secret: Arc<String>,
}

impl AppState {
    pub fn new(config: RelayConfig, kites: KiteTable) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            kites: Arc::new(kites),
            tunnels: Arc::new(TunnelRegistry::new()),
            challenge_secret: Arc::new(random_salt()?),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pktunnel_relay=info,pktunnel_shared=info")),
        )
        .init();

    let config = RelayConfig::from_env()?;
    let kites = match &config.kites_path {
        Some(path) => KiteTable::load(path)?,
        None => {
            warn!("PKTUNNEL_KITES is not set; every backend will be refused");
            KiteTable::default()
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, kites)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("PkTunnel Relay on {} ({} kite(s) known)", addr, state.kites.len());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream, remote).await {
                        debug!("Connection from {} ended: {:#}", remote, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Sniffs the first request and hands the connection to its role.
async fn handle_connection(state: AppState, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let first = timeout(FIRST_REQUEST_TIMEOUT, head::read_first_request(&mut stream, &mut buf))
        .await
        .context("Timed out waiting for the first request")??;

    match first {
        FirstRequest::Tls { server_name } => {
            let Some(domain) = server_name else {
                debug!("TLS from {} without a server name", remote);
                return Ok(());
            };
            let route = Route::new("https", domain, 443);
            public::serve(state, stream, remote, route, buf.freeze()).await
        }
        FirstRequest::Http { head, head_len } => {
            if head.is_ping() {
                let pong = format!("{}\r\nConnection: close\r\n\r\n", PK_FRONTEND_PONG);
                stream.write_all(pong.as_bytes()).await?;
                return Ok(());
            }
            if head.is_tunnel_connect() {
                let leftover = buf.split_off(head_len).freeze();
                return backend::serve(state, stream, remote, head, leftover).await;
            }

            let Some((domain, port)) = head.host(state.config.port) else {
                debug!("Request from {} without a usable Host header", remote);
                return Ok(());
            };
            let route = Route::new("http", domain, port);
            public::serve(state, stream, remote, route, buf.freeze()).await
        }
    }
}
