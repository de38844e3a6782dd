//! Public visitor connections, relayed as streams over a backend tunnel.

use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use pktunnel_shared::{format_chunk, format_eof, format_reject, ChunkHeaders, EofFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::tunnel::{StreamEvent, Tunnel};
use crate::AppState;

const READ_BUFFER: usize = 16 * 1024;

/// Where a visitor wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub proto: String,
    pub domain: String,
    pub port: u16,
}

impl Route {
    pub fn new(proto: &str, domain: impl Into<String>, port: u16) -> Self {
        Self {
            proto: proto.to_string(),
            domain: domain.into(),
            port,
        }
    }
}

/// Relays one visitor connection. `initial` is everything already read
/// from the visitor while routing it.
pub async fn serve(
    state: AppState,
    mut stream: TcpStream,
    remote: SocketAddr,
    route: Route,
    initial: Bytes,
) -> Result<()> {
    let Some(tunnel) = state.tunnels.lookup(&route.proto, &route.domain, route.port) else {
        info!("No tunnel for {}://{}:{} from {}", route.proto, route.domain, route.port, remote);
        if route.proto == "http" {
            let page = format_reject("FE", &route.proto, &route.domain, state.config.advertise);
            stream.write_all(page.as_bytes()).await?;
            stream.shutdown().await?;
        }
        return Ok(());
    };

    let (sid, mut events) = tunnel.open_stream();
    debug!(sid = %sid, "{}://{}:{} from {} via {}", route.proto, route.domain, route.port, remote, tunnel.remote);

    let open = ChunkHeaders::stream(sid.clone())
        .with_request(&route.proto, &route.domain, route.port)
        .with_remote(&remote.ip().to_string(), remote.port(), false);
    let result = match format_chunk(&open, &initial) {
        Ok(frame) => match tunnel.send(frame).await {
            Ok(()) => relay(&tunnel, &sid, stream, &mut events).await,
            Err(_) => Err(anyhow!("Tunnel writer is gone")),
        },
        Err(e) => Err(e.into()),
    };

    tunnel.close_stream(&sid);
    if let Err(e) = &result {
        debug!(sid = %sid, "Stream failed: {:#}", e);
        if let Ok(frame) = format_eof(&sid, EofFlags::BOTH) {
            let _ = tunnel.send(frame).await;
        }
    }
    result
}

/// Copies bytes both ways until both directions are closed or the tunnel
/// goes away.
///
/// `EOF: w` from the backend means it will send nothing more, so the
/// visitor's write half is shut down; `EOF: r` means it will read nothing
/// more, so visitor reads stop.
async fn relay(
    tunnel: &Tunnel,
    sid: &str,
    stream: TcpStream,
    events: &mut mpsc::Receiver<StreamEvent>,
) -> Result<()> {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut reading = true;
    let mut writing = true;

    while reading || writing {
        tokio::select! {
            read = rd.read(&mut buf), if reading => {
                let n = read?;
                let frame = if n == 0 {
                    reading = false;
                    format_eof(sid, EofFlags::WRITE)?
                } else {
                    format_chunk(&ChunkHeaders::stream(sid), &buf[..n])?
                };
                tunnel.send(frame).await.map_err(|_| anyhow!("Tunnel writer is gone"))?;
            }
            event = events.recv() => match event {
                Some(StreamEvent::Data(data)) if writing => wr.write_all(&data).await?,
                Some(StreamEvent::Data(_)) => {}
                Some(StreamEvent::Eof(flags)) => {
                    if flags.has_write() && writing {
                        wr.shutdown().await?;
                        writing = false;
                    }
                    if flags.has_read() {
                        reading = false;
                    }
                }
                None => return Err(anyhow!("Tunnel closed")),
            },
        }
    }
    Ok(())
}
