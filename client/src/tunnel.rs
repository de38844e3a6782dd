//! One flying tunnel connection.
//!
//! Chunks from the frontend are decoded by a [`Parser`] into a
//! [`ChunkQueue`] and routed by stream id. Each stream gets its own task
//! pumping bytes between the tunnel and a local TCP connection; all
//! outbound frames funnel through a single writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use pktunnel_shared::{
    format_eof, format_ping, format_pong, format_reject, format_reply, ChunkHeaders, ChunkQueue,
    EofFlags, Handshake, Kite, Parser, QueuedChunk, StreamEof,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

const READ_BUFFER: usize = 16 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Silent keepalive rounds tolerated before the tunnel is declared dead.
const KEEPALIVE_MISSES: u32 = 3;
const WIRE_QUEUE: usize = 256;
const STREAM_QUEUE: usize = 64;

/// What the tunnel hands to a stream task.
#[derive(Debug)]
enum StreamInput {
    Data(Bytes),
    Eof(EofFlags),
}

struct StreamHandle {
    tx: mpsc::Sender<StreamInput>,
    eof: StreamEof,
}

struct Session {
    kites: Vec<Arc<Kite>>,
    streams: HashMap<String, StreamHandle>,
    wire: mpsc::Sender<Bytes>,
    finished: mpsc::UnboundedSender<String>,
}

/// Runs the tunnel until the frontend goes away. `Ok` means a clean close.
pub async fn serve<S>(handshake: Handshake<S>, kites: Vec<Arc<Kite>>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = handshake.peer;
    let (mut reader, mut writer) = tokio::io::split(handshake.stream);

    let (wire_tx, mut wire_rx) = mpsc::channel::<Bytes>(WIRE_QUEUE);
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = wire_rx.recv().await {
            writer.write_all(&frame).await?;
        }
        writer.shutdown().await
    });

    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        kites,
        streams: HashMap::new(),
        wire: wire_tx,
        finished: finished_tx,
    };

    let mut parser = Parser::new(ChunkQueue::default());
    parser.parse(&handshake.leftover)?;
    session.drain(&mut parser).await?;

    let mut buf = vec![0u8; READ_BUFFER];
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;
    let mut silent_rounds = 0;

    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(anyhow::Error::from(e).context("Failed to read from frontend")),
                };
                silent_rounds = 0;
                if let Err(e) = parser.parse(&buf[..n]) {
                    break Err(anyhow::Error::from(e).context("Frontend sent a malformed chunk"));
                }
                if let Err(e) = session.drain(&mut parser).await {
                    break Err(e);
                }
            }
            Some(sid) = finished_rx.recv() => {
                trace!(sid = %sid, "Stream finished");
                session.streams.remove(&sid);
            }
            _ = keepalive.tick() => {
                silent_rounds += 1;
                if silent_rounds > KEEPALIVE_MISSES {
                    break Err(anyhow!("Frontend {} stopped answering keepalives", peer));
                }
                if let Err(e) = session.send(format_ping()).await {
                    break Err(e);
                }
            }
            joined = &mut writer_task => {
                break match joined {
                    Ok(Err(e)) => Err(anyhow::Error::from(e).context("Failed to write to frontend")),
                    _ => Err(anyhow!("Tunnel writer stopped")),
                };
            }
        }
    };

    writer_task.abort();
    debug!("Dropping {} open stream(s)", session.streams.len());
    result
}

impl Session {
    async fn drain(&mut self, parser: &mut Parser<ChunkQueue>) -> Result<()> {
        while let Some(chunk) = parser.sink_mut().pop() {
            self.dispatch(chunk).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, chunk: QueuedChunk) -> Result<()> {
        let QueuedChunk { headers, data } = chunk;

        if headers.ping {
            trace!("Ping from frontend");
            return self.send(format_pong()).await;
        }
        let Some(sid) = headers.sid.clone() else {
            return Ok(());
        };
        if headers.noop {
            return Ok(());
        }
        if let Some(kb) = headers.remote_sent_kb {
            trace!(sid = %sid, "Frontend reports {} KB sent", kb);
        }

        if !self.streams.contains_key(&sid) {
            if headers.request_host.is_none() && headers.request_proto.is_none() {
                // Never answer an EOF with an EOF.
                if headers.eof.is_none() {
                    debug!(sid = %sid, "Data for unknown stream, closing it");
                    self.send(format_eof(&sid, EofFlags::BOTH)?).await?;
                }
                return Ok(());
            }
            if !self.open(&sid, &headers).await? {
                return Ok(());
            }
        }

        if !data.is_empty() {
            self.forward(&sid, StreamInput::Data(data)).await;
        }
        if let Some(flags) = headers.eof {
            self.close(&sid, flags).await;
        }
        Ok(())
    }

    /// Starts a stream task for a new stream id. Returns false when no kite
    /// matches, after telling the frontend.
    async fn open(&mut self, sid: &str, headers: &ChunkHeaders) -> Result<bool> {
        let proto = headers.request_proto.as_deref().unwrap_or("http");
        let host = headers.request_host.as_deref().unwrap_or("");
        let port = headers.request_port.unwrap_or(0);

        let Some(kite) = find_kite(&self.kites, proto, host, port).cloned() else {
            info!(sid, "No kite for {}://{}:{}, rejecting", proto, host, port);
            if proto == "http" {
                let page = format_reject("BE", proto, host, false);
                self.send(format_reply(sid, page.as_bytes())?).await?;
            }
            self.send(format_eof(sid, EofFlags::BOTH)?).await?;
            return Ok(false);
        };

        info!(
            sid,
            "{}://{} from {}:{} -> {}:{}",
            proto,
            host,
            headers.remote_ip.as_deref().unwrap_or("?"),
            headers.remote_port.unwrap_or(0),
            kite.local_domain,
            kite.local_port
        );

        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.streams.insert(
            sid.to_string(),
            StreamHandle {
                tx,
                eof: StreamEof::default(),
            },
        );
        tokio::spawn(pump(
            sid.to_string(),
            kite,
            rx,
            self.wire.clone(),
            self.finished.clone(),
        ));
        Ok(true)
    }

    async fn forward(&mut self, sid: &str, input: StreamInput) {
        if let Some(stream) = self.streams.get(sid) {
            if stream.tx.send(input).await.is_err() {
                self.streams.remove(sid);
            }
        }
    }

    async fn close(&mut self, sid: &str, flags: EofFlags) {
        let Some(stream) = self.streams.get_mut(sid) else {
            return;
        };
        let newly = stream.eof.apply(flags);
        let closed = stream.eof.is_closed();
        if !newly.is_empty() {
            let _ = stream.tx.send(StreamInput::Eof(newly)).await;
        }
        if closed {
            self.streams.remove(sid);
        }
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        self.wire
            .send(frame)
            .await
            .map_err(|_| anyhow!("Tunnel writer is gone"))
    }
}

/// Exact port match wins over a kite registered on the default port.
fn find_kite<'a>(kites: &'a [Arc<Kite>], proto: &str, host: &str, port: u16) -> Option<&'a Arc<Kite>> {
    let candidates = || {
        kites
            .iter()
            .filter(move |k| k.protocol == proto && k.public_domain.eq_ignore_ascii_case(host))
    };
    candidates()
        .find(|k| k.public_port != 0 && k.public_port == port)
        .or_else(|| candidates().find(|k| k.public_port == 0))
}

async fn pump(
    sid: String,
    kite: Arc<Kite>,
    mut input: mpsc::Receiver<StreamInput>,
    wire: mpsc::Sender<Bytes>,
    finished: mpsc::UnboundedSender<String>,
) {
    if let Err(e) = pump_stream(&sid, &kite, &mut input, &wire).await {
        debug!(sid = %sid, "Stream failed: {:#}", e);
        if let Ok(frame) = format_eof(&sid, EofFlags::BOTH) {
            let _ = wire.send(frame).await;
        }
    }
    let _ = finished.send(sid);
}

/// Copies bytes both ways until both directions are closed.
///
/// `EOF: w` from the frontend means it will send nothing more, so the local
/// write half is shut down; `EOF: r` means it will read nothing more, so
/// local reads stop.
async fn pump_stream(
    sid: &str,
    kite: &Kite,
    input: &mut mpsc::Receiver<StreamInput>,
    wire: &mpsc::Sender<Bytes>,
) -> Result<()> {
    let mut local = TcpStream::connect((kite.local_domain.as_str(), kite.local_port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", kite.local_domain, kite.local_port))?;
    let (mut rd, mut wr) = local.split();

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
                    format_reply(sid, &buf[..n])?
                };
                wire.send(frame).await.map_err(|_| anyhow!("Tunnel writer is gone"))?;
            }
            msg = input.recv() => match msg {
                Some(StreamInput::Data(data)) if writing => wr.write_all(&data).await?,
                Some(StreamInput::Data(_)) => {}
                Some(StreamInput::Eof(flags)) => {
                    if flags.has_write() && writing {
                        wr.shutdown().await?;
                        writing = false;
                    }
                    if flags.has_read() {
                        reading = false;
                    }
                }
                None => return Ok(()),
            },
        }
    }
    Ok(())
}
