//! Backend side of the relay: answering the tunnel handshake and reading
//! chunks from admitted tunnels.
//!
//! Challenges are stateless. A frontend salt is itself a signature, keyed
//! by a per-process secret, over the kite name, the backend salt and a
//! coarse time window, so the relay can recognize its own challenges
//! without remembering them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use pktunnel_shared::handshake::{headers, VERSION};
use pktunnel_shared::kite::{random_salt, SIGNATURE_LENGTH};
use pktunnel_shared::{
    format_eof, format_pong, parse_kite_request, sign, verify_signature, ChunkQueue, EofFlags,
    Parser, QueuedChunk,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::head::RequestHead;
use crate::tunnel::{StreamEvent, Tunnel};
use crate::AppState;

/// Challenges stay valid for the current and the previous window.
const CHALLENGE_WINDOW_SECS: u64 = 600;
const WIRE_QUEUE: usize = 256;
const READ_BUFFER: usize = 16 * 1024;

/// Decision on one handshake.
#[derive(Debug)]
pub struct Verdict {
    /// Complete response head to write back.
    pub reply: String,
    /// Kite names admitted on this connection.
    pub flying: Vec<String>,
    pub challenged: usize,
    pub session_id: String,
}

/// Checks every `X-PageKite:` request in `head` against the known kites.
///
/// Unknown kites and bad signatures are refused with `X-PageKite-Invalid`;
/// requests without a current frontend salt get `X-PageKite-SignThis`;
/// kites already flown by another live session get `X-PageKite-Duplicate`
/// unless the backend asked to replace that session.
pub fn answer(state: &AppState, head: &RequestHead, now: u64) -> Result<Verdict> {
    let replace = head.header(headers::REPLACE);
    let mut lines: Vec<(&str, String)> = Vec::new();
    let mut flying = Vec::new();
    let mut challenged = 0;

    for value in head.headers_named(headers::KITE) {
        let request = match parse_kite_request(value) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring kite request {:?}: {}", value, e);
                continue;
            }
        };
        let name = request.kite_name();

        let Some(kite) = state.kites.get(&name) else {
            debug!("Unknown kite {}", name);
            lines.push((headers::INVALID, name));
            continue;
        };

        let secret = state.challenge_secret.as_str();
        let fsalt_is_ours = request.fsalt.as_deref().map_or(false, |fsalt| {
            challenge_is_current(secret, &name, &request.bsalt, fsalt, now)
        });
        if request.signature.is_none() || !fsalt_is_ours {
            let fsalt = challenge(secret, &name, &request.bsalt, now / CHALLENGE_WINDOW_SECS)?;
            lines.push((headers::SIGN_THIS, format!("{}:{}:{}", name, request.bsalt, fsalt)));
            challenged += 1;
            continue;
        }

        if !kite.verify(&request) {
            warn!("Bad signature for kite {}", name);
            lines.push((headers::INVALID, name));
            continue;
        }

        if let Some(owner) = state.tunnels.owner(&name) {
            if owner.is_alive() && Some(owner.session_id.as_str()) != replace {
                lines.push((headers::DUPLICATE, name));
                continue;
            }
        }

        lines.push((headers::OK, name.clone()));
        flying.push(name);
    }

    let session_id = random_salt()?;
    let mut reply = if flying.is_empty() && challenged == 0 {
        String::from("HTTP/1.1 503 Unavailable\r\n")
    } else {
        String::from("HTTP/1.1 200 OK\r\n")
    };
    reply.push_str(&format!("{}: {}\r\n", headers::VERSION, VERSION));
    for (key, value) in &lines {
        reply.push_str(&format!("{}: {}\r\n", key, value));
    }
    if !flying.is_empty() {
        reply.push_str(&format!("{}: {}\r\n", headers::SESSION_ID, session_id));
    }
    reply.push_str("\r\n");

    Ok(Verdict {
        reply,
        flying,
        challenged,
        session_id,
    })
}

fn challenge(secret: &str, name: &str, bsalt: &str, window: u64) -> Result<String> {
    Ok(sign(secret, name, &[bsalt, &window.to_string()], SIGNATURE_LENGTH)?)
}

fn challenge_is_current(secret: &str, name: &str, bsalt: &str, fsalt: &str, now: u64) -> bool {
    let window = now / CHALLENGE_WINDOW_SECS;
    [window, window.saturating_sub(1)]
        .iter()
        .any(|w| verify_signature(secret, name, &[bsalt, &w.to_string()], fsalt))
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Answers a handshake and, if anything flies, serves the tunnel until the
/// backend disconnects.
pub async fn serve(
    state: AppState,
    mut stream: TcpStream,
    remote: SocketAddr,
    head: RequestHead,
    leftover: Bytes,
) -> Result<()> {
    let verdict = answer(&state, &head, unix_now())?;
    stream.write_all(verdict.reply.as_bytes()).await?;
    stream.flush().await?;

    if verdict.flying.is_empty() {
        info!(
            "Backend {} not admitted ({} challenge(s) issued)",
            remote, verdict.challenged
        );
        return Ok(());
    }

    if let Some(old) = head.header(headers::REPLACE) {
        let dropped = state.tunnels.remove_session(old);
        if dropped > 0 {
            info!("Session {} replaced, {} route(s) dropped", old, dropped);
        }
    }

    let (tx, rx) = mpsc::channel::<Bytes>(WIRE_QUEUE);
    let tunnel = Arc::new(Tunnel::new(verdict.session_id, remote, verdict.flying, tx));
    state.tunnels.register(tunnel.clone());
    info!(
        "Tunnel active: {} via {} ({} route(s) total)",
        tunnel.kites.join(", "),
        remote,
        state.tunnels.len()
    );

    let result = run_tunnel(stream, &tunnel, rx, &leftover).await;

    state.tunnels.unregister(&tunnel);
    let open_streams = tunnel.stream_count();
    tunnel.close_all_streams();
    info!(
        "Tunnel {} closed after {}s, {} stream(s) dropped",
        tunnel.kites.join(", "),
        tunnel.created_at.elapsed().as_secs(),
        open_streams
    );
    result
}

async fn run_tunnel(
    stream: TcpStream,
    tunnel: &Tunnel,
    mut rx: mpsc::Receiver<Bytes>,
    leftover: &[u8],
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            writer.write_all(&frame).await?;
        }
        writer.shutdown().await
    });

    let mut parser = Parser::new(ChunkQueue::default());
    let mut buf = vec![0u8; READ_BUFFER];
    let mut pending = 0;
    if let Err(e) = parser.parse(leftover) {
        writer_task.abort();
        return Err(anyhow::Error::from(e).context("Backend sent a malformed chunk"));
    }

    let result = loop {
        if pending > 0 {
            let n = std::mem::take(&mut pending);
            if let Err(e) = parser.parse(&buf[..n]) {
                break Err(anyhow::Error::from(e).context("Backend sent a malformed chunk"));
            }
        }
        if let Err(e) = drain(tunnel, &mut parser).await {
            break Err(e);
        }

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => pending = n,
                Err(e) => break Err(anyhow::Error::from(e).context("Failed to read from backend")),
            },
            joined = &mut writer_task => {
                break match joined {
                    Ok(Err(e)) => Err(anyhow::Error::from(e).context("Failed to write to backend")),
                    _ => Err(anyhow!("Tunnel writer stopped")),
                };
            }
        }
    };

    writer_task.abort();
    result
}

async fn drain(tunnel: &Tunnel, parser: &mut Parser<ChunkQueue>) -> Result<()> {
    while let Some(chunk) = parser.sink_mut().pop() {
        dispatch(tunnel, chunk).await?;
    }
    Ok(())
}

async fn dispatch(tunnel: &Tunnel, chunk: QueuedChunk) -> Result<()> {
    let QueuedChunk { headers, data } = chunk;

    if headers.ping {
        trace!("Ping from backend {}", tunnel.remote);
        tunnel.send(format_pong()).await?;
        return Ok(());
    }
    let Some(sid) = headers.sid.as_deref() else {
        return Ok(());
    };
    if headers.noop {
        return Ok(());
    }

    let Some(events) = tunnel.stream(sid) else {
        if headers.eof.is_none() {
            debug!(sid, "Data for unknown stream, closing it");
            tunnel.send(format_eof(sid, EofFlags::BOTH)?).await?;
        }
        return Ok(());
    };

    if !data.is_empty() && events.send(StreamEvent::Data(data)).await.is_err() {
        tunnel.close_stream(sid);
        return Ok(());
    }
    if let Some(flags) = headers.eof {
        let _ = events.send(StreamEvent::Eof(flags)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KiteTable, RelayConfig};
    use pktunnel_shared::{sign_kite_request, Kite, KiteRequest};

    const KITES: &str = "- domain: a.example.com\n  secret: s3cret\n";

    fn state() -> AppState {
        let config = RelayConfig {
            port: 8080,
            kites_path: None,
            advertise: false,
        };
        AppState::new(config, KiteTable::from_yaml(KITES).unwrap()).unwrap()
    }

    fn request(secret: &str, bsalt: &str, fsalt: Option<&str>) -> String {
        let kite = Arc::new(Kite::new("http", "a.example.com", 0, "localhost", 80, secret));
        let mut req = KiteRequest::new(kite);
        req.bsalt = Some(bsalt.to_string());
        req.fsalt = fsalt.map(String::from);
        sign_kite_request(&mut req, SIGNATURE_LENGTH).unwrap()
    }

    fn head(kite_lines: &[String], replace: Option<&str>) -> RequestHead {
        let mut text = String::from("CONNECT PageKite:1 HTTP/1.0\r\nX-PageKite-Version: 0.1.0");
        if let Some(session) = replace {
            text.push_str(&format!("\r\nX-PageKite-Replace: {}", session));
        }
        for line in kite_lines {
            text.push_str(&format!("\r\nX-PageKite: {}", line));
        }
        RequestHead::parse(&text).unwrap()
    }

    fn sign_this(reply: &str) -> String {
        let value = reply
            .lines()
            .find_map(|l| l.strip_prefix("X-PageKite-SignThis: "))
            .unwrap();
        parse_kite_request(value).unwrap().fsalt.unwrap()
    }

    #[test]
    fn test_first_round_is_challenged() {
        let state = state();
        let verdict = answer(&state, &head(&[request("s3cret", "00aa", None)], None), 1_000_000).unwrap();
        assert!(verdict.reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(verdict.challenged, 1);
        assert!(verdict.flying.is_empty());
        assert!(!verdict.reply.contains("SessionID"));
        assert!(verdict.reply.contains("X-PageKite-SignThis: http:a.example.com:00aa:"));
    }

    #[test]
    fn test_signed_challenge_flies() {
        let state = state();
        let now = 1_000_000;
        let first = answer(&state, &head(&[request("s3cret", "00aa", None)], None), now).unwrap();
        let fsalt = sign_this(&first.reply);

        let second = answer(&state, &head(&[request("s3cret", "00aa", Some(&fsalt))], None), now + 5).unwrap();
        assert_eq!(second.flying, vec!["http:a.example.com".to_string()]);
        assert!(second.reply.contains("X-PageKite-OK: http:a.example.com\r\n"));
        assert!(second.reply.contains(&format!("X-PageKite-SessionID: {}\r\n", second.session_id)));

        // The same challenge is still good one window later, but not two.
        let later = now + CHALLENGE_WINDOW_SECS;
        let third = answer(&state, &head(&[request("s3cret", "00aa", Some(&fsalt))], None), later).unwrap();
        assert_eq!(third.flying.len(), 1);
        let stale = now + 2 * CHALLENGE_WINDOW_SECS;
        let fourth = answer(&state, &head(&[request("s3cret", "00aa", Some(&fsalt))], None), stale).unwrap();
        assert_eq!(fourth.challenged, 1);
    }

    #[test]
    fn test_forged_fsalt_is_challenged_again() {
        let state = state();
        let forged = "ab".repeat(18);
        let verdict = answer(&state, &head(&[request("s3cret", "00aa", Some(&forged))], None), 0).unwrap();
        assert_eq!(verdict.challenged, 1);
        assert!(verdict.flying.is_empty());
    }

    #[test]
    fn test_bad_secret_and_unknown_kite_rejected() {
        let state = state();
        let now = 1_000_000;
        let fsalt = sign_this(&answer(&state, &head(&[request("wrong", "00aa", None)], None), now).unwrap().reply);

        let verdict = answer(&state, &head(&[request("wrong", "00aa", Some(&fsalt))], None), now).unwrap();
        assert!(verdict.reply.starts_with("HTTP/1.1 503 Unavailable\r\n"));
        assert!(verdict.reply.contains("X-PageKite-Invalid: http:a.example.com\r\n"));

        let stranger = "http:b.example.com:00aa::0123456789abcdef".to_string();
        let verdict = answer(&state, &head(&[stranger], None), now).unwrap();
        assert!(verdict.reply.contains("X-PageKite-Invalid: http:b.example.com\r\n"));
    }

    #[test]
    fn test_duplicate_unless_replacing() {
        let state = state();
        let now = 1_000_000;
        let fsalt = sign_this(&answer(&state, &head(&[request("s3cret", "00aa", None)], None), now).unwrap().reply);
        let signed = vec![request("s3cret", "00aa", Some(&fsalt))];

        let (tx, _rx) = mpsc::channel(1);
        let owner = Arc::new(Tunnel::new(
            "old-session".to_string(),
            "127.0.0.1:1".parse().unwrap(),
            vec!["http:a.example.com".to_string()],
            tx,
        ));
        state.tunnels.register(owner);

        let verdict = answer(&state, &head(&signed, None), now).unwrap();
        assert!(verdict.reply.contains("X-PageKite-Duplicate: http:a.example.com\r\n"));
        assert!(verdict.flying.is_empty());

        let verdict = answer(&state, &head(&signed, Some("old-session")), now).unwrap();
        assert_eq!(verdict.flying.len(), 1);
    }
}
