//! Client side of the tunnel handshake.
//!
//! The backend opens a connection to a frontend, sends a CONNECT-style
//! request listing the kites it wants to fly, and reads an HTTP-like reply
//! that tells it which kites are up. No chunk parsing happens here: once the
//! reply head is consumed, the stream and any bytes read past the head go
//! back to the caller for the tunnel's lifetime.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info, warn};

use crate::chunk::find;
use crate::codec::{PK_FRONTEND_PING, PK_FRONTEND_PONG};
use crate::error::{Error, Result};
use crate::kite::{make_bsalt, sign_kite_request, KiteRequest, KiteStatus, SIGNATURE_LENGTH};
use crate::request::parse_kite_request;

pub const PK_HANDSHAKE_CONNECT: &str = "CONNECT PageKite:1 HTTP/1.0\r\n";
pub const PK_HANDSHAKE_END: &str = "\r\n";
pub const PK_HANDSHAKE_SESSIONID_MAX: usize = 256;

/// Largest response head accepted from a frontend.
pub const MAX_RESPONSE_HEAD: usize = 16 * 1024;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Response and request header names used during the handshake.
pub mod headers {
    pub const VERSION: &str = "X-PageKite-Version";
    pub const FEATURES: &str = "X-PageKite-Features";
    pub const REPLACE: &str = "X-PageKite-Replace";
    pub const KITE: &str = "X-PageKite";
    pub const OK: &str = "X-PageKite-OK";
    pub const INVALID: &str = "X-PageKite-Invalid";
    pub const DUPLICATE: &str = "X-PageKite-Duplicate";
    pub const REJECTED: &str = "X-PageKite-Rejected";
    pub const SIGN_THIS: &str = "X-PageKite-SignThis";
    pub const SESSION_ID: &str = "X-PageKite-SessionID";
}

/// Opens transport connections. The handshake never builds one itself.
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, addr: SocketAddr) -> impl Future<Output = io::Result<TcpStream>> + Send {
        TcpStream::connect(addr)
    }
}

/// TLS over TCP, using a caller-supplied rustls configuration.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsConnector {
    pub fn new(inner: tokio_rustls::TlsConnector, server_name: ServerName<'static>) -> Self {
        Self { inner, server_name }
    }
}

impl Connector for TlsConnector {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    fn connect(&self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        let inner = self.inner.clone();
        let server_name = self.server_name.clone();
        async move {
            let tcp = TcpStream::connect(addr).await?;
            inner.connect(server_name, tcp).await
        }
    }
}

/// Handshake progress, reported through tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Resolving,
    Connecting,
    Sending,
    AwaitingResponse,
    Flying,
    Rejected,
    Unknown,
}

/// Overall result across all requested kites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// At least one kite is up.
    Flying,
    /// The frontend explicitly refused every kite.
    Rejected,
    /// Nothing flew and nothing was refused, e.g. a sign-this challenge.
    Unknown,
}

/// A completed handshake.
pub struct Handshake<S> {
    pub stream: S,
    pub peer: SocketAddr,
    pub outcome: HandshakeOutcome,
    pub session_id: Option<String>,
    /// Tunnel bytes that arrived together with the response head.
    pub leftover: Vec<u8>,
}

/// Parsed frontend reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub status_code: u16,
    pub session_id: Option<String>,
    pub challenged: usize,
}

/// Builds the full request: request line, version and optional feature
/// and replace headers, one signed kite header per request, blank line.
///
/// Requests without a backend salt get one first.
pub fn build_request(
    kites: &mut [KiteRequest],
    session: Option<&str>,
    features: &[&str],
) -> Result<String> {
    let mut request = String::from(PK_HANDSHAKE_CONNECT);
    request.push_str(&format!("{}: {}\r\n", headers::VERSION, VERSION));
    if !features.is_empty() {
        request.push_str(&format!("{}: {}\r\n", headers::FEATURES, features.join(", ")));
    }

    if let Some(session) = session {
        if session.len() > PK_HANDSHAKE_SESSIONID_MAX {
            return Err(Error::Capacity(format!(
                "session id of {} bytes exceeds {}",
                session.len(),
                PK_HANDSHAKE_SESSIONID_MAX
            )));
        }
        if session.is_empty() || session.contains(|c: char| c.is_control()) {
            return Err(Error::Protocol("unusable session id".into()));
        }
        request.push_str(&format!("{}: {}\r\n", headers::REPLACE, session));
    }

    for kite in kites.iter_mut() {
        if kite.bsalt.is_none() {
            make_bsalt(kite)?;
        }
        let value = sign_kite_request(kite, SIGNATURE_LENGTH)?;
        request.push_str(&format!("{}: {}\r\n", headers::KITE, value));
    }

    request.push_str(PK_HANDSHAKE_END);
    Ok(request)
}

/// Classifies a frontend reply head and updates each request's status.
///
/// 2xx: kites confirmed with `X-PageKite-OK` fly, explicitly refused ones
/// are rejected, challenged ones pick up their frontend salt.
/// 503: every kite that did not fly is rejected.
/// Anything else is an error and leaves every kite `Unknown`.
pub fn classify_response(head: &str, kites: &mut [KiteRequest]) -> Result<HandshakeReply> {
    let mut lines = head.split("\r\n");
    let status_code = parse_status_line(lines.next().unwrap_or(""))?;
    if !(200..300).contains(&status_code) && status_code != 503 {
        return Err(Error::Protocol(format!("unexpected status {}", status_code)));
    }

    let mut reply = HandshakeReply {
        status_code,
        session_id: None,
        challenged: 0,
    };
    let mut statuses = vec![KiteStatus::Unknown; kites.len()];
    // Nothing touches the requests until the whole head has parsed.
    let mut challenges = Vec::new();

    for line in lines.filter(|l| !l.is_empty()) {
        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::Protocol("malformed response header".into()));
        };
        let value = value.trim();
        match key {
            headers::OK if status_code != 503 => {
                mark(kites, &mut statuses, value, KiteStatus::Flying);
            }
            headers::INVALID | headers::DUPLICATE | headers::REJECTED => {
                mark(kites, &mut statuses, value, KiteStatus::Rejected);
            }
            headers::SIGN_THIS => match parse_kite_request(value) {
                Ok(challenge) => challenges.push(challenge),
                Err(e) => warn!("Ignoring malformed challenge {:?}: {}", value, e),
            },
            headers::SESSION_ID => {
                if value.len() <= PK_HANDSHAKE_SESSIONID_MAX {
                    reply.session_id = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    if status_code == 503 {
        for status in statuses.iter_mut() {
            if *status != KiteStatus::Flying {
                *status = KiteStatus::Rejected;
            }
        }
    }

    for challenge in &challenges {
        for kite in kites.iter_mut() {
            if kite.apply_challenge(challenge) {
                reply.challenged += 1;
            }
        }
    }
    for (kite, status) in kites.iter_mut().zip(statuses) {
        kite.status = status;
    }
    Ok(reply)
}

fn mark(kites: &[KiteRequest], statuses: &mut [KiteStatus], value: &str, status: KiteStatus) {
    let name = reply_kite_name(value);
    for (kite, slot) in kites.iter().zip(statuses.iter_mut()) {
        if kite.kite.name() == name && *slot != KiteStatus::Rejected {
            *slot = status;
        }
    }
}

/// Frontends echo `proto[-port]:domain`, sometimes followed by salts.
fn reply_kite_name(value: &str) -> &str {
    match value.match_indices(':').nth(1) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") || code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Protocol(format!("malformed status line {:?}", line)));
    }
    code.parse()
        .map_err(|_| Error::Protocol(format!("malformed status line {:?}", line)))
}

/// Reads up to and including the blank line ending the response head.
async fn read_response_head<S>(stream: &mut S) -> Result<(String, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 1024];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let leftover = buf.split_off(end + 4);
            let head = String::from_utf8(buf)
                .map_err(|_| Error::Protocol("response head is not UTF-8".into()))?;
            return Ok((head, leftover));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Protocol("response head too large".into()));
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed during handshake".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Resolves `host` and runs the handshake against each address in turn.
pub async fn connect<C: Connector>(
    connector: &C,
    host: &str,
    port: u16,
    kites: &mut [KiteRequest],
    session: Option<&str>,
) -> Result<Handshake<C::Stream>> {
    debug!(state = ?HandshakeState::Resolving, "Resolving {}:{}", host, port);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Connect(format!("failed to resolve {}: {}", host, e)))?
        .collect();

    connect_addrs(connector, &addrs, kites, session).await
}

/// Runs the handshake against the first address that accepts a connection.
///
/// Transport failures surface as `Error::Connect` or `Error::Io` with every
/// kite left `Unknown`; an explicit refusal is an `Ok` handshake whose
/// kites are `Rejected`.
pub async fn connect_addrs<C: Connector>(
    connector: &C,
    addrs: &[SocketAddr],
    kites: &mut [KiteRequest],
    session: Option<&str>,
) -> Result<Handshake<C::Stream>> {
    for kite in kites.iter_mut() {
        kite.status = KiteStatus::Unknown;
    }
    let request = build_request(kites, session, &[])?;

    let mut connected = None;
    for addr in addrs {
        debug!(state = ?HandshakeState::Connecting, "Connecting to {}", addr);
        match connector.connect(*addr).await {
            Ok(stream) => {
                connected = Some((stream, *addr));
                break;
            }
            Err(e) => warn!("Connect to {} failed: {}", addr, e),
        }
    }
    let (mut stream, peer) = connected.ok_or_else(|| {
        Error::Connect(format!("no reachable frontend among {} address(es)", addrs.len()))
    })?;

    debug!(state = ?HandshakeState::Sending, "Sending {} kite request(s) to {}", kites.len(), peer);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    debug!(state = ?HandshakeState::AwaitingResponse, "Waiting for {}", peer);
    let (head, leftover) = read_response_head(&mut stream).await?;
    let reply = classify_response(&head, kites)?;

    let outcome = if kites.iter().any(|k| k.status == KiteStatus::Flying) {
        HandshakeOutcome::Flying
    } else if !kites.is_empty() && kites.iter().all(|k| k.status == KiteStatus::Rejected) {
        HandshakeOutcome::Rejected
    } else {
        HandshakeOutcome::Unknown
    };

    for kite in kites.iter() {
        let state = match kite.status {
            KiteStatus::Flying => HandshakeState::Flying,
            KiteStatus::Rejected => HandshakeState::Rejected,
            KiteStatus::Unknown => HandshakeState::Unknown,
        };
        info!(state = ?state, "Kite {} via {}", kite.kite.name(), peer);
    }

    Ok(Handshake {
        stream,
        peer,
        outcome,
        session_id: reply.session_id,
        leftover,
    })
}

/// Measures how long a frontend takes to answer the liveness check.
pub async fn ping_frontend<C: Connector>(connector: &C, addr: SocketAddr) -> Result<Duration> {
    let started = Instant::now();
    let mut stream = connector
        .connect(addr)
        .await
        .map_err(|e| Error::Connect(format!("{}: {}", addr, e)))?;
    stream.write_all(PK_FRONTEND_PING.as_bytes()).await?;
    stream.flush().await?;

    let mut reply = vec![0u8; PK_FRONTEND_PONG.len()];
    stream.read_exact(&mut reply).await?;
    if reply != PK_FRONTEND_PONG.as_bytes() {
        return Err(Error::Protocol(format!("{} did not answer the ping", addr)));
    }
    Ok(started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kite::Kite;
    use std::sync::Arc;

    fn requests() -> Vec<KiteRequest> {
        let a = Arc::new(Kite::new("http", "a.example.com", 0, "localhost", 80, "sa"));
        let b = Arc::new(Kite::new("raw", "b.example.com", 22, "localhost", 22, "sb"));
        let mut reqs = vec![KiteRequest::new(a), KiteRequest::new(b)];
        reqs[0].bsalt = Some("00aa".into());
        reqs[1].bsalt = Some("00bb".into());
        reqs
    }

    #[test]
    fn test_build_request() {
        let mut kites = requests();
        let request = build_request(&mut kites, Some("sess-1"), &["Mobile"]).unwrap();
        let lines: Vec<&str> = request.split("\r\n").collect();
        assert_eq!(lines[0], "CONNECT PageKite:1 HTTP/1.0");
        assert_eq!(lines[1], format!("X-PageKite-Version: {}", VERSION));
        assert_eq!(lines[2], "X-PageKite-Features: Mobile");
        assert_eq!(lines[3], "X-PageKite-Replace: sess-1");
        assert!(lines[4].starts_with("X-PageKite: http:a.example.com:00aa::"));
        assert!(lines[5].starts_with("X-PageKite: raw-22:b.example.com:00bb::"));
        assert!(request.ends_with("\r\n\r\n"));
        assert!(!request.contains("sa\r\n") && !request.contains(":sb"));
        assert!(kites.iter().all(|k| k.signature.is_some()));
    }

    #[test]
    fn test_build_request_session_cap() {
        let mut kites = requests();
        let long = "x".repeat(PK_HANDSHAKE_SESSIONID_MAX + 1);
        assert!(matches!(
            build_request(&mut kites, Some(&long), &[]),
            Err(Error::Capacity(_))
        ));
        assert!(build_request(&mut kites, Some("a\r\nX-Evil: 1"), &[]).is_err());
    }

    #[test]
    fn test_build_request_makes_missing_salts() {
        let mut kites = requests();
        kites[1].bsalt = None;
        build_request(&mut kites, None, &[]).unwrap();
        assert!(kites[1].bsalt.is_some());
    }

    #[test]
    fn test_classify_flying() {
        let mut kites = requests();
        let head = "HTTP/1.1 200 OK\r\nX-PageKite-OK: http:a.example.com\r\n\
                    X-PageKite-SessionID: abc123\r\n\r\n";
        let reply = classify_response(head, &mut kites).unwrap();
        assert_eq!(reply.session_id.as_deref(), Some("abc123"));
        assert_eq!(kites[0].status, KiteStatus::Flying);
        assert_eq!(kites[1].status, KiteStatus::Unknown);
    }

    #[test]
    fn test_classify_explicit_rejections() {
        let mut kites = requests();
        let head = "HTTP/1.1 200 OK\r\nX-PageKite-OK: http:a.example.com\r\n\
                    X-PageKite-Invalid: raw-22:b.example.com\r\n\r\n";
        classify_response(head, &mut kites).unwrap();
        assert_eq!(kites[0].status, KiteStatus::Flying);
        assert_eq!(kites[1].status, KiteStatus::Rejected);

        let mut kites = requests();
        classify_response("HTTP/1.1 503 Unavailable\r\n\r\n", &mut kites).unwrap();
        assert!(kites.iter().all(|k| k.status == KiteStatus::Rejected));
    }

    #[test]
    fn test_classify_challenge() {
        let mut kites = requests();
        let head = "HTTP/1.1 200 OK\r\nX-PageKite-SignThis: http:a.example.com:00aa:ff11\r\n\r\n";
        let reply = classify_response(head, &mut kites).unwrap();
        assert_eq!(reply.challenged, 1);
        assert_eq!(kites[0].fsalt.as_deref(), Some("ff11"));
        assert_eq!(kites[0].status, KiteStatus::Unknown);
        assert_eq!(kites[1].fsalt, None);
    }

    #[test]
    fn test_classify_error_leaves_requests_untouched() {
        let mut kites = requests();
        for kite in kites.iter_mut() {
            kite.signature = Some("0123456789abcdef".into());
        }
        let head = "HTTP/1.1 200 OK\r\nX-PageKite-SignThis: http:a.example.com:00aa:ff11\r\n\
                    garbage\r\n\r\n";
        assert!(matches!(classify_response(head, &mut kites), Err(Error::Protocol(_))));
        assert_eq!(kites[0].fsalt, None);
        assert_eq!(kites[0].signature.as_deref(), Some("0123456789abcdef"));
        assert_eq!(kites[0].status, KiteStatus::Unknown);
    }

    #[test]
    fn test_classify_unexpected() {
        for head in ["HTTP/1.1 404 Not Found\r\n\r\n", "garbage\r\n\r\n", "HTTP/1.1 2000 OK\r\n\r\n"] {
            let mut kites = requests();
            assert!(matches!(classify_response(head, &mut kites), Err(Error::Protocol(_))));
            assert!(kites.iter().all(|k| k.status == KiteStatus::Unknown));
        }
    }

    #[test]
    fn test_reply_kite_name() {
        assert_eq!(reply_kite_name("http:a.example.com"), "http:a.example.com");
        assert_eq!(reply_kite_name("http:a.example.com:00aa:ff"), "http:a.example.com");
    }
}
