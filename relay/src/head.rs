//! First-request sniffing.
//!
//! Every inbound connection starts with either an HTTP request head or a
//! TLS ClientHello. The head decides whether the peer is a backend asking
//! for a tunnel, a liveness check, or a public visitor.

use anyhow::{Context, Result};
use bytes::BytesMut;
use pktunnel_shared::handshake::PK_HANDSHAKE_CONNECT;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::tls;

/// Largest head (or first TLS record) read before routing.
pub const MAX_HEAD: usize = 16 * 1024 + 5;

pub enum FirstRequest {
    Http { head: RequestHead, head_len: usize },
    Tls { server_name: Option<String> },
}

/// Parsed HTTP request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.split("\r\n");
        let mut request_line = lines.next()?.split(' ');
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();
        let version = request_line.next()?.to_string();
        if method.is_empty() || !version.starts_with("HTTP/") || request_line.next().is_some() {
            return None;
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (key, value) = line.split_once(':')?;
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }

        Some(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.headers_named(name).next()
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_tunnel_connect(&self) -> bool {
        PK_HANDSHAKE_CONNECT.starts_with(&format!("{} {} ", self.method, self.target))
    }

    pub fn is_ping(&self) -> bool {
        self.method == "GET"
            && self.target == "/ping"
            && self.header("Host").map_or(false, |h| h.eq_ignore_ascii_case("ping.pagekite"))
    }

    /// Domain and port from the Host header; `default_port` when it has none.
    pub fn host(&self, default_port: u16) -> Option<(String, u16)> {
        let host = self.header("Host")?;
        let (domain, port) = if let Some(rest) = host.strip_prefix('[') {
            let (addr, tail) = rest.split_once(']')?;
            match tail.strip_prefix(':') {
                Some(port) => (addr, port.parse().ok()?),
                None if tail.is_empty() => (addr, default_port),
                None => return None,
            }
        } else {
            match host.rsplit_once(':') {
                Some((domain, port)) => (domain, port.parse().ok()?),
                None => (host, default_port),
            }
        };
        if domain.is_empty() {
            return None;
        }
        Some((domain.to_ascii_lowercase(), port))
    }
}

/// Reads until a complete HTTP head or first TLS record is buffered.
/// Everything read stays in `buf`.
pub async fn read_first_request<S>(stream: &mut S, buf: &mut BytesMut) -> Result<FirstRequest>
where
    S: AsyncRead + Unpin,
{
    loop {
        if tls::looks_like_tls(buf) {
            if let Some(len) = tls::record_len(buf) {
                if buf.len() >= len || len > MAX_HEAD {
                    return Ok(FirstRequest::Tls {
                        server_name: tls::extract_sni(buf),
                    });
                }
            }
        } else if let Some(end) = find_head_end(buf) {
            let text = std::str::from_utf8(&buf[..end]).context("Request head is not UTF-8")?;
            let head = RequestHead::parse(text).context("Malformed request head")?;
            return Ok(FirstRequest::Http {
                head,
                head_len: end + 4,
            });
        }

        if buf.len() >= MAX_HEAD {
            anyhow::bail!("Request head exceeds {} bytes", MAX_HEAD);
        }
        if stream.read_buf(buf).await? == 0 {
            anyhow::bail!("Connection closed before a complete request");
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
