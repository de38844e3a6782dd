//! Chunk header vocabulary.
//!
//! A chunk is one framed protocol message: a block of `Key: value` header
//! lines followed by payload bytes. Parsed chunks borrow everything from the
//! frame they were decoded from; [`ChunkHeaders`] is the owned counterpart
//! used when formatting.

use std::fmt;
use std::ops::BitOr;

use crate::codec::MAX_HEADER_BYTES;
use crate::error::{Error, ParseError, Result};

/// Maximum number of header lines accepted in one chunk.
pub const MAX_CHUNK_HEADERS: usize = 64;

/// Recognized header keys. Matching is case-sensitive.
pub mod keys {
    pub const SID: &str = "SID";
    pub const EOF: &str = "EOF";
    pub const NOOP: &str = "NOOP";
    pub const PING: &str = "PING";
    pub const HOST: &str = "Host";
    pub const PROTO: &str = "Proto";
    pub const PORT: &str = "Port";
    pub const RIP: &str = "RIP";
    pub const RPORT: &str = "RPort";
    pub const RTLS: &str = "RTLS";
    pub const SKB: &str = "SKB";
    pub const SPD: &str = "SPD";

    pub fn is_recognized(key: &str) -> bool {
        matches!(
            key,
            SID | EOF | NOOP | PING | HOST | PROTO | PORT | RIP | RPORT | RTLS | SKB | SPD
        )
    }
}

/// End-of-stream direction flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EofFlags(u8);

impl EofFlags {
    pub const READ: EofFlags = EofFlags(0b01);
    pub const WRITE: EofFlags = EofFlags(0b10);
    pub const BOTH: EofFlags = EofFlags(0b11);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: EofFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn has_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn has_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Decodes an `EOF:` value.
    ///
    /// The canonical form is the decimal bitmask (`1`, `2` or `3`). Older
    /// peers spell the directions as letters (`r`, `w`, `rw`), which is
    /// accepted as well.
    pub fn parse(value: &str) -> std::result::Result<Self, ParseError> {
        if value.is_empty() {
            return Err(ParseError::BadNumber(keys::EOF));
        }
        if value.bytes().all(|b| b.is_ascii_digit()) {
            return match value.parse::<u8>() {
                Ok(bits @ 1..=3) => Ok(Self(bits)),
                _ => Err(ParseError::BadNumber(keys::EOF)),
            };
        }

        let mut flags = Self::empty();
        for b in value.bytes() {
            match b {
                b'r' => flags = flags | Self::READ,
                b'w' => flags = flags | Self::WRITE,
                _ => return Err(ParseError::BadNumber(keys::EOF)),
            }
        }
        Ok(flags)
    }
}

impl BitOr for EofFlags {
    type Output = EofFlags;

    fn bitor(self, rhs: EofFlags) -> EofFlags {
        EofFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for EofFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-stream end-of-stream bookkeeping. Closed directions stay closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamEof {
    closed: EofFlags,
}

impl StreamEof {
    /// Records `flags` and returns the directions that were newly closed.
    pub fn apply(&mut self, flags: EofFlags) -> EofFlags {
        let newly = EofFlags(flags.0 & !self.closed.0);
        self.closed = self.closed | flags;
        newly
    }

    pub fn closed(&self) -> EofFlags {
        self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.contains(EofFlags::BOTH)
    }
}

/// Wire-level envelope of a parsed chunk.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Complete encoded frame, length prefix included.
    pub raw_frame: &'a [u8],
    /// Length of the header region, terminating blank line included.
    pub hdr_length: usize,
    /// Length of the payload.
    pub length: usize,
    pub data: &'a [u8],
}

impl Frame<'_> {
    pub fn raw_length(&self) -> usize {
        self.raw_frame.len()
    }
}

/// A parsed chunk. Every field borrows from the frame.
#[derive(Debug, Clone)]
pub struct Chunk<'a> {
    /// All header lines in wire order, unknown keys included.
    pub headers: Vec<&'a str>,
    pub sid: Option<&'a str>,
    pub eof: Option<EofFlags>,
    pub noop: bool,
    pub ping: bool,
    pub request_host: Option<&'a str>,
    pub request_proto: Option<&'a str>,
    pub request_port: Option<u16>,
    pub remote_ip: Option<&'a str>,
    pub remote_port: Option<u16>,
    pub remote_tls: Option<&'a str>,
    /// Kilobytes the peer has sent on this stream (flow control).
    pub remote_sent_kb: Option<u64>,
    /// Legacy rate hint, carried through untouched.
    pub throttle_spd: Option<i32>,
    pub data: &'a [u8],
    pub frame: Frame<'a>,
}

impl<'a> Chunk<'a> {
    /// Decodes the frame in `raw_frame`, whose first `prefix_len` bytes are
    /// the length prefix and its delimiter.
    pub(crate) fn decode(
        raw_frame: &'a [u8],
        prefix_len: usize,
        max_payload: usize,
    ) -> std::result::Result<Self, ParseError> {
        let body = &raw_frame[prefix_len..];

        // Header lines plus the blank line that ends them.
        let max_region = MAX_HEADER_BYTES + 2;
        let (header_text, hdr_length) = if body.starts_with(b"\r\n") {
            (&body[..0], 2)
        } else {
            let window = &body[..body.len().min(max_region)];
            match find(window, b"\r\n\r\n") {
                Some(end) => (&body[..end], end + 4),
                None if body.len() > max_region => {
                    return Err(ParseError::HeadersTooLarge(body.len(), MAX_HEADER_BYTES));
                }
                None => return Err(ParseError::MissingHeaderEnd),
            }
        };
        let header_text =
            std::str::from_utf8(header_text).map_err(|_| ParseError::MalformedHeader)?;

        let data = &body[hdr_length..];
        if data.len() > max_payload {
            return Err(ParseError::FrameTooLarge(data.len(), max_payload));
        }

        let mut chunk = Chunk {
            headers: Vec::new(),
            sid: None,
            eof: None,
            noop: false,
            ping: false,
            request_host: None,
            request_proto: None,
            request_port: None,
            remote_ip: None,
            remote_port: None,
            remote_tls: None,
            remote_sent_kb: None,
            throttle_spd: None,
            data,
            frame: Frame {
                raw_frame,
                hdr_length,
                length: data.len(),
                data,
            },
        };

        if !header_text.is_empty() {
            for line in header_text.split("\r\n") {
                if chunk.headers.len() == MAX_CHUNK_HEADERS {
                    return Err(ParseError::TooManyHeaders(MAX_CHUNK_HEADERS));
                }
                chunk.headers.push(line);
                chunk.apply_header(line)?;
            }
        }

        if chunk.sid.is_none() && !chunk.is_control() {
            return Err(ParseError::MissingSid);
        }
        Ok(chunk)
    }

    fn apply_header(&mut self, line: &'a str) -> std::result::Result<(), ParseError> {
        let (key, value) = split_header(line).ok_or(ParseError::MalformedHeader)?;
        match key {
            keys::SID => self.sid = Some(value),
            keys::EOF => self.eof = Some(EofFlags::parse(value)?),
            keys::NOOP => self.noop = true,
            keys::PING => self.ping = true,
            keys::HOST => self.request_host = Some(value),
            keys::PROTO => self.request_proto = Some(value),
            keys::PORT => self.request_port = Some(parse_number(value, keys::PORT)?),
            keys::RIP => self.remote_ip = Some(value),
            keys::RPORT => self.remote_port = Some(parse_number(value, keys::RPORT)?),
            keys::RTLS => self.remote_tls = Some(value),
            keys::SKB => self.remote_sent_kb = Some(parse_number(value, keys::SKB)?),
            keys::SPD => self.throttle_spd = Some(parse_number(value, keys::SPD)?),
            _ => {}
        }
        Ok(())
    }

    /// Control chunks may omit the SID.
    pub fn is_control(&self) -> bool {
        self.noop || self.ping || self.eof.is_some()
    }

    /// True when this chunk opens a new stream on the backend.
    pub fn is_new_stream(&self) -> bool {
        self.sid.is_some() && (self.request_host.is_some() || self.request_proto.is_some())
    }

    /// Looks up the value of a header, recognized or not. First match wins.
    pub fn header(&self, key: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .copied()
            .filter_map(split_header)
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Owned header set used when formatting a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkHeaders {
    pub sid: Option<String>,
    pub eof: Option<EofFlags>,
    pub noop: bool,
    pub ping: bool,
    pub request_host: Option<String>,
    pub request_proto: Option<String>,
    pub request_port: Option<u16>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub remote_tls: Option<String>,
    pub remote_sent_kb: Option<u64>,
    pub throttle_spd: Option<i32>,
    /// Extra headers appended verbatim after the recognized ones.
    pub extra: Vec<(String, String)>,
}

impl ChunkHeaders {
    pub fn stream(sid: impl Into<String>) -> Self {
        Self {
            sid: Some(sid.into()),
            ..Default::default()
        }
    }

    pub fn with_eof(mut self, flags: EofFlags) -> Self {
        self.eof = Some(flags);
        self
    }

    pub fn with_request(mut self, proto: &str, host: &str, port: u16) -> Self {
        self.request_proto = Some(proto.to_string());
        self.request_host = Some(host.to_string());
        self.request_port = Some(port);
        self
    }

    pub fn with_remote(mut self, ip: &str, port: u16, tls: bool) -> Self {
        self.remote_ip = Some(ip.to_string());
        self.remote_port = Some(port);
        if tls {
            self.remote_tls = Some("1".to_string());
        }
        self
    }

    pub fn with_sent_kb(mut self, kb: u64) -> Self {
        self.remote_sent_kb = Some(kb);
        self
    }

    /// Renders the header block, one CRLF-terminated line per header.
    pub fn to_block(&self) -> Result<String> {
        let mut lines: Vec<(&str, String)> = Vec::new();
        if let Some(sid) = &self.sid {
            lines.push((keys::SID, sid.clone()));
        }
        if let Some(eof) = self.eof {
            lines.push((keys::EOF, eof.to_string()));
        }
        if self.noop {
            lines.push((keys::NOOP, "1".to_string()));
        }
        if self.ping {
            lines.push((keys::PING, "1".to_string()));
        }
        if let Some(host) = &self.request_host {
            lines.push((keys::HOST, host.clone()));
        }
        if let Some(proto) = &self.request_proto {
            lines.push((keys::PROTO, proto.clone()));
        }
        if let Some(port) = self.request_port {
            lines.push((keys::PORT, port.to_string()));
        }
        if let Some(ip) = &self.remote_ip {
            lines.push((keys::RIP, ip.clone()));
        }
        if let Some(port) = self.remote_port {
            lines.push((keys::RPORT, port.to_string()));
        }
        if let Some(tls) = &self.remote_tls {
            lines.push((keys::RTLS, tls.clone()));
        }
        if let Some(kb) = self.remote_sent_kb {
            lines.push((keys::SKB, kb.to_string()));
        }
        if let Some(spd) = self.throttle_spd {
            lines.push((keys::SPD, spd.to_string()));
        }
        for (k, v) in &self.extra {
            lines.push((k.as_str(), v.clone()));
        }

        if lines.len() > MAX_CHUNK_HEADERS {
            return Err(Error::Capacity(format!(
                "{} headers exceed the limit of {}",
                lines.len(),
                MAX_CHUNK_HEADERS
            )));
        }

        let mut block = String::new();
        for (key, value) in lines {
            push_header(&mut block, key, &value)?;
        }
        Ok(block)
    }
}

impl From<&Chunk<'_>> for ChunkHeaders {
    /// Copies every header, recognized or not, out of the frame.
    fn from(chunk: &Chunk<'_>) -> Self {
        let extra = chunk
            .headers
            .iter()
            .copied()
            .filter_map(split_header)
            .filter(|(key, _)| !keys::is_recognized(key))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        ChunkHeaders {
            sid: chunk.sid.map(String::from),
            eof: chunk.eof,
            noop: chunk.noop,
            ping: chunk.ping,
            request_host: chunk.request_host.map(String::from),
            request_proto: chunk.request_proto.map(String::from),
            request_port: chunk.request_port,
            remote_ip: chunk.remote_ip.map(String::from),
            remote_port: chunk.remote_port,
            remote_tls: chunk.remote_tls.map(String::from),
            remote_sent_kb: chunk.remote_sent_kb,
            throttle_spd: chunk.throttle_spd,
            extra,
        }
    }
}

/// Appends `key: value\r\n`, refusing anything that would break the line
/// structure of the header block.
pub(crate) fn push_header(block: &mut String, key: &str, value: &str) -> Result<()> {
    let bad_key = key.is_empty() || key.contains(|c: char| c == ':' || c.is_control());
    if bad_key || value.contains(['\r', '\n']) {
        return Err(Error::Protocol(format!("unencodable header {:?}", key)));
    }
    block.push_str(key);
    block.push_str(": ");
    block.push_str(value);
    block.push_str("\r\n");
    Ok(())
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim_start_matches(' ')))
}

/// Strict integer parsing: digits only (plus a leading '-' for signed
/// fields), no whitespace, no '+', no overflow.
fn parse_number<T: std::str::FromStr>(
    value: &str,
    key: &'static str,
) -> std::result::Result<T, ParseError> {
    let digits = value.strip_prefix('-').unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::BadNumber(key));
    }
    value.parse().map_err(|_| ParseError::BadNumber(key))
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
