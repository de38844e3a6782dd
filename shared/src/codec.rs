//! Frame codec.
//!
//! Wire format of one frame:
//!
//! ```text
//! <hex length>\r\n<header lines>\r\n<payload>
//! ```
//!
//! The length is lowercase hexadecimal, at most [`MAX_LENGTH_DIGITS`] digits,
//! and covers the header lines, the blank line and the payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::{keys, push_header, ChunkHeaders, EofFlags};
use crate::error::{Error, Result};

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Largest header block, not counting the blank line that ends it, in either
/// direction.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Maximum number of hex digits in a length prefix.
pub const MAX_LENGTH_DIGITS: usize = 8;

/// High estimate of framing overhead per kilobyte of relayed data.
///
/// `12345678\r\nSID: 123456789\r\n\r\n` is 30 bytes, doubled for slack.
pub const PROTO_OVERHEAD_PER_KB: usize = 64;

/// Liveness check sent to a frontend over a fresh connection.
pub const PK_FRONTEND_PING: &str = "GET /ping HTTP/1.1\r\nHost: ping.pagekite\r\n\r\n";

/// Prefix of a frontend's answer to [`PK_FRONTEND_PING`].
pub const PK_FRONTEND_PONG: &str = "HTTP/1.1 503 Unavailable";

const PONG_HEADERS: &str = "NOOP: 1\r\n";
const PING_HEADERS: &str = "NOOP: 1\r\nPING: 1\r\n";
const KEEPALIVE_BODY: &[u8] = b"!";

/// Emits a frame around a header block and payload.
///
/// `headers` is either empty or a sequence of CRLF-terminated lines.
pub fn format_frame(headers: &str, data: &[u8]) -> Result<Bytes> {
    if data.len() > MAX_FRAME_PAYLOAD {
        return Err(Error::Capacity(format!(
            "payload of {} bytes exceeds {}",
            data.len(),
            MAX_FRAME_PAYLOAD
        )));
    }
    if !headers.is_empty() && !headers.ends_with("\r\n") {
        return Err(Error::Capacity("header block is not CRLF-terminated".into()));
    }
    if headers.len() > MAX_HEADER_BYTES {
        return Err(Error::Capacity(format!(
            "header block of {} bytes exceeds {}",
            headers.len(),
            MAX_HEADER_BYTES
        )));
    }

    let body_len = headers.len() + 2 + data.len();
    let prefix = format!("{:x}\r\n", body_len);

    let mut buf = BytesMut::with_capacity(prefix.len() + body_len);
    buf.put_slice(prefix.as_bytes());
    buf.put_slice(headers.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Emits a chunk from a typed header set.
pub fn format_chunk(headers: &ChunkHeaders, data: &[u8]) -> Result<Bytes> {
    format_frame(&headers.to_block()?, data)
}

/// Emits an ordinary data chunk for stream `sid`.
pub fn format_reply(sid: &str, data: &[u8]) -> Result<Bytes> {
    let mut headers = String::with_capacity(sid.len() + 7);
    push_header(&mut headers, keys::SID, sid)?;
    format_frame(&headers, data)
}

/// Exact encoded size of `format_reply(sid, data)` for `data.len() == length`.
pub fn reply_overhead(sid: &str, length: usize) -> usize {
    // "SID: " + sid + "\r\n" + "\r\n" + payload
    let body_len = keys::SID.len() + 2 + sid.len() + 2 + 2 + length;
    hex_digits(body_len) + 2 + body_len
}

/// Emits a chunk announcing that `flags` directions of `sid` are closed.
pub fn format_eof(sid: &str, flags: EofFlags) -> Result<Bytes> {
    if flags.is_empty() {
        return Err(Error::Protocol("EOF chunk without directions".into()));
    }
    format_chunk(&ChunkHeaders::stream(sid).with_eof(flags), &[])
}

/// The fixed keepalive response chunk.
pub fn format_pong() -> Bytes {
    keepalive(PONG_HEADERS)
}

/// The fixed keepalive request chunk.
pub fn format_ping() -> Bytes {
    keepalive(PING_HEADERS)
}

fn keepalive(headers: &str) -> Bytes {
    let body_len = headers.len() + 2 + KEEPALIVE_BODY.len();
    let mut buf = BytesMut::with_capacity(body_len + 4);
    buf.put_slice(format!("{:x}\r\n", body_len).as_bytes());
    buf.put_slice(headers.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(KEEPALIVE_BODY);
    buf.freeze()
}

fn hex_digits(value: usize) -> usize {
    if value == 0 {
        1
    } else {
        (usize::BITS - value.leading_zeros()).div_ceil(4) as usize
    }
}
