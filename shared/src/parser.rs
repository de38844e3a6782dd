//! Incremental chunk parser.
//!
//! Bytes arrive in whatever pieces the transport hands out. The parser
//! buffers them in a single `BytesMut` and runs a two-state machine:
//!
//! - `AwaitingFrameHeader`: collecting the hex length prefix and its CRLF
//! - `AwaitingPayload`: prefix known, waiting for the rest of the frame
//!
//! Every completed frame is decoded into a [`Chunk`] and handed to the
//! [`ChunkSink`] before the next frame is looked at.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::chunk::{find, Chunk, ChunkHeaders};
use crate::codec::{MAX_FRAME_PAYLOAD, MAX_HEADER_BYTES, MAX_LENGTH_DIGITS};
use crate::error::ParseError;

/// Receives each chunk as soon as it is complete.
///
/// The chunk borrows the parser's buffer and is only valid for the duration
/// of the call; copy out whatever must outlive it.
pub trait ChunkSink {
    fn on_chunk(&mut self, chunk: &Chunk<'_>);
}

impl<F> ChunkSink for F
where
    F: FnMut(&Chunk<'_>),
{
    fn on_chunk(&mut self, chunk: &Chunk<'_>) {
        self(chunk)
    }
}

/// A chunk copied out of the parser buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedChunk {
    pub headers: ChunkHeaders,
    pub data: Bytes,
}

/// Sink that queues owned copies, for connection loops that need to await
/// while handling each chunk.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    queue: VecDeque<QueuedChunk>,
}

impl ChunkQueue {
    pub fn pop(&mut self) -> Option<QueuedChunk> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl ChunkSink for ChunkQueue {
    fn on_chunk(&mut self, chunk: &Chunk<'_>) {
        self.queue.push_back(QueuedChunk {
            headers: ChunkHeaders::from(chunk),
            data: Bytes::copy_from_slice(chunk.data),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingFrameHeader,
    AwaitingPayload { prefix_len: usize, frame_len: usize },
}

/// One parser per physical connection.
pub struct Parser<S> {
    buffer: BytesMut,
    state: State,
    max_payload: usize,
    sink: S,
}

impl<S: ChunkSink> Parser<S> {
    pub fn new(sink: S) -> Self {
        Self::with_max_payload(sink, MAX_FRAME_PAYLOAD)
    }

    pub fn with_max_payload(sink: S, max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::AwaitingFrameHeader,
            max_payload,
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Bytes still needed to finish the frame in progress, or 0 when the
    /// length prefix has not been seen yet.
    pub fn bytes_left(&self) -> usize {
        match self.state {
            State::AwaitingFrameHeader => 0,
            State::AwaitingPayload {
                prefix_len,
                frame_len,
            } => (prefix_len + frame_len).saturating_sub(self.buffer.len()),
        }
    }

    /// Consumes `input`, emitting every chunk it completes.
    ///
    /// Returns the number of bytes consumed, which is always all of them.
    /// Any error is fatal for the connection; the parser has already been
    /// reset when it is returned.
    pub fn parse(&mut self, input: &[u8]) -> Result<usize, ParseError> {
        self.buffer.extend_from_slice(input);

        loop {
            match self.step() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    debug!("Dropping connection state after parse error: {}", e);
                    self.reset();
                    return Err(e);
                }
            }
        }

        Ok(input.len())
    }

    /// Discards any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingFrameHeader;
    }

    /// Advances the state machine once. `Ok(false)` means more input is needed.
    fn step(&mut self) -> Result<bool, ParseError> {
        match self.state {
            State::AwaitingFrameHeader => {
                let window = &self.buffer[..self.buffer.len().min(MAX_LENGTH_DIGITS + 2)];
                let Some(pos) = find(window, b"\r\n") else {
                    let bad_byte = window
                        .iter()
                        .enumerate()
                        .any(|(i, &b)| !(b.is_ascii_hexdigit() || (b == b'\r' && i + 1 == window.len())));
                    if bad_byte || window.len() == MAX_LENGTH_DIGITS + 2 {
                        return Err(ParseError::BadLengthPrefix);
                    }
                    return Ok(false);
                };

                let frame_len = parse_length_prefix(&window[..pos])?;
                let limit = self.max_payload.saturating_add(MAX_HEADER_BYTES + 2);
                if frame_len > limit {
                    return Err(ParseError::FrameTooLarge(frame_len, limit));
                }

                trace!("Frame header: {} bytes follow", frame_len);
                self.state = State::AwaitingPayload {
                    prefix_len: pos + 2,
                    frame_len,
                };
                Ok(true)
            }
            State::AwaitingPayload {
                prefix_len,
                frame_len,
            } => {
                let total = prefix_len + frame_len;
                if self.buffer.len() < total {
                    return Ok(false);
                }

                let chunk = Chunk::decode(&self.buffer[..total], prefix_len, self.max_payload)?;
                self.sink.on_chunk(&chunk);

                self.buffer.advance(total);
                self.state = State::AwaitingFrameHeader;
                Ok(true)
            }
        }
    }
}

fn parse_length_prefix(digits: &[u8]) -> Result<usize, ParseError> {
    if digits.is_empty()
        || digits.len() > MAX_LENGTH_DIGITS
        || !digits.iter().all(|b| b.is_ascii_hexdigit())
    {
        return Err(ParseError::BadLengthPrefix);
    }
    let text = std::str::from_utf8(digits).map_err(|_| ParseError::BadLengthPrefix)?;
    usize::from_str_radix(text, 16).map_err(|_| ParseError::BadLengthPrefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkHeaders, EofFlags, MAX_CHUNK_HEADERS};
    use crate::codec::{format_chunk, format_eof, format_frame, format_ping, format_reply};

    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        sid: Option<String>,
        eof: Option<EofFlags>,
        ping: bool,
        host: Option<String>,
        data: Vec<u8>,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Seen>,
    }

    impl ChunkSink for Recorder {
        fn on_chunk(&mut self, chunk: &Chunk<'_>) {
            self.seen.push(Seen {
                sid: chunk.sid.map(String::from),
                eof: chunk.eof,
                ping: chunk.ping,
                host: chunk.request_host.map(String::from),
                data: chunk.data.to_vec(),
            });
        }
    }

    fn two_chunks() -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(
            &format_frame(
                "SID: 1\r\nHost: example.com\r\nProto: http\r\nPort: 80\r\n",
                b"hello",
            )
            .unwrap(),
        );
        wire.extend_from_slice(&format_frame("SID: 1\r\nEOF: 1\r\n", b"").unwrap());
        wire
    }

    #[test]
    fn test_two_chunk_scenario() {
        let mut parser = Parser::new(Recorder::default());
        let wire = two_chunks();
        assert_eq!(parser.parse(&wire).unwrap(), wire.len());

        let seen = &parser.sink().seen;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].sid.as_deref(), Some("1"));
        assert_eq!(seen[0].host.as_deref(), Some("example.com"));
        assert_eq!(seen[0].data, b"hello");
        assert_eq!(seen[1].sid.as_deref(), Some("1"));
        assert_eq!(seen[1].eof, Some(EofFlags::READ));
        assert!(seen[1].data.is_empty());
    }

    #[test]
    fn test_incremental_feed_matches_single_feed() {
        let mut wire = two_chunks();
        wire.extend_from_slice(&format_ping());
        wire.extend_from_slice(&format_reply("77", &[0xAB; 300]).unwrap());

        let mut whole = Parser::new(Recorder::default());
        whole.parse(&wire).unwrap();

        for step in [1usize, 2, 3, 7, 64] {
            let mut pieces = Parser::new(Recorder::default());
            for piece in wire.chunks(step) {
                assert_eq!(pieces.parse(piece).unwrap(), piece.len());
            }
            assert_eq!(pieces.sink().seen, whole.sink().seen, "step {}", step);
            assert_eq!(pieces.bytes_left(), 0);
        }
        assert_eq!(whole.sink().seen.len(), 4);
    }

    #[test]
    fn test_round_trip() {
        let headers = ChunkHeaders::stream("3")
            .with_request("https", "kite.example.com", 443)
            .with_remote("192.0.2.4", 50123, true)
            .with_sent_kb(17);
        let mut wire = format_chunk(&headers, b"payload").unwrap().to_vec();
        wire.extend_from_slice(&format_eof("3", EofFlags::BOTH).unwrap());

        let mut parser = Parser::new(Recorder::default());
        parser.parse(&wire).unwrap();
        let seen = &parser.sink().seen;
        assert_eq!(seen[0].sid.as_deref(), Some("3"));
        assert_eq!(seen[0].host.as_deref(), Some("kite.example.com"));
        assert_eq!(seen[0].data, b"payload");
        assert_eq!(seen[1].eof, Some(EofFlags::BOTH));
    }

    #[test]
    fn test_partial_frame_waits() {
        let wire = format_reply("1", b"abcdef").unwrap();
        let mut parser = Parser::new(Recorder::default());
        parser.parse(&wire[..wire.len() - 2]).unwrap();
        assert!(parser.sink().seen.is_empty());
        assert_eq!(parser.bytes_left(), 2);
        parser.parse(&wire[wire.len() - 2..]).unwrap();
        assert_eq!(parser.sink().seen.len(), 1);
    }

    #[test]
    fn test_bad_length_prefix() {
        let mut parser = Parser::new(Recorder::default());
        assert_eq!(parser.parse(b"zz\r\n").unwrap_err(), ParseError::BadLengthPrefix);

        let mut parser = Parser::new(Recorder::default());
        assert_eq!(
            parser.parse(b"123456789\r\n").unwrap_err(),
            ParseError::BadLengthPrefix
        );

        let mut parser = Parser::new(Recorder::default());
        assert_eq!(parser.parse(b"\r\n").unwrap_err(), ParseError::BadLengthPrefix);

        let mut parser = Parser::new(Recorder::default());
        assert_eq!(parser.parse(b"-5\r\n").unwrap_err(), ParseError::BadLengthPrefix);
    }

    #[test]
    fn test_oversized_declared_length() {
        let mut parser = Parser::with_max_payload(Recorder::default(), 16);
        let err = parser.parse(b"ffffff\r\n").unwrap_err();
        assert!(matches!(err, ParseError::FrameTooLarge(..)));

        let mut parser = Parser::with_max_payload(Recorder::default(), 4);
        let err = parser.parse(&format_reply("1", b"too long").unwrap()).unwrap_err();
        assert_eq!(err, ParseError::FrameTooLarge(8, 4));
    }

    #[test]
    fn test_header_block_size_limit() {
        let big = format!("SID: 1\r\nX-Big: {}\r\n\r\n", "a".repeat(200 * 1024));
        let frame = format!("{:x}\r\n{}", big.len(), big);
        let mut parser = Parser::new(Recorder::default());
        let err = parser.parse(frame.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::HeadersTooLarge(_, MAX_HEADER_BYTES)));
        assert!(parser.sink().seen.is_empty());

        // The largest block the formatter emits is still accepted.
        let filler = "a".repeat(MAX_HEADER_BYTES - "SID: 1\r\nX-Fill: \r\n".len());
        let headers = format!("SID: 1\r\nX-Fill: {}\r\n", filler);
        parser.parse(&format_frame(&headers, b"ok").unwrap()).unwrap();
        assert_eq!(parser.sink().seen.len(), 1);
        assert_eq!(parser.sink().seen[0].data, b"ok");
    }

    #[test]
    fn test_unbounded_payload_limit() {
        let mut parser = Parser::with_max_payload(Recorder::default(), usize::MAX);
        let ping = format_ping();
        parser.parse(&ping[..4]).unwrap();
        assert!(parser.sink().seen.is_empty());
        parser.parse(&ping[4..]).unwrap();
        parser.parse(&format_reply("1", b"hi").unwrap()).unwrap();
        assert_eq!(parser.sink().seen.len(), 2);
        assert!(parser.sink().seen[0].ping);
    }

    #[test]
    fn test_header_overflow_rejected() {
        let mut headers = String::from("SID: 1\r\n");
        for i in 0..MAX_CHUNK_HEADERS {
            headers.push_str(&format!("X-{}: v\r\n", i));
        }
        let mut parser = Parser::new(Recorder::default());
        let err = parser.parse(&format_frame(&headers, b"").unwrap()).unwrap_err();
        assert_eq!(err, ParseError::TooManyHeaders(MAX_CHUNK_HEADERS));
        assert!(parser.sink().seen.is_empty());
    }

    #[test]
    fn test_error_resets_and_reset_discards_partial() {
        let good = format_reply("1", b"ok").unwrap();

        let mut parser = Parser::new(Recorder::default());
        assert!(parser.parse(b"q\r\n").is_err());
        parser.parse(&good).unwrap();
        assert_eq!(parser.sink().seen.len(), 1);

        parser.parse(&good[..5]).unwrap();
        assert!(parser.bytes_left() > 0);
        parser.reset();
        assert_eq!(parser.bytes_left(), 0);
        parser.parse(&good).unwrap();
        assert_eq!(parser.sink().seen.len(), 2);
    }

    #[test]
    fn test_chunk_queue_owns_its_chunks() {
        let mut parser = Parser::new(ChunkQueue::default());
        parser.parse(&two_chunks()).unwrap();
        parser.parse(&format_ping()).unwrap();

        let mut queue = parser.into_sink();
        assert_eq!(queue.len(), 3);
        let first = queue.pop().unwrap();
        assert_eq!(first.headers.sid.as_deref(), Some("1"));
        assert_eq!(first.headers.request_proto.as_deref(), Some("http"));
        assert_eq!(first.data, Bytes::from_static(b"hello"));
        assert_eq!(queue.pop().unwrap().headers.eof, Some(EofFlags::READ));
        assert!(queue.pop().unwrap().headers.ping);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closure_sink() {
        let mut sids = Vec::new();
        let mut parser = Parser::new(|chunk: &Chunk<'_>| {
            sids.push(chunk.sid.map(String::from));
        });
        parser.parse(&two_chunks()).unwrap();
        drop(parser);
        assert_eq!(sids, vec![Some("1".to_string()), Some("1".to_string())]);
    }

    #[test]
    fn test_unparsable_number_is_fatal() {
        let mut parser = Parser::new(Recorder::default());
        let frame = format_frame("SID: 1\r\nSKB: lots\r\n", b"").unwrap();
        assert_eq!(parser.parse(&frame).unwrap_err(), ParseError::BadNumber("SKB"));
    }
}
