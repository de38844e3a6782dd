//! PkTunnel Shared Library
//!
//! Wire protocol for the tunnel between a frontend relay and a backend:
//! chunk framing, the incremental parser, kite signing and the handshake.

pub mod chunk;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod kite;
pub mod parser;
pub mod reject;
pub mod request;

pub use chunk::{Chunk, ChunkHeaders, EofFlags, Frame, StreamEof, MAX_CHUNK_HEADERS};
pub use codec::{
    format_chunk, format_eof, format_frame, format_ping, format_pong, format_reply,
    reply_overhead, MAX_FRAME_PAYLOAD, PK_FRONTEND_PING, PK_FRONTEND_PONG,
};
pub use error::{Error, ParseError, Result};
pub use handshake::{
    connect, connect_addrs, ping_frontend, Connector, Handshake, HandshakeOutcome,
    TcpConnector, TlsConnector,
};
pub use kite::{
    make_bsalt, sign, sign_kite_request, verify_signature, Kite, KiteRequest, KiteStatus,
};
pub use parser::{ChunkQueue, ChunkSink, Parser, QueuedChunk};
pub use reject::{format_reject, REJECT_MAXSIZE};
pub use request::{parse_kite_request, ParsedKiteRequest};
