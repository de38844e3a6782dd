//! Error types for the tunnel protocol.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer violated the framing or header syntax.
    #[error("Protocol violation: {0}")]
    Syntax(#[from] ParseError),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid kite request: {0}")]
    InvalidRequest(String),

    #[error("Kite request has no backend salt")]
    MissingSalt,

    #[error("Entropy source unavailable: {0}")]
    Entropy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transport failures are worth retrying; protocol and auth problems
    /// are not.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::Io(_))
    }
}

/// Fatal framing errors. Any of these ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed length prefix")]
    BadLengthPrefix,

    #[error("frame length {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    #[error("header block of {0} bytes exceeds maximum {1}")]
    HeadersTooLarge(usize, usize),

    #[error("frame is missing the header terminator")]
    MissingHeaderEnd,

    #[error("more than {0} headers in chunk")]
    TooManyHeaders(usize),

    #[error("malformed header line")]
    MalformedHeader,

    #[error("invalid numeric value for {0}")]
    BadNumber(&'static str),

    #[error("data chunk without SID")]
    MissingSid,
}
