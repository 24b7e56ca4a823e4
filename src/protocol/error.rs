//! Defines the protocol-level error taxonomy.

use thiserror::Error;

/// A generic protocol error.
///
/// Every variant except [`ProtocolError::SessionClosed`] is fatal to the
/// session that produced it: the session transitions to `Closed` and
/// subsequent operations return `SessionClosed`.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An I/O error occurred, including EOF before an expected byte count.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame length exceeded the 16 MiB cap.
    #[error("frame of {0} bytes exceeds the frame size cap")]
    TooLarge(usize),
    /// A value could not be decoded: bad marker byte, truncated data,
    /// length overflow or invalid UTF-8.
    #[error("malformed value: {0}")]
    MalformedValue(String),
    /// A frame payload decoded to values but not to a well-formed message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// A message of the wrong type arrived, e.g. a request where a response
    /// was required.
    #[error("expected {expected:?} message, got {got:?}")]
    UnexpectedType {
        /// The `type` field that was required at this point.
        expected: &'static str,
        /// The `type` field that actually arrived.
        got: String,
    },
    /// The peer advertised a protocol version this library cannot speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u64),
    /// An operation was attempted on a session that is already closed.
    #[error("session closed")]
    SessionClosed,
    /// A streaming transfer violated the protocol: sequence gap, size
    /// mismatch or a stray frame in the middle of a data stream.
    #[error("stream error: {0}")]
    Stream(String),
}
