//! Error types for the networking layer.

use thiserror::Error;

/// Errors raised while framing or unframing messages.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// A frame body was not a valid message.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// Declared or produced payload length exceeds the configured cap.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge {
        /// Offending payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Errors surfaced by the connection manager and session hosts.
#[derive(Debug, Error)]
pub enum NetError {
    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Connection attempt did not finish in time.
    #[error("connection to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        /// Target address as given by the caller.
        addr: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// Peer closed the stream.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A transport operation needed a tokio runtime and none was available.
    #[error("no tokio runtime available for network tasks")]
    NoRuntime,

    /// Peer broke the protocol (e.g. traffic before the handshake).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Handshake parameters did not match.
    #[error("handshake rejected: {0}")]
    HandshakeMismatch(String),

    /// Too many consecutive frames failed to decode.
    #[error("{0} consecutive frames failed to decode")]
    TooManyDecodeFailures(u32),
}
