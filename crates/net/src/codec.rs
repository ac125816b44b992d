//! Message encoding and decoding with framing.
//!
//! Frame format: `[length: u32 big-endian][payload: bytes]`, where the
//! payload is one [`NetworkMessage`] in the session's [`Encoding`].

use crate::config::Encoding;
use crate::error::FrameError;
use crate::protocol::{NetworkMessage, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use tracing::{trace, warn};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Hard cap on a single frame's payload (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Compute schema hash from protocol definitions.
///
/// Both peers exchange this in the handshake to detect incompatible builds.
pub fn compute_schema_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();

    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    hasher.update(PROTOCOL_MAGIC);

    // Message type names (deterministic)
    hasher.update(b"NetworkMessage");
    hasher.update(b"Handshake");
    hasher.update(b"WorldSnapshot");
    hasher.update(b"EntityDelta");
    hasher.update(b"PlayerAction");
    hasher.update(b"UnitCommand");

    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// Serialize a message body without framing.
pub fn encode_payload(msg: &NetworkMessage, encoding: Encoding) -> Result<Vec<u8>, FrameError> {
    match encoding {
        Encoding::Json => serde_json::to_vec(msg).map_err(|e| FrameError::Encode(e.to_string())),
        Encoding::Postcard => {
            postcard::to_allocvec(msg).map_err(|e| FrameError::Encode(e.to_string()))
        }
    }
}

/// Deserialize a message body without framing.
pub fn decode_payload(payload: &[u8], encoding: Encoding) -> Result<NetworkMessage, FrameError> {
    match encoding {
        Encoding::Json => {
            serde_json::from_slice(payload).map_err(|e| FrameError::Decode(e.to_string()))
        }
        Encoding::Postcard => {
            postcard::from_bytes(payload).map_err(|e| FrameError::Decode(e.to_string()))
        }
    }
}

/// Encode a message with its length prefix.
pub fn encode_frame(
    msg: &NetworkMessage,
    encoding: Encoding,
    max_len: usize,
) -> Result<Vec<u8>, FrameError> {
    let payload = encode_payload(msg, encoding)?;
    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_len,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Receive buffer that turns a byte stream back into messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    encoding: Encoding,
    max_len: usize,
    decode_failures: u64,
    consecutive_failures: u32,
}

impl FrameDecoder {
    /// Create a decoder for `encoding` that rejects payloads over `max_len`.
    pub fn new(encoding: Encoding, max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            encoding,
            max_len,
            decode_failures: 0,
            consecutive_failures: 0,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract every complete frame currently buffered.
    ///
    /// Incomplete trailing data stays buffered. Frames whose body does not
    /// decode are skipped and counted. A frame declaring more than the cap
    /// clears the buffer and is reported as [`FrameError::TooLarge`] next to
    /// the messages decoded ahead of it; the stream cannot be resynchronized
    /// after that.
    pub fn drain_received_messages(&mut self) -> (Vec<NetworkMessage>, Option<FrameError>) {
        let mut messages = Vec::new();
        let mut cursor = 0;

        loop {
            let remaining = &self.buffer[cursor..];
            if remaining.len() < FRAME_HEADER_LEN {
                break;
            }

            let declared =
                u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                    as usize;
            if declared > self.max_len {
                self.buffer.clear();
                let err = FrameError::TooLarge {
                    len: declared,
                    max: self.max_len,
                };
                return (messages, Some(err));
            }
            if remaining.len() < FRAME_HEADER_LEN + declared {
                break;
            }

            let body = &remaining[FRAME_HEADER_LEN..FRAME_HEADER_LEN + declared];
            match decode_payload(body, self.encoding) {
                Ok(msg) => {
                    trace!(kind = msg.kind(), bytes = declared, "decoded frame");
                    self.consecutive_failures = 0;
                    messages.push(msg);
                }
                Err(err) => {
                    self.decode_failures += 1;
                    self.consecutive_failures += 1;
                    warn!(bytes = declared, %err, "dropping undecodable frame");
                }
            }
            cursor += FRAME_HEADER_LEN + declared;
        }

        self.buffer.drain(..cursor);
        (messages, None)
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Total frames dropped because they failed to decode.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    /// Undecodable frames since the last good one.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Drop any partially received data.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.consecutive_failures = 0;
    }
}
