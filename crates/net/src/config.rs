//! Tunables for the networking layer.

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_LEN;

/// Payload encoding used inside frames. Both peers must use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Self-describing JSON.
    #[default]
    Json,
    /// Compact postcard binary.
    Postcard,
}

/// Network configuration shared by both roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Chebyshev radius, in chunks, of each observer's interest area.
    pub interest_radius: u32,
    /// Largest accepted frame payload in bytes.
    pub max_frame_len: usize,
    /// Number of predicted ticks kept for reconciliation.
    pub prediction_capacity: usize,
    /// Distance in tiles below which a prediction counts as correct.
    pub reconcile_tolerance: f32,
    /// How long `connect` may take before it is reported as failed.
    pub connect_timeout_ms: u64,
    /// Payload encoding.
    pub encoding: Encoding,
    /// Consecutive undecodable frames tolerated before disconnecting.
    pub max_decode_failures: u32,
    /// Ticks a snapshot or delta may stay unacknowledged before the server
    /// forces a resync.
    pub resync_after_ticks: u64,
    /// Ticks between handshake resends while the peer has not answered.
    pub handshake_resend_ticks: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            interest_radius: 3,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            // ~2 s at 60 Hz
            prediction_capacity: 120,
            reconcile_tolerance: 0.05,
            connect_timeout_ms: 5_000,
            encoding: Encoding::Json,
            max_decode_failures: 16,
            resync_after_ticks: 120,
            handshake_resend_ticks: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: NetConfig =
            serde_json::from_str(r#"{"interest_radius": 5, "encoding": "postcard"}"#).unwrap();
        assert_eq!(config.interest_radius, 5);
        assert_eq!(config.encoding, Encoding::Postcard);
        assert_eq!(config.prediction_capacity, 120);
        assert_eq!(config.max_frame_len, 1024 * 1024);
    }
}
