//! Session metrics exported as JSON for CI artifacts.

use anyhow::{Context, Result};
use factoryforge_net::{NetworkPreset, PredictionMetrics, SimulatorStats};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Summary of one simulated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Scenario name.
    pub name: String,

    /// When the report was produced (RFC 3339).
    pub timestamp: String,

    /// Link preset, when the session used one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<NetworkPreset>,

    /// Ticks simulated.
    pub ticks: u64,

    /// Whether the client's view matched the server at the end.
    pub converged: bool,

    /// Forced resyncs sent by the server.
    pub resyncs: u64,

    /// Entities replicated to the client at the end.
    pub client_entities: usize,

    /// Smoothed round trip time seen by the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothed_rtt_ms: Option<f64>,

    /// Client to server link.
    pub uplink: LinkReport,

    /// Server to client link.
    pub downlink: LinkReport,

    /// Client prediction accuracy.
    pub prediction: PredictionReport,
}

/// Traffic over one simulated direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    /// Packets handed to the link.
    pub packets_sent: u64,
    /// Packets delivered.
    pub packets_delivered: u64,
    /// Packets lost.
    pub packets_dropped: u64,
    /// Bytes handed to the link.
    pub bytes_sent: u64,
    /// Bytes delivered.
    pub bytes_received: u64,
}

impl From<SimulatorStats> for LinkReport {
    fn from(stats: SimulatorStats) -> Self {
        Self {
            packets_sent: stats.packets_sent,
            packets_delivered: stats.packets_delivered,
            packets_dropped: stats.packets_dropped,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
        }
    }
}

/// Client prediction counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionReport {
    /// Positions predicted.
    pub predictions: u64,
    /// Server confirmations within tolerance.
    pub matches: u64,
    /// Corrections applied.
    pub snaps: u64,
    /// Largest correction, in tiles.
    pub max_error: f32,
}

impl From<PredictionMetrics> for PredictionReport {
    fn from(metrics: PredictionMetrics) -> Self {
        Self {
            predictions: metrics.total_predictions,
            matches: metrics.total_matches,
            snaps: metrics.total_snaps,
            max_error: metrics.max_error_distance,
        }
    }
}

impl SessionReport {
    /// Fraction of server confirmations that matched the prediction.
    pub fn prediction_accuracy(&self) -> f64 {
        let checked = self.prediction.matches + self.prediction.snaps;
        if checked == 0 {
            return 1.0;
        }
        self.prediction.matches as f64 / checked as f64
    }

    /// Write the report as pretty JSON, creating parent directories.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Read a report written by [`SessionReport::write_json`].
    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}
