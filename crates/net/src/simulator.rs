//! Deterministic network condition simulator.
//!
//! Stands in for a socket in tests: every packet rolls for loss, then is
//! scheduled at `now + latency/2 ± jitter` on a virtual clock. Packets whose
//! random delay is shorter than an earlier packet's overtake it, which is how
//! reordering shows up. All randomness comes from a seeded `StdRng`, so a
//! given seed always produces the same drops and delivery order.

use crate::connection::FrameSink;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Upper bound on configured latency and jitter (one hour).
pub const MAX_SIMULATED_DELAY_MS: f64 = 3_600_000.0;

/// Named operating points for test parameterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPreset {
    /// Instant, lossless.
    None,
    /// Typical broadband.
    Good,
    /// Congested mobile link.
    Bad,
    /// Barely usable.
    Terrible,
}

impl NetworkPreset {
    /// All presets, mildest first.
    pub const ALL: [NetworkPreset; 4] = [
        NetworkPreset::None,
        NetworkPreset::Good,
        NetworkPreset::Bad,
        NetworkPreset::Terrible,
    ];
}

impl FromStr for NetworkPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "good" => Ok(Self::Good),
            "bad" => Ok(Self::Bad),
            "terrible" => Ok(Self::Terrible),
            other => Err(format!("unknown network preset: {other}")),
        }
    }
}

/// Link characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Round-trip latency in milliseconds; each direction gets half.
    pub latency_ms: f64,
    /// Per-packet uniform variance in `[-jitter_ms, jitter_ms]`.
    pub jitter_ms: f64,
    /// Probability in `[0, 1]` that a packet is dropped.
    pub packet_loss_ratio: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::preset(NetworkPreset::None)
    }
}

impl SimulatorConfig {
    /// Configuration for a named preset (seed 0).
    pub fn preset(preset: NetworkPreset) -> Self {
        let (latency_ms, jitter_ms, packet_loss_ratio) = match preset {
            NetworkPreset::None => (0.0, 0.0, 0.0),
            NetworkPreset::Good => (50.0, 5.0, 0.005),
            NetworkPreset::Bad => (200.0, 40.0, 0.05),
            NetworkPreset::Terrible => (500.0, 150.0, 0.2),
        };
        Self {
            latency_ms,
            jitter_ms,
            packet_loss_ratio,
            seed: 0,
        }
    }

    /// Same link with a different seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Copy with every field in range: latency and jitter in
    /// `[0, MAX_SIMULATED_DELAY_MS]`, loss in `[0, 1]`. NaN becomes zero.
    pub fn sanitized(self) -> Self {
        fn delay(ms: f64) -> f64 {
            if ms.is_nan() {
                0.0
            } else {
                ms.clamp(0.0, MAX_SIMULATED_DELAY_MS)
            }
        }
        let packet_loss_ratio = if self.packet_loss_ratio.is_nan() {
            0.0
        } else {
            self.packet_loss_ratio.clamp(0.0, 1.0)
        };
        Self {
            latency_ms: delay(self.latency_ms),
            jitter_ms: delay(self.jitter_ms),
            packet_loss_ratio,
            seed: self.seed,
        }
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    /// Bytes handed to `send`, including dropped packets.
    pub bytes_sent: u64,
    /// Bytes handed back as delivered.
    pub bytes_received: u64,
    /// Packets handed to `send`.
    pub packets_sent: u64,
    /// Packets delivered.
    pub packets_delivered: u64,
    /// Packets lost to the loss roll.
    pub packets_dropped: u64,
}

#[derive(Debug)]
struct Pending {
    deliver_at: Duration,
    /// Send order; breaks ties between equal delivery times.
    seq: u64,
    data: Vec<u8>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deliver_at, self.seq).cmp(&(other.deliver_at, other.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One direction of a simulated link.
#[derive(Debug)]
pub struct NetworkSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    now: Duration,
    pending: BinaryHeap<Reverse<Pending>>,
    next_seq: u64,
    stats: SimulatorStats,
}

impl NetworkSimulator {
    /// Create a simulator at virtual time zero.
    ///
    /// Out-of-range settings are clamped, see [`SimulatorConfig::sanitized`].
    pub fn new(config: SimulatorConfig) -> Self {
        let config = config.sanitized();
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            now: Duration::ZERO,
            pending: BinaryHeap::new(),
            next_seq: 0,
            stats: SimulatorStats::default(),
        }
    }

    /// Simulator for a named preset.
    pub fn from_preset(preset: NetworkPreset, seed: u64) -> Self {
        Self::new(SimulatorConfig::preset(preset).with_seed(seed))
    }

    /// Active configuration.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Change link characteristics; already scheduled packets keep their times.
    pub fn set_config(&mut self, config: SimulatorConfig) {
        self.config = config.sanitized();
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Submit a packet. Returns `false` if it was dropped.
    pub fn send(&mut self, data: Vec<u8>) -> bool {
        let len = data.len() as u64;
        self.stats.bytes_sent += len;
        self.stats.packets_sent += 1;

        let loss = self.config.packet_loss_ratio;
        if loss > 0.0 && self.rng.gen::<f64>() < loss {
            self.stats.packets_dropped += 1;
            trace!(bytes = len, "simulated packet loss");
            return false;
        }

        let delay = self.roll_delay();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Reverse(Pending {
            deliver_at: self.now + delay,
            seq,
            data,
        }));
        true
    }

    fn roll_delay(&mut self) -> Duration {
        let base_secs = self.config.latency_ms / 2.0 / 1000.0;
        let jitter_ms = self.config.jitter_ms;
        let jitter_secs = if jitter_ms > 0.0 {
            self.rng.gen_range(-jitter_ms..=jitter_ms) / 1000.0
        } else {
            0.0
        };
        Duration::from_secs_f64((base_secs + jitter_secs).max(0.0))
    }

    /// Move the clock forward and return every packet now due, in
    /// delivery-time order.
    pub fn advance(&mut self, dt: Duration) -> Vec<Vec<u8>> {
        self.now += dt;
        let mut delivered = Vec::new();
        while let Some(Reverse(next)) = self.pending.peek() {
            if next.deliver_at > self.now {
                break;
            }
            if let Some(Reverse(packet)) = self.pending.pop() {
                delivered.push(self.deliver(packet));
            }
        }
        delivered
    }

    /// Deliver every pending packet immediately, in scheduled order.
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        let mut delivered = Vec::with_capacity(self.pending.len());
        while let Some(Reverse(packet)) = self.pending.pop() {
            delivered.push(self.deliver(packet));
        }
        delivered
    }

    fn deliver(&mut self, packet: Pending) -> Vec<u8> {
        self.stats.bytes_received += packet.data.len() as u64;
        self.stats.packets_delivered += 1;
        packet.data
    }

    /// Packets scheduled but not yet delivered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Traffic counters.
    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }
}

/// Thread-safe simulator that a [`crate::ConnectionManager`] can route frames into.
#[derive(Debug)]
pub struct SimulatedLink {
    simulator: Mutex<NetworkSimulator>,
}

impl SimulatedLink {
    /// Wrap a simulator.
    pub fn new(simulator: NetworkSimulator) -> Self {
        Self {
            simulator: Mutex::new(simulator),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkSimulator> {
        self.simulator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`NetworkSimulator::advance`].
    pub fn advance(&self, dt: Duration) -> Vec<Vec<u8>> {
        self.lock().advance(dt)
    }

    /// See [`NetworkSimulator::flush`].
    pub fn flush(&self) -> Vec<Vec<u8>> {
        self.lock().flush()
    }

    /// See [`NetworkSimulator::stats`].
    pub fn stats(&self) -> SimulatorStats {
        self.lock().stats()
    }

    /// See [`NetworkSimulator::pending_len`].
    pub fn pending_len(&self) -> usize {
        self.lock().pending_len()
    }

    /// See [`NetworkSimulator::set_config`].
    pub fn set_config(&self, config: SimulatorConfig) {
        self.lock().set_config(config);
    }
}

impl FrameSink for SimulatedLink {
    fn send_frame(&self, frame: Vec<u8>) {
        self.lock().send(frame);
    }
}
