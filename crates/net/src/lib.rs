#![warn(missing_docs)]
//! Replication networking shared by the server and client hosts.
//!
//! Message types and framing, network id mapping, chunk interest, per-observer
//! delta tracking, the TCP connection manager, client-side prediction and a
//! deterministic network simulator for tests.

pub mod codec;
pub mod config;
pub mod connection;
pub mod entity_map;
pub mod error;
pub mod interest;
pub mod prediction;
pub mod protocol;
pub mod replication;
pub mod simulator;

pub use codec::{
    compute_schema_hash, decode_payload, encode_frame, encode_payload, FrameDecoder,
    DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN,
};
pub use config::{Encoding, NetConfig};
pub use connection::{
    ConnectionEvent, ConnectionEvents, ConnectionId, ConnectionManager, ConnectionState, FrameSink,
};
pub use entity_map::NetworkEntityMapper;
pub use error::{FrameError, NetError};
pub use interest::{InterestManager, DEFAULT_INTEREST_RADIUS};
pub use prediction::{PredictionLog, PredictionMetrics, Reconciliation, DEFAULT_PREDICTION_CAPACITY};
pub use protocol::{
    EntityData, EntityDelta, GameRules, Handshake, NetworkEntityId, NetworkMessage, PlayerAction,
    UnitCommand, WorldSnapshot, PROTOCOL_VERSION,
};
pub use replication::ReplicationTracker;
pub use simulator::{
    NetworkPreset, NetworkSimulator, SimulatedLink, SimulatorConfig, SimulatorStats,
    MAX_SIMULATED_DELAY_MS,
};
