#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod chunk;
pub mod entity;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use chunk::{ChunkCoord, TilePos, CHUNK_SIZE};
pub use entity::{EntityAllocator, EntityHandle};

/// Fixed simulation tick (60 TPS by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick in any deterministic timeline.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Helper to derive a reproducible RNG from a session seed and a stream id.
///
/// Both peers agree on the session seed during the handshake, so any
/// generation keyed through this helper is identical on either side.
pub fn scoped_rng(session_seed: u64, stream: u64, tick: SimTick) -> StdRng {
    let seed = session_seed ^ stream.rotate_left(17) ^ tick.0;
    StdRng::seed_from_u64(seed)
}
