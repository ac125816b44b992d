#![warn(missing_docs)]
//! Authoritative replication host.
//!
//! [`ReplicationServer`] owns the server side of one session: it handshakes
//! each accepted peer, streams the peer's relevant world subset as snapshots
//! and deltas, and feeds received player actions into an
//! [`AuthoritativeWorld`].

pub mod multiplayer;
pub mod world;

use anyhow::Result;
use factoryforge_core::ChunkCoord;
use factoryforge_net::{EntityData, NetworkEntityId, PlayerAction};
use std::collections::{BTreeMap, BTreeSet};

pub use multiplayer::ReplicationServer;
pub use world::{step_player, SandboxWorld, PLAYER_SPEED};

/// Gameplay simulation the server replicates from.
pub trait AuthoritativeWorld {
    /// Current simulation tick.
    fn tick(&self) -> u64;

    /// Every replicated entity, keyed by network id.
    fn entities(&self) -> &BTreeMap<NetworkEntityId, EntityData>;

    /// Chunks that currently exist and can be synchronized.
    fn loaded_chunks(&self) -> &BTreeSet<ChunkCoord>;

    /// Create the entity a newly connected player controls.
    fn spawn_player(&mut self) -> NetworkEntityId;

    /// Remove a player's entity after its connection ends.
    fn despawn_player(&mut self, player: NetworkEntityId);

    /// Execute a verified action on behalf of `player`.
    fn apply_action(&mut self, player: NetworkEntityId, tick: u64, action: &PlayerAction)
        -> Result<()>;
}
