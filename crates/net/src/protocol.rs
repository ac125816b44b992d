//! Protocol message definitions for client-server communication.
//!
//! Every message on the wire is one [`NetworkMessage`]. The variant tag is
//! part of the serialized payload, so the receiver always knows which kind
//! of message was sent.

use factoryforge_core::{ChunkCoord, TilePos};
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 1;

/// Protocol magic bytes folded into the schema hash.
pub const PROTOCOL_MAGIC: &[u8; 8] = b"FFRG\x00\x01\x00\x00";

/// Server-assigned identifier of a replicated entity.
pub type NetworkEntityId = u32;

/// Maximum number of deltas per `Delta` message.
pub const MAX_DELTAS_PER_MESSAGE: usize = 4096;

/// Maximum number of entities carried by one snapshot.
pub const MAX_SNAPSHOT_ENTITIES: usize = 65_536;

/// Maximum number of chunks listed in one snapshot.
pub const MAX_SNAPSHOT_CHUNKS: usize = 4096;

/// Maximum entity/building kind name length.
pub const MAX_KIND_LEN: usize = 64;

/// Maximum recipe ID length for crafting.
pub const MAX_RECIPE_ID_LEN: usize = 64;

/// Maximum number of units addressed by one unit command.
pub const MAX_UNITS_PER_COMMAND: usize = 256;

/// Maximum opaque gameplay state carried per entity (bytes).
pub const MAX_ENTITY_STATE_LEN: usize = 4096;

/// Session parameters fixed at handshake time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GameRules {
    /// Seed for every deterministic generation step.
    pub seed: u64,
    /// Whether players can damage each other's buildings and units.
    pub friendly_fire: bool,
    /// Player cap for the session.
    pub max_players: u32,
    /// Simulation ticks per second.
    pub tick_rate: f32,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            seed: 0,
            friendly_fire: false,
            max_players: 4,
            tick_rate: 60.0,
        }
    }
}

/// First message on every connection, sent by both peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    /// Protocol version.
    pub version: u16,
    /// Schema hash for compatibility.
    pub schema_hash: u64,
    /// Session seed both peers must agree on.
    pub seed: u64,
    /// Session rules.
    pub rules: GameRules,
    /// Entity controlled by the receiving client (server → client only).
    pub player_entity_id: Option<NetworkEntityId>,
}

/// Replicated state of one entity.
///
/// Everything gameplay-specific beyond kind and placement travels as opaque
/// bytes; this layer never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityData {
    /// Entity kind (e.g. `"assembler"`, `"player"`).
    pub kind: String,
    /// Continuous world position in tiles.
    pub position: Vec2,
    /// Facing, quantized to 256 steps.
    pub rotation: u8,
    /// Opaque gameplay payload.
    pub state: Vec<u8>,
}

impl EntityData {
    /// Entity with no gameplay payload.
    pub fn new(kind: impl Into<String>, position: Vec2) -> Self {
        Self {
            kind: kind.into(),
            position,
            rotation: 0,
            state: Vec::new(),
        }
    }

    /// Tile the entity stands on.
    pub fn tile(&self) -> TilePos {
        TilePos::from_world(self.position.x, self.position.y)
    }

    /// Chunk the entity belongs to.
    pub fn chunk(&self) -> ChunkCoord {
        self.tile().chunk()
    }

    /// Verify limits and validity.
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.kind.len() > MAX_KIND_LEN {
            return Err("Entity kind too long");
        }
        if self.state.len() > MAX_ENTITY_STATE_LEN {
            return Err("Entity state too large");
        }
        if !self.position.is_finite() {
            return Err("Entity position not finite");
        }
        Ok(())
    }
}

/// One incremental change to the replicated set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EntityDelta {
    /// Create or overwrite an entity.
    Upsert {
        /// Entity being written.
        network_entity_id: NetworkEntityId,
        /// Full replicated state.
        data: EntityData,
    },
    /// Remove an entity from the receiver's view.
    Remove {
        /// Entity being removed.
        network_entity_id: NetworkEntityId,
    },
}

impl EntityDelta {
    /// Entity this delta refers to.
    pub fn network_entity_id(&self) -> NetworkEntityId {
        match self {
            EntityDelta::Upsert {
                network_entity_id, ..
            }
            | EntityDelta::Remove { network_entity_id } => *network_entity_id,
        }
    }
}

/// Full description of the world subset visible to one observer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    /// Tick the snapshot was taken at.
    pub tick: u64,
    /// Chunks covered by this snapshot.
    pub chunks: Vec<ChunkCoord>,
    /// Every replicated entity in those chunks.
    pub entities: Vec<(NetworkEntityId, EntityData)>,
}

impl WorldSnapshot {
    /// Verify limits and validity.
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.chunks.len() > MAX_SNAPSHOT_CHUNKS {
            return Err("Too many chunks in snapshot");
        }
        if self.entities.len() > MAX_SNAPSHOT_ENTITIES {
            return Err("Too many entities in snapshot");
        }
        for (_, data) in &self.entities {
            data.verify()?;
        }
        Ok(())
    }
}

/// Order issued to one or more units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum UnitCommand {
    /// Walk to a tile.
    MoveTo {
        /// Destination.
        target: TilePos,
    },
    /// Attack an entity.
    Attack {
        /// Entity to attack.
        target: NetworkEntityId,
    },
    /// Follow an entity.
    Follow {
        /// Entity to follow.
        target: NetworkEntityId,
    },
    /// Cancel current orders.
    Stop,
}

/// Input produced by a player and executed by the authoritative side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PlayerAction {
    /// Move the controlled character.
    Move {
        /// Desired direction; length at most 1.
        direction: Vec2,
    },
    /// Place a building.
    PlaceBuilding {
        /// Building kind.
        kind: String,
        /// Anchor tile.
        tile: TilePos,
        /// Facing, quantized to 256 steps.
        rotation: u8,
    },
    /// Deconstruct whatever occupies a tile.
    RemoveBuilding {
        /// Target tile.
        tile: TilePos,
    },
    /// Queue a hand-crafting job.
    Craft {
        /// Recipe identifier.
        recipe: String,
        /// Number of crafts.
        count: u32,
    },
    /// Order units.
    Unit {
        /// Units receiving the order.
        units: Vec<NetworkEntityId>,
        /// The order.
        command: UnitCommand,
    },
}

impl PlayerAction {
    /// Verify limits and validity.
    ///
    /// This should be called on every received action before it reaches the
    /// simulation.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            PlayerAction::Move { direction } => {
                if !direction.is_finite() {
                    return Err("Move direction not finite");
                }
                // Small slack for float error on normalized input.
                if direction.length_squared() > 1.0001 {
                    return Err("Move direction longer than 1");
                }
            }
            PlayerAction::PlaceBuilding { kind, .. } => {
                if kind.is_empty() || kind.len() > MAX_KIND_LEN {
                    return Err("Invalid building kind");
                }
            }
            PlayerAction::Craft { recipe, count } => {
                if recipe.is_empty() || recipe.len() > MAX_RECIPE_ID_LEN {
                    return Err("Invalid recipe ID");
                }
                if *count == 0 {
                    return Err("Craft count must be positive");
                }
            }
            PlayerAction::Unit { units, .. } => {
                if units.is_empty() {
                    return Err("Unit command without units");
                }
                if units.len() > MAX_UNITS_PER_COMMAND {
                    return Err("Too many units in command");
                }
            }
            PlayerAction::RemoveBuilding { .. } => {}
        }
        Ok(())
    }
}

/// Every message that can cross a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetworkMessage {
    /// Session setup; must be the first message in each direction.
    Handshake(Handshake),
    /// Full-state sync for a new observer.
    Snapshot {
        /// Visible world subset.
        world: WorldSnapshot,
    },
    /// Incremental update, applied as one batch.
    Delta {
        /// Authoritative tick the deltas bring the receiver to.
        tick: u64,
        /// Upserts and removals; order is not significant.
        deltas: Vec<EntityDelta>,
    },
    /// Player input.
    Command {
        /// Client tick the action was issued on.
        tick: u64,
        /// The action.
        action: PlayerAction,
    },
    /// Round-trip time measurement request.
    Ping {
        /// Sender-local timestamp in milliseconds, echoed back.
        timestamp: u64,
    },
    /// Reply to a `Ping`.
    Pong {
        /// Timestamp copied from the matching ping.
        timestamp: u64,
    },
    /// Acknowledges a snapshot or delta by its tick.
    Ack {
        /// Tick of the acknowledged message.
        message_id: u64,
    },
    /// Forced full resync after divergence.
    Resync {
        /// Visible world subset.
        world: WorldSnapshot,
    },
}

impl NetworkMessage {
    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::Handshake(_) => "handshake",
            NetworkMessage::Snapshot { .. } => "snapshot",
            NetworkMessage::Delta { .. } => "delta",
            NetworkMessage::Command { .. } => "command",
            NetworkMessage::Ping { .. } => "ping",
            NetworkMessage::Pong { .. } => "pong",
            NetworkMessage::Ack { .. } => "ack",
            NetworkMessage::Resync { .. } => "resync",
        }
    }

    /// Verify message limits and validity.
    ///
    /// This should be called on all received messages to prevent DoS attacks.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            NetworkMessage::Handshake(handshake) => {
                if handshake.seed != handshake.rules.seed {
                    return Err("Handshake seed disagrees with its rules");
                }
                let tick_rate = handshake.rules.tick_rate;
                if !tick_rate.is_finite() || tick_rate <= 0.0 {
                    return Err("Invalid tick rate");
                }
            }
            NetworkMessage::Snapshot { world } | NetworkMessage::Resync { world } => {
                world.verify()?;
            }
            NetworkMessage::Delta { deltas, .. } => {
                if deltas.len() > MAX_DELTAS_PER_MESSAGE {
                    return Err("Too many deltas");
                }
                for delta in deltas {
                    if let EntityDelta::Upsert { data, .. } = delta {
                        data.verify()?;
                    }
                }
            }
            NetworkMessage::Command { action, .. } => {
                action.verify()?;
            }
            NetworkMessage::Ping { .. }
            | NetworkMessage::Pong { .. }
            | NetworkMessage::Ack { .. } => {}
        }
        Ok(())
    }
}
