//! Small deterministic sandbox world used by the `serve` and `simulate`
//! commands.

use crate::AuthoritativeWorld;
use anyhow::{bail, Context, Result};
use factoryforge_core::{scoped_rng, ChunkCoord, SimTick, TilePos, CHUNK_SIZE};
use factoryforge_net::{EntityData, NetworkEntityId, PlayerAction, UnitCommand};
use glam::Vec2;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Distance in tiles a player covers per `Move` at full input.
pub const PLAYER_SPEED: f32 = 0.15;

/// Ticks between assembler progress steps.
const ASSEMBLER_PERIOD: u64 = 30;

const SCATTER_STREAM: u64 = 0x5CA7;

/// Largest loaded radius, in chunks, a sandbox accepts.
pub const MAX_LOADED_RADIUS: i32 = 64;

const BUILDING_KINDS: [&str; 4] = ["assembler", "furnace", "belt", "inserter"];

/// Advance a player by one movement command.
///
/// Shared by the server and the client's prediction so both sides run the
/// exact same float operations.
pub fn step_player(position: Vec2, direction: Vec2) -> Vec2 {
    position + direction.clamp_length_max(1.0) * PLAYER_SPEED
}

/// Centre of a tile in world coordinates.
pub fn tile_center(tile: TilePos) -> Vec2 {
    Vec2::new(tile.x as f32 + 0.5, tile.y as f32 + 0.5)
}

/// Authoritative world with buildings, units and players.
#[derive(Debug, Clone)]
pub struct SandboxWorld {
    seed: u64,
    tick: SimTick,
    next_id: NetworkEntityId,
    entities: BTreeMap<NetworkEntityId, EntityData>,
    loaded: BTreeSet<ChunkCoord>,
    crafted: BTreeMap<NetworkEntityId, u32>,
}

impl SandboxWorld {
    /// Load a square of chunks around the origin and scatter `buildings`
    /// deterministically from `seed`.
    ///
    /// `loaded_radius` is clamped to `0..=MAX_LOADED_RADIUS`.
    pub fn new(seed: u64, loaded_radius: i32, buildings: usize) -> Self {
        let clamped = loaded_radius.clamp(0, MAX_LOADED_RADIUS);
        if clamped != loaded_radius {
            warn!(requested = loaded_radius, used = clamped, "loaded radius out of range");
        }
        let loaded_radius = clamped;

        let mut loaded = BTreeSet::new();
        for x in -loaded_radius..=loaded_radius {
            for y in -loaded_radius..=loaded_radius {
                loaded.insert(ChunkCoord::new(x, y));
            }
        }

        let mut world = Self {
            seed,
            tick: SimTick::ZERO,
            next_id: 1,
            entities: BTreeMap::new(),
            loaded,
            crafted: BTreeMap::new(),
        };

        // Tiles covered by the loaded square of chunks.
        let min = -loaded_radius * CHUNK_SIZE;
        let max = (loaded_radius + 1) * CHUNK_SIZE;
        let mut rng = scoped_rng(seed, SCATTER_STREAM, SimTick::ZERO);
        let side = i64::from(max - min);
        let buildings = buildings.min(usize::try_from(side * side).unwrap_or(usize::MAX));
        let mut placed = 0;
        while placed < buildings {
            let tile = TilePos::new(rng.gen_range(min..max), rng.gen_range(min..max));
            if world.occupant(tile).is_some() {
                continue;
            }
            let kind = BUILDING_KINDS[rng.gen_range(0..BUILDING_KINDS.len())];
            let mut data = EntityData::new(kind, tile_center(tile));
            data.rotation = rng.gen_range(0..4) * 64;
            world.insert(data);
            placed += 1;
        }

        // A few units near spawn for unit orders.
        for i in 0..3 {
            world.insert(EntityData::new("unit", tile_center(TilePos::new(i * 2 - 2, 3))));
        }
        world
    }

    /// Session seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Run one simulation tick.
    pub fn advance(&mut self) {
        self.tick = self.tick.advance(1);
        if self.tick.0 % ASSEMBLER_PERIOD == 0 {
            for data in self.entities.values_mut() {
                if data.kind == "assembler" {
                    let progress = data.state.first().copied().unwrap_or(0);
                    data.state = vec![progress.wrapping_add(1)];
                }
            }
        }
    }

    /// Number of crafts a player has completed.
    pub fn crafted(&self, player: NetworkEntityId) -> u32 {
        self.crafted.get(&player).copied().unwrap_or(0)
    }

    fn insert(&mut self, data: EntityData) -> NetworkEntityId {
        let id = self.next_id;
        self.next_id += 1;
        self.entities.insert(id, data);
        id
    }

    fn occupant(&self, tile: TilePos) -> Option<NetworkEntityId> {
        self.entities
            .iter()
            .find(|(_, data)| data.kind != "player" && data.tile() == tile)
            .map(|(id, _)| *id)
    }
}

impl AuthoritativeWorld for SandboxWorld {
    fn tick(&self) -> u64 {
        self.tick.0
    }

    fn entities(&self) -> &BTreeMap<NetworkEntityId, EntityData> {
        &self.entities
    }

    fn loaded_chunks(&self) -> &BTreeSet<ChunkCoord> {
        &self.loaded
    }

    fn spawn_player(&mut self) -> NetworkEntityId {
        let id = self.insert(EntityData::new("player", Vec2::new(0.5, 0.5)));
        debug!(player = id, "spawned player");
        id
    }

    fn despawn_player(&mut self, player: NetworkEntityId) {
        if self.entities.remove(&player).is_some() {
            debug!(player, "despawned player");
        }
    }

    fn apply_action(
        &mut self,
        player: NetworkEntityId,
        _tick: u64,
        action: &PlayerAction,
    ) -> Result<()> {
        match action {
            PlayerAction::Move { direction } => {
                let data = self
                    .entities
                    .get_mut(&player)
                    .context("player entity missing")?;
                data.position = step_player(data.position, *direction);
            }
            PlayerAction::PlaceBuilding {
                kind,
                tile,
                rotation,
            } => {
                if !self.loaded.contains(&tile.chunk()) {
                    bail!("tile {tile:?} is not loaded");
                }
                if self.occupant(*tile).is_some() {
                    bail!("tile {tile:?} is occupied");
                }
                let mut data = EntityData::new(kind.clone(), tile_center(*tile));
                data.rotation = *rotation;
                self.insert(data);
            }
            PlayerAction::RemoveBuilding { tile } => {
                let id = self
                    .occupant(*tile)
                    .with_context(|| format!("nothing to remove at {tile:?}"))?;
                self.entities.remove(&id);
            }
            PlayerAction::Craft { recipe, count } => {
                debug!(player, %recipe, count, "craft");
                let crafted = self.crafted.entry(player).or_default();
                *crafted = crafted.saturating_add(*count);
            }
            PlayerAction::Unit { units, command } => match command {
                UnitCommand::MoveTo { target } => {
                    for unit in units {
                        if let Some(data) = self.entities.get_mut(unit) {
                            if data.kind == "unit" {
                                data.position = tile_center(*target);
                            }
                        }
                    }
                }
                other => debug!(player, ?other, "unit order ignored by sandbox"),
            },
        }
        Ok(())
    }
}
