//! Tile and chunk coordinates.

use serde::{Deserialize, Serialize};

/// Edge length of a chunk in tiles.
pub const CHUNK_SIZE: i32 = 32;

/// Integer tile position in the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePos {
    /// Tile column.
    pub x: i32,
    /// Tile row.
    pub y: i32,
}

impl TilePos {
    /// Construct a tile position.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Tile containing a continuous world-space point.
    pub fn from_world(x: f32, y: f32) -> Self {
        Self {
            x: x.floor() as i32,
            y: y.floor() as i32,
        }
    }

    /// Chunk that contains this tile.
    pub fn chunk(self) -> ChunkCoord {
        ChunkCoord::containing(self)
    }
}

/// Coordinate of a `CHUNK_SIZE`×`CHUNK_SIZE` region of tiles.
///
/// Ordered so that chunk sets iterate deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    /// Chunk column.
    pub x: i32,
    /// Chunk row.
    pub y: i32,
}

impl ChunkCoord {
    /// Construct a chunk coordinate.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing `tile`. Negative tiles round toward negative infinity.
    pub fn containing(tile: TilePos) -> Self {
        Self {
            x: tile.x.div_euclid(CHUNK_SIZE),
            y: tile.y.div_euclid(CHUNK_SIZE),
        }
    }

    /// Chebyshev distance in chunks.
    pub fn chebyshev_distance(self, other: ChunkCoord) -> u32 {
        let dx = (i64::from(self.x) - i64::from(other.x)).unsigned_abs();
        let dy = (i64::from(self.y) - i64::from(other.y)).unsigned_abs();
        dx.max(dy).min(u64::from(u32::MAX)) as u32
    }

    /// First tile of this chunk (lowest x and y).
    pub fn origin(self) -> TilePos {
        TilePos::new(self.x * CHUNK_SIZE, self.y * CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_tile_maps_to_origin_chunk() {
        assert_eq!(TilePos::new(0, 0).chunk(), ChunkCoord::new(0, 0));
        assert_eq!(TilePos::new(31, 31).chunk(), ChunkCoord::new(0, 0));
        assert_eq!(TilePos::new(32, 0).chunk(), ChunkCoord::new(1, 0));
    }

    #[test]
    fn negative_tiles_round_down() {
        assert_eq!(TilePos::new(-1, -1).chunk(), ChunkCoord::new(-1, -1));
        assert_eq!(TilePos::new(-32, -33).chunk(), ChunkCoord::new(-1, -2));
    }

    #[test]
    fn world_points_floor_to_tiles() {
        assert_eq!(TilePos::from_world(3.9, -0.1), TilePos::new(3, -1));
    }

    #[test]
    fn chebyshev_distance_uses_max_axis() {
        let a = ChunkCoord::new(0, 0);
        assert_eq!(a.chebyshev_distance(ChunkCoord::new(3, -1)), 3);
        assert_eq!(a.chebyshev_distance(ChunkCoord::new(-2, 5)), 5);
        assert_eq!(a.chebyshev_distance(a), 0);
    }

    #[test]
    fn origin_round_trips_through_containing() {
        let chunk = ChunkCoord::new(-4, 7);
        assert_eq!(chunk.origin().chunk(), chunk);
    }
}
