//! Chunk-based interest management.
//!
//! An observer is interested in every chunk within a fixed Chebyshev radius of
//! the chunk it stands in, so per-observer bandwidth is bounded by the radius
//! rather than the world size. Pure and deterministic: no I/O, no clocks.

use factoryforge_core::{ChunkCoord, TilePos};
use std::collections::BTreeSet;

/// Default interest radius in chunks.
pub const DEFAULT_INTEREST_RADIUS: u32 = 3;

/// Computes which chunks are worth synchronizing to an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestManager {
    radius: u32,
}

impl Default for InterestManager {
    fn default() -> Self {
        Self::new(DEFAULT_INTEREST_RADIUS)
    }
}

impl InterestManager {
    /// Create a manager with the given Chebyshev radius (in chunks).
    pub fn new(radius: u32) -> Self {
        Self { radius }
    }

    /// Configured radius.
    pub fn radius(&self) -> u32 {
        self.radius
    }

    /// Chunks within the radius of the chunk containing `tile`.
    ///
    /// Always `(2 * radius + 1)^2` coordinates.
    pub fn visible_chunk_coords(&self, tile: TilePos) -> BTreeSet<ChunkCoord> {
        let mut chunks = BTreeSet::new();
        self.collect_square(tile.chunk(), &mut chunks);
        chunks
    }

    /// Union of the visible chunks of every observer.
    pub fn visible_chunk_coords_for(&self, tiles: &[TilePos]) -> BTreeSet<ChunkCoord> {
        let mut chunks = BTreeSet::new();
        for tile in tiles {
            self.collect_square(tile.chunk(), &mut chunks);
        }
        chunks
    }

    /// Visible chunks of every observer that the authoritative side has loaded.
    pub fn relevant_chunk_coords(
        &self,
        tiles: &[TilePos],
        loaded: &BTreeSet<ChunkCoord>,
    ) -> BTreeSet<ChunkCoord> {
        let visible = self.visible_chunk_coords_for(tiles);
        // Iterate whichever set is smaller.
        if visible.len() <= loaded.len() {
            visible.into_iter().filter(|c| loaded.contains(c)).collect()
        } else {
            loaded
                .iter()
                .filter(|c| visible.contains(c))
                .copied()
                .collect()
        }
    }

    /// Whether `chunk` is within the radius of `tile`'s chunk.
    pub fn is_visible(&self, tile: TilePos, chunk: ChunkCoord) -> bool {
        tile.chunk().chebyshev_distance(chunk) <= self.radius
    }

    fn collect_square(&self, center: ChunkCoord, out: &mut BTreeSet<ChunkCoord>) {
        let radius = i64::from(self.radius);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let x = i64::from(center.x) + dx;
                let y = i64::from(center.y) + dy;
                if let (Ok(x), Ok(y)) = (i32::try_from(x), i32::try_from(y)) {
                    out.insert(ChunkCoord::new(x, y));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factoryforge_core::CHUNK_SIZE;

    #[test]
    fn radius_three_at_origin_is_seven_by_seven() {
        let interest = InterestManager::new(3);
        let chunks = interest.visible_chunk_coords(TilePos::new(0, 0));

        assert_eq!(chunks.len(), 49);
        for x in -3..=3 {
            for y in -3..=3 {
                assert!(chunks.contains(&ChunkCoord::new(x, y)));
            }
        }
    }

    #[test]
    fn cardinality_matches_radius() {
        for radius in 0..6u32 {
            let interest = InterestManager::new(radius);
            let chunks = interest.visible_chunk_coords(TilePos::new(-100, 250));
            let side = (2 * radius + 1) as usize;
            assert_eq!(chunks.len(), side * side);
        }
    }

    #[test]
    fn radius_zero_is_own_chunk() {
        let interest = InterestManager::new(0);
        let tile = TilePos::new(CHUNK_SIZE * 2 + 5, -1);
        let chunks = interest.visible_chunk_coords(tile);

        assert_eq!(chunks.into_iter().collect::<Vec<_>>(), vec![ChunkCoord::new(2, -1)]);
    }

    #[test]
    fn union_of_overlapping_observers() {
        let interest = InterestManager::new(1);
        let a = TilePos::new(0, 0);
        let b = TilePos::new(CHUNK_SIZE, 0); // neighbouring chunk
        let chunks = interest.visible_chunk_coords_for(&[a, b]);

        // 3x3 and 3x3 shifted by one column: 4 columns x 3 rows.
        assert_eq!(chunks.len(), 12);
    }

    #[test]
    fn no_observers_sees_nothing() {
        let interest = InterestManager::default();
        assert!(interest.visible_chunk_coords_for(&[]).is_empty());
    }

    #[test]
    fn relevant_intersects_with_loaded() {
        let interest = InterestManager::new(2);
        let loaded: BTreeSet<_> = [
            ChunkCoord::new(0, 0),
            ChunkCoord::new(2, 2),
            ChunkCoord::new(3, 0),
            ChunkCoord::new(-50, 7),
        ]
        .into_iter()
        .collect();

        let relevant = interest.relevant_chunk_coords(&[TilePos::new(1, 1)], &loaded);
        assert_eq!(
            relevant.into_iter().collect::<Vec<_>>(),
            vec![ChunkCoord::new(0, 0), ChunkCoord::new(2, 2)]
        );
    }

    #[test]
    fn is_visible_matches_set_membership() {
        let interest = InterestManager::new(3);
        let tile = TilePos::new(70, -40);
        let visible = interest.visible_chunk_coords(tile);
        for x in -8..8 {
            for y in -8..8 {
                let chunk = ChunkCoord::new(x, y);
                assert_eq!(interest.is_visible(tile, chunk), visible.contains(&chunk));
            }
        }
    }
}
