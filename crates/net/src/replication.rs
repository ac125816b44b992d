//! Per-observer entity replication with delta encoding.
//!
//! Each connected observer gets one tracker. It remembers what was last sent,
//! so each broadcast only carries entities that appeared, changed, or left the
//! observer's relevant chunks. Uses BTreeMap/BTreeSet so deltas come out in
//! the same order on every run.

use crate::interest::InterestManager;
use crate::protocol::{EntityData, EntityDelta, NetworkEntityId, WorldSnapshot};
use factoryforge_core::{ChunkCoord, TilePos};
use std::collections::{BTreeMap, BTreeSet};

/// Tracks what one observer has been sent.
#[derive(Debug, Clone)]
pub struct ReplicationTracker {
    interest: InterestManager,
    /// Last state sent for each entity the observer knows about.
    last_sent: BTreeMap<NetworkEntityId, EntityData>,
    /// Chunks currently relevant to the observer.
    relevant_chunks: BTreeSet<ChunkCoord>,
    last_acked_tick: Option<u64>,
}

impl ReplicationTracker {
    /// Create a tracker using `interest` to pick relevant chunks.
    pub fn new(interest: InterestManager) -> Self {
        Self {
            interest,
            last_sent: BTreeMap::new(),
            relevant_chunks: BTreeSet::new(),
            last_acked_tick: None,
        }
    }

    /// Recompute relevant chunks from the observer positions and the chunks
    /// the authoritative side has loaded.
    pub fn update_interest(&mut self, observers: &[TilePos], loaded: &BTreeSet<ChunkCoord>) {
        self.relevant_chunks = self.interest.relevant_chunk_coords(observers, loaded);
    }

    /// Whether an entity lies in a relevant chunk.
    pub fn is_relevant(&self, data: &EntityData) -> bool {
        self.relevant_chunks.contains(&data.chunk())
    }

    /// Deltas bringing the observer from what it was sent to `entities`.
    ///
    /// Relevant entities that are new or changed become upserts; entities the
    /// observer knows that are gone or no longer relevant become removals.
    pub fn generate_delta(
        &mut self,
        entities: &BTreeMap<NetworkEntityId, EntityData>,
    ) -> Vec<EntityDelta> {
        let mut deltas = Vec::new();

        for (&id, data) in entities {
            if !self.is_relevant(data) {
                continue;
            }
            if self.last_sent.get(&id) == Some(data) {
                continue;
            }
            self.last_sent.insert(id, data.clone());
            deltas.push(EntityDelta::Upsert {
                network_entity_id: id,
                data: data.clone(),
            });
        }

        let departed: Vec<NetworkEntityId> = self
            .last_sent
            .keys()
            .copied()
            .filter(|id| match entities.get(id) {
                Some(data) => !self.is_relevant(data),
                None => true,
            })
            .collect();
        for id in departed {
            self.last_sent.remove(&id);
            deltas.push(EntityDelta::Remove {
                network_entity_id: id,
            });
        }

        deltas
    }

    /// Full snapshot of the relevant set; the tracker's cache is reset to it.
    pub fn snapshot(
        &mut self,
        tick: u64,
        entities: &BTreeMap<NetworkEntityId, EntityData>,
    ) -> WorldSnapshot {
        self.last_sent = entities
            .iter()
            .filter(|(_, data)| self.is_relevant(data))
            .map(|(id, data)| (*id, data.clone()))
            .collect();

        WorldSnapshot {
            tick,
            chunks: self.relevant_chunks.iter().copied().collect(),
            entities: self
                .last_sent
                .iter()
                .map(|(id, data)| (*id, data.clone()))
                .collect(),
        }
    }

    /// Treat an entity as never sent, so the next delta upserts it if it is
    /// still relevant.
    pub fn forget(&mut self, id: NetworkEntityId) {
        self.last_sent.remove(&id);
    }

    /// Record that the observer applied everything up to `tick`.
    pub fn acknowledge(&mut self, tick: u64) {
        self.last_acked_tick = Some(self.last_acked_tick.map_or(tick, |t| t.max(tick)));
    }

    /// Newest tick the observer acknowledged.
    pub fn last_acked_tick(&self) -> Option<u64> {
        self.last_acked_tick
    }

    /// Number of entities the observer knows about.
    pub fn tracked_count(&self) -> usize {
        self.last_sent.len()
    }

    /// Chunks currently relevant to the observer.
    pub fn relevant_chunks(&self) -> &BTreeSet<ChunkCoord> {
        &self.relevant_chunks
    }

    /// Forget everything sent (next broadcast should be a snapshot).
    pub fn clear(&mut self) {
        self.last_sent.clear();
        self.relevant_chunks.clear();
        self.last_acked_tick = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factoryforge_core::CHUNK_SIZE;
    use glam::Vec2;

    fn loaded_square(radius: i32) -> BTreeSet<ChunkCoord> {
        let mut loaded = BTreeSet::new();
        for x in -radius..=radius {
            for y in -radius..=radius {
                loaded.insert(ChunkCoord::new(x, y));
            }
        }
        loaded
    }

    fn tracker_at_origin() -> ReplicationTracker {
        let mut tracker = ReplicationTracker::new(InterestManager::new(1));
        tracker.update_interest(&[TilePos::new(0, 0)], &loaded_square(10));
        tracker
    }

    fn entity(x: f32) -> EntityData {
        EntityData::new("assembler", Vec2::new(x, 0.0))
    }

    #[test]
    fn new_relevant_entity_is_upserted() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        world.insert(1, entity(5.0));
        world.insert(2, entity((CHUNK_SIZE * 5) as f32)); // out of range

        let deltas = tracker.generate_delta(&world);
        assert_eq!(
            deltas,
            vec![EntityDelta::Upsert {
                network_entity_id: 1,
                data: entity(5.0)
            }]
        );
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[test]
    fn forgotten_entity_is_upserted_again() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        world.insert(1, entity(5.0));
        world.insert(2, entity(6.0));
        tracker.snapshot(1, &world);

        tracker.forget(2);
        assert_eq!(
            tracker.generate_delta(&world),
            vec![EntityDelta::Upsert {
                network_entity_id: 2,
                data: entity(6.0)
            }]
        );
        assert_eq!(tracker.tracked_count(), 2);
    }

    #[test]
    fn unchanged_entity_sends_nothing() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        world.insert(1, entity(5.0));

        tracker.generate_delta(&world);
        assert!(tracker.generate_delta(&world).is_empty());
    }

    #[test]
    fn changed_entity_is_upserted_again() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        world.insert(1, entity(5.0));
        tracker.generate_delta(&world);

        world.insert(1, entity(6.0));
        let deltas = tracker.generate_delta(&world);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(deltas[0], EntityDelta::Upsert { network_entity_id: 1, .. }));
    }

    #[test]
    fn destroyed_entity_is_removed() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        world.insert(1, entity(5.0));
        tracker.generate_delta(&world);

        world.remove(&1);
        assert_eq!(
            tracker.generate_delta(&world),
            vec![EntityDelta::Remove {
                network_entity_id: 1
            }]
        );
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn entity_leaving_interest_is_removed() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        world.insert(1, entity(5.0));
        tracker.generate_delta(&world);

        world.insert(1, entity((CHUNK_SIZE * 4) as f32));
        assert_eq!(
            tracker.generate_delta(&world),
            vec![EntityDelta::Remove {
                network_entity_id: 1
            }]
        );
    }

    #[test]
    fn observer_moving_changes_relevance() {
        let mut tracker = tracker_at_origin();
        let far = (CHUNK_SIZE * 4) as f32;
        let mut world = BTreeMap::new();
        world.insert(1, entity(far));
        assert!(tracker.generate_delta(&world).is_empty());

        tracker.update_interest(&[TilePos::new(CHUNK_SIZE * 4, 0)], &loaded_square(10));
        assert_eq!(tracker.generate_delta(&world).len(), 1);
    }

    #[test]
    fn unloaded_chunks_are_never_relevant() {
        let mut tracker = ReplicationTracker::new(InterestManager::new(3));
        let loaded: BTreeSet<_> = [ChunkCoord::new(0, 0)].into_iter().collect();
        tracker.update_interest(&[TilePos::new(0, 0)], &loaded);

        assert!(tracker.is_relevant(&entity(1.0)));
        assert!(!tracker.is_relevant(&entity((CHUNK_SIZE + 1) as f32)));
    }

    #[test]
    fn snapshot_resets_cache() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        world.insert(1, entity(5.0));
        world.insert(2, entity(6.0));

        let snapshot = tracker.snapshot(40, &world);
        assert_eq!(snapshot.tick, 40);
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.chunks.len(), 9);
        assert!(tracker.generate_delta(&world).is_empty());
    }

    #[test]
    fn acknowledge_keeps_newest() {
        let mut tracker = tracker_at_origin();
        tracker.acknowledge(10);
        tracker.acknowledge(7);
        assert_eq!(tracker.last_acked_tick(), Some(10));
    }

    #[test]
    fn deltas_are_ordered_by_id() {
        let mut tracker = tracker_at_origin();
        let mut world = BTreeMap::new();
        for id in [5, 2, 8, 1, 9] {
            world.insert(id, entity(id as f32));
        }
        let ids: Vec<_> = tracker
            .generate_delta(&world)
            .iter()
            .map(EntityDelta::network_entity_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 5, 8, 9]);
    }
}
