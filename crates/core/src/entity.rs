//! Generational entity handles.
//!
//! A handle is an `(index, generation)` pair. Destroying an entity bumps the
//! generation stored for its index and pushes the index onto a free stack, so
//! a handle captured before destruction never aliases whatever is created at
//! that index afterwards.
//!
//! The allocator is owned by a single thread (the simulation). Callers that
//! share it across threads add their own serialization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable reference to one live game object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle {
    /// Slot in the identity table.
    pub index: u32,
    /// Generation the slot had when this handle was issued.
    pub generation: u16,
}

impl EntityHandle {
    /// Build a handle from raw parts (mostly useful in tests and wire decoding).
    pub const fn new(index: u32, generation: u16) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Allocates and recycles [`EntityHandle`]s.
#[derive(Debug, Default, Clone)]
pub struct EntityAllocator {
    generations: Vec<u16>,
    alive: Vec<bool>,
    /// Freed indices; the most recently freed one is reused first.
    free: Vec<u32>,
    live: usize,
}

impl EntityAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle, reusing the most recently freed index if any.
    pub fn create(&mut self) -> EntityHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = index as usize;
            self.alive[slot] = true;
            return EntityHandle::new(index, self.generations[slot]);
        }

        let index = self.generations.len() as u32;
        self.generations.push(0);
        self.alive.push(true);
        EntityHandle::new(index, 0)
    }

    /// Destroy the entity behind `handle`.
    ///
    /// Dead, stale, or never-issued handles are ignored.
    pub fn destroy(&mut self, handle: EntityHandle) -> bool {
        if !self.is_alive(handle) {
            return false;
        }
        let slot = handle.index as usize;
        self.alive[slot] = false;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        true
    }

    /// Whether `handle` still refers to a live entity.
    pub fn is_alive(&self, handle: EntityHandle) -> bool {
        let slot = handle.index as usize;
        match (self.alive.get(slot), self.generations.get(slot)) {
            (Some(&alive), Some(&generation)) => alive && generation == handle.generation,
            _ => false,
        }
    }

    /// Number of live entities.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots ever allocated (live + free).
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }

    /// Iterate live handles in index order.
    pub fn iter_live(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.alive
            .iter()
            .zip(self.generations.iter())
            .enumerate()
            .filter(|(_, (alive, _))| **alive)
            .map(|(index, (_, generation))| EntityHandle::new(index as u32, *generation))
    }

    /// Destroy every live entity, keeping generations so old handles stay invalid.
    pub fn clear(&mut self) {
        let live: Vec<_> = self.iter_live().collect();
        for handle in live.into_iter().rev() {
            self.destroy(handle);
        }
    }
}
