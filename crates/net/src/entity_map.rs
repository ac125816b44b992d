//! Bijective mapping between network entity IDs and local handles.
//!
//! Registration happens on the network receive path while lookups come from
//! the simulation, so both maps live behind one mutex.

use crate::protocol::NetworkEntityId;
use factoryforge_core::EntityHandle;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug, Default)]
struct Maps {
    by_network: HashMap<NetworkEntityId, EntityHandle>,
    by_handle: HashMap<EntityHandle, NetworkEntityId>,
}

/// Thread-safe two-way table `NetworkEntityId <-> EntityHandle`.
#[derive(Debug, Default)]
pub struct NetworkEntityMapper {
    maps: Mutex<Maps>,
}

impl NetworkEntityMapper {
    /// Create an empty mapper.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pair `network_id` with `handle`, replacing any pair sharing either key.
    pub fn register(&self, network_id: NetworkEntityId, handle: EntityHandle) {
        let mut guard = self.lock();
        let maps = &mut *guard;
        if let Some(old_handle) = maps.by_network.remove(&network_id) {
            maps.by_handle.remove(&old_handle);
        }
        if let Some(old_id) = maps.by_handle.remove(&handle) {
            maps.by_network.remove(&old_id);
        }
        maps.by_network.insert(network_id, handle);
        maps.by_handle.insert(handle, network_id);
        trace!(network_id, %handle, "registered network entity");
    }

    /// Remove the pair keyed by `network_id`, returning its handle.
    pub fn unregister_network_id(&self, network_id: NetworkEntityId) -> Option<EntityHandle> {
        let mut maps = self.lock();
        let handle = maps.by_network.remove(&network_id)?;
        maps.by_handle.remove(&handle);
        Some(handle)
    }

    /// Remove the pair keyed by `handle`, returning its network ID.
    pub fn unregister_handle(&self, handle: EntityHandle) -> Option<NetworkEntityId> {
        let mut maps = self.lock();
        let network_id = maps.by_handle.remove(&handle)?;
        maps.by_network.remove(&network_id);
        Some(network_id)
    }

    /// Local handle for `network_id`, if known to this peer.
    pub fn entity(&self, network_id: NetworkEntityId) -> Option<EntityHandle> {
        self.lock().by_network.get(&network_id).copied()
    }

    /// Network ID for `handle`, if it is replicated.
    pub fn network_id(&self, handle: EntityHandle) -> Option<NetworkEntityId> {
        self.lock().by_handle.get(&handle).copied()
    }

    /// Number of registered pairs.
    pub fn len(&self) -> usize {
        self.lock().by_network.len()
    }

    /// Whether no pairs are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every pair, sorted by network ID.
    pub fn pairs(&self) -> Vec<(NetworkEntityId, EntityHandle)> {
        let mut pairs: Vec<_> = self
            .lock()
            .by_network
            .iter()
            .map(|(id, handle)| (*id, *handle))
            .collect();
        pairs.sort_unstable_by_key(|(id, _)| *id);
        pairs
    }

    /// Remove every pair.
    pub fn clear(&self) {
        let mut maps = self.lock();
        maps.by_network.clear();
        maps.by_handle.clear();
    }
}
