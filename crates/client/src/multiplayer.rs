//! Remote session: handshake, world replication and predicted movement.

use anyhow::{ensure, Context, Result};
use factoryforge_core::{EntityAllocator, EntityHandle};
use factoryforge_net::{
    compute_schema_hash, ConnectionEvent, ConnectionEvents, ConnectionId, ConnectionManager,
    EntityData, EntityDelta, GameRules, Handshake, NetConfig, NetError, NetworkEntityId,
    NetworkEntityMapper, NetworkMessage, PlayerAction, PredictionLog, PredictionMetrics,
    WorldSnapshot, PROTOCOL_VERSION,
};
use factoryforge_server::step_player;
use glam::Vec2;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, info, instrument, warn};

/// Session parameters adopted from the server's handshake.
#[derive(Debug, Clone, PartialEq)]
struct SessionParams {
    seed: u64,
    rules: GameRules,
    player: Option<NetworkEntityId>,
}

/// Client side of a replication session.
pub struct ReplicationClient {
    manager: ConnectionManager,
    schema_hash: u64,
    session: Option<SessionParams>,

    allocator: EntityAllocator,
    mapper: NetworkEntityMapper,
    store: BTreeMap<EntityHandle, EntityData>,
    /// Tick of the newest snapshot, resync or delta applied.
    applied_tick: Option<u64>,

    next_command_tick: u64,
    last_acked_command: Option<u64>,
    predicted: Option<Vec2>,
    prediction: PredictionLog,
    /// Movement inputs not yet acknowledged, replayed after a correction.
    inputs: BTreeMap<u64, Vec2>,

    rtt_ms: Option<f64>,
    smoothed_rtt_ms: Option<f64>,
}

impl ReplicationClient {
    /// Create a disconnected client.
    pub fn new(config: NetConfig) -> (Self, ConnectionEvents) {
        let prediction = PredictionLog::with_capacity(config.prediction_capacity);
        let (manager, events) = ConnectionManager::new(config);
        let client = Self {
            manager,
            schema_hash: compute_schema_hash(),
            session: None,
            allocator: EntityAllocator::new(),
            mapper: NetworkEntityMapper::new(),
            store: BTreeMap::new(),
            applied_tick: None,
            next_command_tick: 1,
            last_acked_command: None,
            predicted: None,
            prediction,
            inputs: BTreeMap::new(),
            rtt_ms: None,
            smoothed_rtt_ms: None,
        };
        (client, events)
    }

    /// Start connecting to a server.
    pub fn connect(&self, host: &str, port: u16) -> Result<ConnectionId> {
        self.manager
            .connect(host, port)
            .with_context(|| format!("failed to connect to {host}:{port}"))
    }

    /// Close the connection without notifying the server.
    pub fn disconnect(&mut self) {
        self.manager.disconnect();
        self.reset();
    }

    /// Underlying connection manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Whether the handshake completed on the current connection.
    pub fn is_synchronized(&self) -> bool {
        self.session.is_some()
    }

    /// Session seed from the handshake.
    pub fn seed(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.seed)
    }

    /// Session rules from the handshake.
    pub fn rules(&self) -> Option<&GameRules> {
        self.session.as_ref().map(|session| &session.rules)
    }

    /// Entity this client controls.
    pub fn player(&self) -> Option<NetworkEntityId> {
        self.session.as_ref().and_then(|session| session.player)
    }

    /// Predicted position of the local player.
    pub fn player_position(&self) -> Option<Vec2> {
        self.predicted
    }

    /// Last replicated state of a network entity.
    pub fn entity(&self, network_id: NetworkEntityId) -> Option<&EntityData> {
        let handle = self.mapper.entity(network_id)?;
        self.store.get(&handle)
    }

    /// Every replicated entity, keyed by network id.
    pub fn entities(&self) -> BTreeMap<NetworkEntityId, &EntityData> {
        self.mapper
            .pairs()
            .into_iter()
            .filter_map(|(id, handle)| Some((id, self.store.get(&handle)?)))
            .collect()
    }

    /// Number of replicated entities.
    pub fn entity_count(&self) -> usize {
        self.store.len()
    }

    /// Network id to local handle table.
    pub fn mapper(&self) -> &NetworkEntityMapper {
        &self.mapper
    }

    /// Local handle allocator.
    pub fn allocator(&self) -> &EntityAllocator {
        &self.allocator
    }

    /// Tick of the newest world state applied.
    pub fn applied_tick(&self) -> Option<u64> {
        self.applied_tick
    }

    /// Newest command tick the server acknowledged.
    pub fn last_acked_command(&self) -> Option<u64> {
        self.last_acked_command
    }

    /// Most recent round trip sample.
    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_ms
    }

    /// Exponentially smoothed round trip time.
    pub fn smoothed_rtt_ms(&self) -> Option<f64> {
        self.smoothed_rtt_ms
    }

    /// Prediction counters.
    pub fn prediction_metrics(&self) -> PredictionMetrics {
        self.prediction.metrics()
    }

    /// Move the local player, predicting the result immediately.
    ///
    /// Returns the command tick.
    pub fn send_move(&mut self, direction: Vec2) -> Result<u64> {
        let position = self
            .predicted
            .context("local player has not been replicated yet")?;
        let tick = self.send_command(PlayerAction::Move { direction })?;
        let position = step_player(position, direction);
        self.predicted = Some(position);
        self.prediction.record_prediction(tick, position);
        self.inputs.insert(tick, direction);
        while self.inputs.len() > self.manager.config().prediction_capacity {
            self.inputs.pop_first();
        }
        Ok(tick)
    }

    /// Send a non-movement action. Returns the command tick.
    pub fn send_action(&mut self, action: PlayerAction) -> Result<u64> {
        let tick = self.send_command(action)?;
        // Position is unchanged, but the tick still needs an entry to
        // reconcile against once acknowledged.
        if let Some(position) = self.predicted {
            self.prediction.record_prediction(tick, position);
        }
        Ok(tick)
    }

    /// Send a ping stamped with `now_ms`.
    pub fn ping(&self, now_ms: u64) -> Result<()> {
        self.manager
            .send(&NetworkMessage::Ping { timestamp: now_ms })
            .context("failed to send ping")
    }

    fn send_command(&mut self, action: PlayerAction) -> Result<u64> {
        ensure!(self.is_synchronized(), "session is not synchronized");
        action
            .verify()
            .map_err(|reason| anyhow::anyhow!("invalid action: {reason}"))?;
        let tick = self.next_command_tick;
        self.manager
            .send(&NetworkMessage::Command { tick, action })
            .context("failed to send command")?;
        self.next_command_tick += 1;
        Ok(tick)
    }

    /// React to one transport event. `now_ms` timestamps pongs.
    #[instrument(skip_all)]
    pub fn handle_event(&mut self, event: ConnectionEvent, now_ms: u64) -> Result<()> {
        match event {
            ConnectionEvent::Connected { connection, peer } => {
                info!(%connection, ?peer, "connected; awaiting handshake");
                self.reset();
            }
            ConnectionEvent::Disconnected { connection, cause } => {
                match cause {
                    Some(err) => warn!(%connection, %err, "disconnected"),
                    None => info!(%connection, "disconnected"),
                }
                self.session = None;
            }
            ConnectionEvent::Message { message, .. } => {
                self.handle_message(message, now_ms)?;
            }
            ConnectionEvent::DecodeFailed {
                connection,
                consecutive,
            } => {
                if consecutive >= self.manager.config().max_decode_failures {
                    warn!(%connection, consecutive, "too many undecodable frames");
                    self.disconnect();
                }
            }
            ConnectionEvent::Listening { .. } | ConnectionEvent::ListenFailed { .. } => {
                debug!("listener event ignored by client");
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: NetworkMessage, now_ms: u64) -> Result<()> {
        if let Err(reason) = message.verify() {
            warn!(kind = message.kind(), reason, "invalid message; disconnecting");
            self.disconnect();
            return Ok(());
        }

        let message = match message {
            NetworkMessage::Handshake(handshake) => return self.handle_handshake(handshake),
            other => other,
        };
        if !self.is_synchronized() {
            let err = NetError::ProtocolViolation(format!("{} before handshake", message.kind()));
            warn!(%err, "disconnecting");
            self.disconnect();
            return Ok(());
        }

        match message {
            NetworkMessage::Snapshot { world } | NetworkMessage::Resync { world } => {
                let tick = world.tick;
                self.apply_snapshot(world);
                self.acknowledge(tick)?;
            }
            NetworkMessage::Delta { tick, deltas } => {
                if self.applied_tick.is_some_and(|applied| tick < applied) {
                    debug!(tick, "stale delta ignored");
                    return Ok(());
                }
                self.apply_deltas(tick, deltas);
                self.acknowledge(tick)?;
            }
            NetworkMessage::Ack { message_id } => {
                if self.last_acked_command.map_or(true, |last| message_id > last) {
                    self.last_acked_command = Some(message_id);
                    self.inputs.retain(|tick, _| *tick > message_id);
                }
            }
            NetworkMessage::Pong { timestamp } => {
                let sample = now_ms.saturating_sub(timestamp) as f64;
                self.rtt_ms = Some(sample);
                self.smoothed_rtt_ms = Some(match self.smoothed_rtt_ms {
                    Some(smoothed) => smoothed * 0.875 + sample * 0.125,
                    None => sample,
                });
                debug!(rtt_ms = sample, "pong");
            }
            NetworkMessage::Ping { timestamp } => {
                self.manager.send(&NetworkMessage::Pong { timestamp })?;
            }
            NetworkMessage::Command { .. } => {
                warn!("unexpected command from server");
            }
            NetworkMessage::Handshake(_) => {}
        }
        Ok(())
    }

    fn handle_handshake(&mut self, handshake: Handshake) -> Result<()> {
        if handshake.version != PROTOCOL_VERSION || handshake.schema_hash != self.schema_hash {
            let err = NetError::HandshakeMismatch(format!(
                "server speaks version {} schema {:#x}",
                handshake.version, handshake.schema_hash
            ));
            warn!(%err, "disconnecting");
            self.disconnect();
            return Ok(());
        }

        let params = SessionParams {
            seed: handshake.seed,
            rules: handshake.rules,
            player: handshake.player_entity_id,
        };
        match &self.session {
            Some(current) if *current == params => {
                debug!("handshake repeated; echoing again");
            }
            Some(_) => {
                warn!("handshake parameters changed mid-session; disconnecting");
                self.disconnect();
                return Ok(());
            }
            None => {
                info!(seed = params.seed, player = ?params.player, "handshake received");
            }
        }

        let echo = Handshake {
            version: PROTOCOL_VERSION,
            schema_hash: self.schema_hash,
            seed: params.seed,
            rules: params.rules.clone(),
            player_entity_id: None,
        };
        self.session = Some(params);
        self.manager
            .send(&NetworkMessage::Handshake(echo))
            .context("failed to echo handshake")
    }

    fn acknowledge(&self, tick: u64) -> Result<()> {
        self.manager
            .send(&NetworkMessage::Ack { message_id: tick })
            .context("failed to acknowledge world update")
    }

    /// Replace the local store with `world`, keeping handles of entities
    /// that survive and destroying the rest.
    fn apply_snapshot(&mut self, world: WorldSnapshot) {
        let incoming: BTreeSet<NetworkEntityId> =
            world.entities.iter().map(|(id, _)| *id).collect();
        for (id, handle) in self.mapper.pairs() {
            if !incoming.contains(&id) {
                self.destroy(id, handle);
            }
        }

        debug!(
            tick = world.tick,
            entities = world.entities.len(),
            "applying world state"
        );
        for (id, data) in world.entities {
            self.upsert(id, data);
        }
        self.applied_tick = Some(world.tick);
    }

    fn apply_deltas(&mut self, tick: u64, deltas: Vec<EntityDelta>) {
        for delta in deltas {
            match delta {
                EntityDelta::Upsert {
                    network_entity_id,
                    data,
                } => self.upsert(network_entity_id, data),
                EntityDelta::Remove { network_entity_id } => {
                    if let Some(handle) = self.mapper.entity(network_entity_id) {
                        self.destroy(network_entity_id, handle);
                    }
                }
            }
        }
        self.applied_tick = Some(self.applied_tick.map_or(tick, |applied| applied.max(tick)));
    }

    fn upsert(&mut self, id: NetworkEntityId, data: EntityData) {
        if self.player() == Some(id) {
            self.reconcile_player(data.position);
        }
        let handle = match self.mapper.entity(id) {
            Some(handle) => handle,
            None => {
                let handle = self.allocator.create();
                self.mapper.register(id, handle);
                handle
            }
        };
        self.store.insert(handle, data);
    }

    fn destroy(&mut self, id: NetworkEntityId, handle: EntityHandle) {
        self.mapper.unregister_network_id(id);
        self.allocator.destroy(handle);
        self.store.remove(&handle);
        if self.player() == Some(id) {
            self.predicted = None;
        }
    }

    fn reconcile_player(&mut self, server_position: Vec2) {
        let Some(acked) = self.last_acked_command.filter(|_| self.predicted.is_some()) else {
            self.predicted = Some(server_position);
            return;
        };

        let tolerance = self.manager.config().reconcile_tolerance;
        let Some(correction) = self.prediction.reconcile(acked, server_position, tolerance) else {
            return;
        };

        let mut position = correction.position;
        for (tick, direction) in self.inputs.range((Excluded(acked), Unbounded)) {
            position = step_player(position, *direction);
            self.prediction.record_prediction(*tick, position);
        }
        debug!(
            acked,
            replayed = self.inputs.range((Excluded(acked), Unbounded)).count(),
            "prediction corrected"
        );
        self.predicted = Some(position);
    }

    fn reset(&mut self) {
        self.session = None;
        for (id, handle) in self.mapper.pairs() {
            self.destroy(id, handle);
        }
        self.store.clear();
        self.applied_tick = None;
        self.next_command_tick = 1;
        self.last_acked_command = None;
        self.predicted = None;
        self.prediction.clear();
        self.inputs.clear();
    }
}
