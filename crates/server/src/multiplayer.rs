//! Server side of a replication session.

use crate::AuthoritativeWorld;
use anyhow::{Context, Result};
use factoryforge_core::TilePos;
use factoryforge_net::protocol::MAX_DELTAS_PER_MESSAGE;
use factoryforge_net::{
    compute_schema_hash, ConnectionEvent, ConnectionEvents, ConnectionId, ConnectionManager,
    EntityData, EntityDelta, FrameError, GameRules, Handshake, InterestManager, NetConfig,
    NetError, NetworkEntityId, NetworkMessage, ReplicationTracker, WorldSnapshot,
    PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, info, instrument, warn};

/// Per-connection state.
#[derive(Debug)]
struct Session {
    connection: ConnectionId,
    player: NetworkEntityId,
    handshake_done: bool,
    handshake_sent_tick: u64,
    tracker: ReplicationTracker,
    needs_snapshot: bool,
    /// Set when an update could not be sent; the next broadcast resyncs.
    needs_repair: bool,
    /// Ticks of snapshots/deltas sent, oldest first, with the number of
    /// their messages not yet acknowledged.
    unacked: VecDeque<(u64, usize)>,
    last_command_tick: Option<u64>,
}

/// Authoritative host for one connected player at a time.
pub struct ReplicationServer {
    manager: ConnectionManager,
    rules: GameRules,
    schema_hash: u64,
    session: Option<Session>,
    resyncs: u64,
}

impl ReplicationServer {
    /// Create a server and the event queue its connection manager reports on.
    pub fn new(config: NetConfig, rules: GameRules) -> (Self, ConnectionEvents) {
        let (manager, events) = ConnectionManager::new(config);
        let server = Self {
            manager,
            rules,
            schema_hash: compute_schema_hash(),
            session: None,
            resyncs: 0,
        };
        (server, events)
    }

    /// Start accepting players on `port`.
    pub fn listen(&self, port: u16) -> Result<()> {
        self.manager
            .listen(port)
            .with_context(|| format!("failed to listen on port {port}"))
    }

    /// Underlying connection manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Session rules sent in every handshake.
    pub fn rules(&self) -> &GameRules {
        &self.rules
    }

    /// Entity controlled by the connected player.
    pub fn player(&self) -> Option<NetworkEntityId> {
        self.session.as_ref().map(|session| session.player)
    }

    /// Whether the connected player completed the handshake.
    pub fn is_synchronized(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.handshake_done)
    }

    /// Newest tick the player acknowledged.
    pub fn last_acked_tick(&self) -> Option<u64> {
        self.session
            .as_ref()
            .and_then(|session| session.tracker.last_acked_tick())
    }

    /// Newest command tick received from the player.
    pub fn last_command_tick(&self) -> Option<u64> {
        self.session
            .as_ref()
            .and_then(|session| session.last_command_tick)
    }

    /// Resyncs forced so far.
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// React to one transport event.
    ///
    /// Only a failed listener is an error; misbehaving peers are logged and
    /// disconnected.
    pub fn handle_event<W: AuthoritativeWorld>(
        &mut self,
        event: ConnectionEvent,
        world: &mut W,
    ) -> Result<()> {
        match event {
            ConnectionEvent::Listening { local_addr } => {
                info!(%local_addr, "accepting players");
            }
            ConnectionEvent::ListenFailed { cause } => {
                return Err(cause).context("listener failed");
            }
            ConnectionEvent::Connected { connection, peer } => {
                self.start_session(connection, peer, world)?;
            }
            ConnectionEvent::Disconnected { connection, cause } => {
                if self.is_session(connection) {
                    match cause {
                        Some(err) => info!(%connection, %err, "player disconnected"),
                        None => info!(%connection, "player replaced"),
                    }
                    self.end_session(world);
                }
            }
            ConnectionEvent::Message {
                connection,
                message,
            } => {
                if self.is_session(connection) {
                    self.handle_message(message, world)?;
                } else {
                    debug!(%connection, kind = message.kind(), "message for unknown connection");
                }
            }
            ConnectionEvent::DecodeFailed {
                connection,
                consecutive,
            } => {
                let limit = self.manager.config().max_decode_failures;
                if self.is_session(connection) && consecutive >= limit {
                    warn!(%connection, consecutive, "too many undecodable frames");
                    self.close(world);
                }
            }
        }
        Ok(())
    }

    /// Send the player whatever changed in its interest area.
    ///
    /// The first broadcast after the handshake is a full snapshot. Updates
    /// left unacknowledged for too long are replaced by a resync.
    #[instrument(skip_all, fields(tick = world.tick()))]
    pub fn broadcast<W: AuthoritativeWorld>(&mut self, world: &W) -> Result<()> {
        let tick = world.tick();
        let config = self.manager.config();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if !session.handshake_done {
            if tick.saturating_sub(session.handshake_sent_tick) >= config.handshake_resend_ticks {
                debug!(player = session.player, "resending handshake");
                session.handshake_sent_tick = tick;
                send_handshake(&self.manager, &self.rules, self.schema_hash, session.player)?;
            }
            return Ok(());
        }

        let observers: Vec<TilePos> = world
            .entities()
            .get(&session.player)
            .map(EntityData::tile)
            .into_iter()
            .collect();
        session
            .tracker
            .update_interest(&observers, world.loaded_chunks());

        let stale = session
            .unacked
            .front()
            .is_some_and(|(sent, _)| tick.saturating_sub(*sent) >= config.resync_after_ticks);
        if session.needs_snapshot || session.needs_repair || stale {
            let resync = !session.needs_snapshot;
            if resync {
                if session.needs_repair {
                    warn!(player = session.player, "previous update was not sent; forcing resync");
                } else {
                    warn!(player = session.player, "updates unacknowledged; forcing resync");
                }
                self.resyncs += 1;
            }
            return send_full_state(&self.manager, session, tick, world, resync);
        }

        let deltas = session.tracker.generate_delta(world.entities());
        if deltas.is_empty() {
            return Ok(());
        }
        debug!(count = deltas.len(), "sending deltas");
        match send_deltas(&self.manager, tick, &deltas) {
            Ok(messages) => {
                session.unacked.push_back((tick, messages));
                Ok(())
            }
            Err(err) => {
                session.needs_repair = true;
                Err(err).context("failed to send deltas")
            }
        }
    }

    /// Immediately replace the player's view with a full resync.
    pub fn resync<W: AuthoritativeWorld>(&mut self, world: &W) -> Result<()> {
        let Some(session) = self.session.as_mut().filter(|s| s.handshake_done) else {
            return Ok(());
        };
        self.resyncs += 1;
        let observers: Vec<TilePos> = world
            .entities()
            .get(&session.player)
            .map(EntityData::tile)
            .into_iter()
            .collect();
        session
            .tracker
            .update_interest(&observers, world.loaded_chunks());
        send_full_state(&self.manager, session, world.tick(), world, true)
    }

    /// Drop the connected player.
    pub fn kick<W: AuthoritativeWorld>(&mut self, world: &mut W) {
        self.close(world);
    }

    fn is_session(&self, connection: ConnectionId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.connection == connection)
    }

    fn start_session<W: AuthoritativeWorld>(
        &mut self,
        connection: ConnectionId,
        peer: Option<SocketAddr>,
        world: &mut W,
    ) -> Result<()> {
        self.end_session(world);

        let player = world.spawn_player();
        info!(%connection, ?peer, player, "player connected");
        let config = self.manager.config();
        self.session = Some(Session {
            connection,
            player,
            handshake_done: false,
            handshake_sent_tick: world.tick(),
            tracker: ReplicationTracker::new(InterestManager::new(config.interest_radius)),
            needs_snapshot: true,
            needs_repair: false,
            unacked: VecDeque::new(),
            last_command_tick: None,
        });
        send_handshake(&self.manager, &self.rules, self.schema_hash, player)
    }

    fn end_session<W: AuthoritativeWorld>(&mut self, world: &mut W) {
        if let Some(session) = self.session.take() {
            world.despawn_player(session.player);
        }
    }

    fn close<W: AuthoritativeWorld>(&mut self, world: &mut W) {
        self.manager.disconnect();
        self.end_session(world);
    }

    fn handle_message<W: AuthoritativeWorld>(
        &mut self,
        message: NetworkMessage,
        world: &mut W,
    ) -> Result<()> {
        if let Err(reason) = message.verify() {
            warn!(kind = message.kind(), reason, "invalid message; disconnecting");
            self.close(world);
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if !session.handshake_done {
            let outcome = match &message {
                NetworkMessage::Handshake(handshake) => {
                    check_handshake(handshake, &self.rules, self.schema_hash)
                }
                other => Err(NetError::ProtocolViolation(format!(
                    "{} before handshake",
                    other.kind()
                ))),
            };
            match outcome {
                Ok(()) => {
                    info!(player = session.player, "handshake complete");
                    session.handshake_done = true;
                    session.needs_snapshot = true;
                }
                Err(err) => {
                    warn!(%err, "closing connection");
                    self.close(world);
                }
            }
            return Ok(());
        }

        match message {
            NetworkMessage::Command { tick, action } => {
                if let Err(err) = world.apply_action(session.player, tick, &action) {
                    debug!(player = session.player, tick, %err, "action rejected");
                }
                session.last_command_tick = Some(
                    session
                        .last_command_tick
                        .map_or(tick, |last| last.max(tick)),
                );
                self.manager
                    .send(&NetworkMessage::Ack { message_id: tick })?;
            }
            NetworkMessage::Ping { timestamp } => {
                self.manager.send(&NetworkMessage::Pong { timestamp })?;
            }
            NetworkMessage::Ack { message_id } => {
                session.tracker.acknowledge(message_id);
                if let Some(index) = session
                    .unacked
                    .iter()
                    .position(|(sent, _)| *sent == message_id)
                {
                    let pending = &mut session.unacked[index].1;
                    *pending = pending.saturating_sub(1);
                    if *pending == 0 {
                        session.unacked.remove(index);
                    }
                }
            }
            NetworkMessage::Handshake(_) => {
                debug!("duplicate handshake ignored");
            }
            NetworkMessage::Pong { .. } => {}
            other @ (NetworkMessage::Snapshot { .. }
            | NetworkMessage::Delta { .. }
            | NetworkMessage::Resync { .. }) => {
                warn!(kind = other.kind(), "unexpected message from client");
            }
        }
        Ok(())
    }
}

fn send_handshake(
    manager: &ConnectionManager,
    rules: &GameRules,
    schema_hash: u64,
    player: NetworkEntityId,
) -> Result<()> {
    manager
        .send(&NetworkMessage::Handshake(Handshake {
            version: PROTOCOL_VERSION,
            schema_hash,
            seed: rules.seed,
            rules: rules.clone(),
            player_entity_id: Some(player),
        }))
        .context("failed to send handshake")
}

fn check_handshake(
    handshake: &Handshake,
    rules: &GameRules,
    schema_hash: u64,
) -> Result<(), NetError> {
    if handshake.version != PROTOCOL_VERSION {
        return Err(NetError::HandshakeMismatch(format!(
            "protocol version {} != {}",
            handshake.version, PROTOCOL_VERSION
        )));
    }
    if handshake.schema_hash != schema_hash {
        return Err(NetError::HandshakeMismatch(format!(
            "schema hash {:#x} != {:#x}",
            handshake.schema_hash, schema_hash
        )));
    }
    if handshake.seed != rules.seed {
        return Err(NetError::HandshakeMismatch(format!(
            "seed {} != {}",
            handshake.seed, rules.seed
        )));
    }
    if handshake.rules != *rules {
        return Err(NetError::HandshakeMismatch(format!(
            "rules {:?} != {:?}",
            handshake.rules, rules
        )));
    }
    Ok(())
}

/// Send the observer's whole relevant set.
///
/// When the state does not fit in one frame, entities are dropped from the
/// tail until it does; the tracker forgets them so the next broadcast
/// upserts them as deltas.
fn send_full_state<W: AuthoritativeWorld>(
    manager: &ConnectionManager,
    session: &mut Session,
    tick: u64,
    world: &W,
    resync: bool,
) -> Result<()> {
    let mut snapshot = session.tracker.snapshot(tick, world.entities());
    debug!(
        entities = snapshot.entities.len(),
        chunks = snapshot.chunks.len(),
        resync,
        "sending full state"
    );
    session.needs_snapshot = false;
    session.needs_repair = false;
    session.unacked.clear();

    loop {
        match manager.send(&full_state_message(&snapshot, resync)) {
            Ok(()) => break,
            Err(NetError::Frame(FrameError::TooLarge { len, max }))
                if !snapshot.entities.is_empty() =>
            {
                let keep = snapshot.entities.len() / 2;
                debug!(len, max, keep, "world state over the frame limit; deferring the rest");
                for (id, _) in snapshot.entities.drain(keep..) {
                    session.tracker.forget(id);
                }
            }
            Err(err) => {
                session.needs_repair = true;
                return Err(err).context("failed to send world state");
            }
        }
    }
    session.unacked.push_back((tick, 1));
    Ok(())
}

fn full_state_message(snapshot: &WorldSnapshot, resync: bool) -> NetworkMessage {
    let world = snapshot.clone();
    if resync {
        NetworkMessage::Resync { world }
    } else {
        NetworkMessage::Snapshot { world }
    }
}

/// Send `deltas` for `tick`, halving any batch the frame limit rejects.
///
/// Returns the number of messages sent.
fn send_deltas(
    manager: &ConnectionManager,
    tick: u64,
    deltas: &[EntityDelta],
) -> Result<usize, NetError> {
    let mut pending: Vec<&[EntityDelta]> = deltas.chunks(MAX_DELTAS_PER_MESSAGE).rev().collect();
    let mut sent = 0;
    while let Some(batch) = pending.pop() {
        let message = NetworkMessage::Delta {
            tick,
            deltas: batch.to_vec(),
        };
        match manager.send(&message) {
            Ok(()) => sent += 1,
            Err(NetError::Frame(FrameError::TooLarge { .. })) if batch.len() > 1 => {
                let (head, tail) = batch.split_at(batch.len() / 2);
                pending.push(tail);
                pending.push(head);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{step_player, SandboxWorld};
    use factoryforge_core::ChunkCoord;
    use factoryforge_net::protocol::MAX_ENTITY_STATE_LEN;
    use factoryforge_net::{Encoding, FrameDecoder, FrameSink, PlayerAction, DEFAULT_MAX_FRAME_LEN};
    use glam::Vec2;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Wire {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameSink for Wire {
        fn send_frame(&self, frame: Vec<u8>) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    /// World whose entities tests edit directly.
    struct Stage {
        tick: u64,
        next_id: NetworkEntityId,
        entities: BTreeMap<NetworkEntityId, EntityData>,
        loaded: BTreeSet<ChunkCoord>,
    }

    impl Stage {
        fn new() -> Self {
            Self {
                tick: 0,
                next_id: 1,
                entities: BTreeMap::new(),
                loaded: [ChunkCoord::new(0, 0)].into_iter().collect(),
            }
        }

        fn insert(&mut self, data: EntityData) -> NetworkEntityId {
            let id = self.next_id;
            self.next_id += 1;
            self.entities.insert(id, data);
            id
        }

        /// Add `count` machines inside chunk (0, 0), each with a full
        /// state payload.
        fn add_heavy_machines(&mut self, count: u32) -> Vec<NetworkEntityId> {
            (0..count)
                .map(|i| {
                    let position = Vec2::new((i % 32) as f32 + 0.5, (i / 32) as f32 + 2.5);
                    let mut data = EntityData::new("assembler", position);
                    data.state = vec![255; MAX_ENTITY_STATE_LEN];
                    self.insert(data)
                })
                .collect()
        }
    }

    impl AuthoritativeWorld for Stage {
        fn tick(&self) -> u64 {
            self.tick
        }

        fn entities(&self) -> &BTreeMap<NetworkEntityId, EntityData> {
            &self.entities
        }

        fn loaded_chunks(&self) -> &BTreeSet<ChunkCoord> {
            &self.loaded
        }

        fn spawn_player(&mut self) -> NetworkEntityId {
            self.insert(EntityData::new("player", Vec2::new(0.5, 0.5)))
        }

        fn despawn_player(&mut self, player: NetworkEntityId) {
            self.entities.remove(&player);
        }

        fn apply_action(
            &mut self,
            _player: NetworkEntityId,
            _tick: u64,
            _action: &PlayerAction,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture<W = SandboxWorld> {
        server: ReplicationServer,
        events: ConnectionEvents,
        wire: Arc<Wire>,
        world: W,
    }

    impl Fixture {
        fn new(config: NetConfig) -> Self {
            Self::with_world(config, SandboxWorld::new(99, 2, 10))
        }

        fn step(&mut self) {
            self.world.advance();
            self.server.broadcast(&self.world).unwrap();
        }
    }

    impl Fixture<Stage> {
        /// Advance the stage one tick and broadcast.
        fn tick(&mut self) -> Result<()> {
            self.world.tick += 1;
            self.server.broadcast(&self.world)
        }
    }

    impl<W: AuthoritativeWorld> Fixture<W> {
        fn with_world(config: NetConfig, world: W) -> Self {
            let rules = GameRules {
                seed: 99,
                ..GameRules::default()
            };
            let (server, events) = ReplicationServer::new(config, rules);
            let mut fixture = Self {
                server,
                events,
                wire: Arc::new(Wire::default()),
                world,
            };
            fixture
                .server
                .manager()
                .install_simulated_transport(fixture.wire.clone());
            fixture.pump();
            fixture
        }

        fn pump(&mut self) {
            for event in self.events.drain() {
                self.server.handle_event(event, &mut self.world).unwrap();
            }
        }

        fn from_client(&mut self, message: NetworkMessage) {
            let frame =
                factoryforge_net::encode_frame(&message, Encoding::Json, DEFAULT_MAX_FRAME_LEN)
                    .unwrap();
            self.server.manager().receive_simulated(&frame);
            self.pump();
        }

        fn sent(&self) -> Vec<NetworkMessage> {
            let frames = std::mem::take(&mut *self.wire.frames.lock().unwrap());
            let mut decoder = FrameDecoder::new(Encoding::Json, DEFAULT_MAX_FRAME_LEN);
            for frame in frames {
                decoder.extend(&frame);
            }
            let (messages, err) = decoder.drain_received_messages();
            assert!(err.is_none(), "{err:?}");
            messages
        }

        fn echo_handshake(&mut self) {
            let handshake = match self.sent().into_iter().next() {
                Some(NetworkMessage::Handshake(handshake)) => handshake,
                other => panic!("expected handshake first, got {other:?}"),
            };
            self.from_client(NetworkMessage::Handshake(Handshake {
                player_entity_id: None,
                ..handshake
            }));
        }
    }

    /// Entities a client would hold after applying `messages` in order.
    fn apply_updates(
        view: &mut BTreeMap<NetworkEntityId, EntityData>,
        messages: Vec<NetworkMessage>,
    ) {
        for message in messages {
            match message {
                NetworkMessage::Snapshot { world } | NetworkMessage::Resync { world } => {
                    *view = world.entities.into_iter().collect();
                }
                NetworkMessage::Delta { deltas, .. } => {
                    for delta in deltas {
                        match delta {
                            EntityDelta::Upsert {
                                network_entity_id,
                                data,
                            } => {
                                view.insert(network_entity_id, data);
                            }
                            EntityDelta::Remove { network_entity_id } => {
                                view.remove(&network_entity_id);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn delta_ticks(messages: &[NetworkMessage]) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                NetworkMessage::Delta { tick, .. } => Some(*tick),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn handshake_is_sent_first_with_player() {
        let fixture = Fixture::new(NetConfig::default());
        let player = fixture.server.player().unwrap();

        match fixture.sent().as_slice() {
            [NetworkMessage::Handshake(handshake)] => {
                assert_eq!(handshake.player_entity_id, Some(player));
                assert_eq!(handshake.seed, 99);
                assert_eq!(handshake.version, PROTOCOL_VERSION);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(fixture.world.entities().contains_key(&player));
        assert!(!fixture.server.is_synchronized());
    }

    #[test]
    fn traffic_before_handshake_closes_connection() {
        let mut fixture = Fixture::new(NetConfig::default());
        let player = fixture.server.player().unwrap();

        fixture.from_client(NetworkMessage::Ping { timestamp: 1 });

        assert_eq!(fixture.server.manager().current_connection(), None);
        assert_eq!(fixture.server.player(), None);
        assert!(!fixture.world.entities().contains_key(&player));
    }

    #[test]
    fn mismatched_seed_is_rejected() {
        let mut fixture = Fixture::new(NetConfig::default());
        fixture.sent();
        fixture.from_client(NetworkMessage::Handshake(Handshake {
            version: PROTOCOL_VERSION,
            schema_hash: compute_schema_hash(),
            seed: 1,
            rules: GameRules {
                seed: 1,
                ..GameRules::default()
            },
            player_entity_id: None,
        }));
        assert_eq!(fixture.server.manager().current_connection(), None);
    }

    #[test]
    fn echo_with_conflicting_seeds_is_rejected() {
        let mut fixture = Fixture::new(NetConfig::default());
        let handshake = match fixture.sent().into_iter().next() {
            Some(NetworkMessage::Handshake(handshake)) => handshake,
            other => panic!("expected handshake, got {other:?}"),
        };
        let player = fixture.server.player().unwrap();

        let mut rules = handshake.rules.clone();
        rules.seed += 1;
        fixture.from_client(NetworkMessage::Handshake(Handshake {
            rules,
            player_entity_id: None,
            ..handshake
        }));

        assert_eq!(fixture.server.manager().current_connection(), None);
        assert!(!fixture.world.entities().contains_key(&player));
    }

    #[test]
    fn echo_with_different_rules_is_rejected() {
        let mut fixture = Fixture::new(NetConfig::default());
        let handshake = match fixture.sent().into_iter().next() {
            Some(NetworkMessage::Handshake(handshake)) => handshake,
            other => panic!("expected handshake, got {other:?}"),
        };

        let mut rules = handshake.rules.clone();
        rules.max_players += 1;
        fixture.from_client(NetworkMessage::Handshake(Handshake {
            rules,
            player_entity_id: None,
            ..handshake
        }));

        assert_eq!(fixture.server.manager().current_connection(), None);
        assert!(!fixture.server.is_synchronized());
    }

    #[test]
    fn snapshot_then_deltas() {
        let mut fixture = Fixture::new(NetConfig::default());
        fixture.echo_handshake();
        assert!(fixture.server.is_synchronized());

        fixture.step();
        let sent = fixture.sent();
        assert!(matches!(sent.as_slice(), [NetworkMessage::Snapshot { .. }]));

        // Buildings are idle this early, so nothing else goes out.
        fixture.from_client(NetworkMessage::Ack { message_id: 1 });
        fixture.step();
        assert!(fixture.sent().is_empty());
        assert_eq!(fixture.server.last_acked_tick(), Some(1));
    }

    #[test]
    fn move_command_is_acked_and_replicated() {
        let mut fixture = Fixture::new(NetConfig::default());
        fixture.echo_handshake();
        fixture.step();
        fixture.sent();
        let player = fixture.server.player().unwrap();

        let direction = Vec2::new(0.0, 1.0);
        fixture.from_client(NetworkMessage::Command {
            tick: 5,
            action: PlayerAction::Move { direction },
        });
        assert_eq!(
            fixture.sent(),
            vec![NetworkMessage::Ack { message_id: 5 }]
        );
        assert_eq!(fixture.server.last_command_tick(), Some(5));

        fixture.step();
        let expected = step_player(Vec2::new(0.5, 0.5), direction);
        let moved = fixture.sent().into_iter().any(|msg| match msg {
            NetworkMessage::Delta { deltas, .. } => deltas.iter().any(|delta| {
                matches!(delta, factoryforge_net::EntityDelta::Upsert { network_entity_id, data }
                    if *network_entity_id == player && data.position == expected)
            }),
            _ => false,
        });
        assert!(moved);
    }

    #[test]
    fn ping_is_answered() {
        let mut fixture = Fixture::new(NetConfig::default());
        fixture.echo_handshake();
        fixture.from_client(NetworkMessage::Ping { timestamp: 1234 });
        assert_eq!(
            fixture.sent(),
            vec![NetworkMessage::Pong { timestamp: 1234 }]
        );
    }

    #[test]
    fn unacknowledged_updates_force_resync() {
        let config = NetConfig {
            resync_after_ticks: 5,
            ..NetConfig::default()
        };
        let mut fixture = Fixture::new(config);
        fixture.echo_handshake();
        fixture.step(); // snapshot, never acked
        fixture.sent();

        for _ in 0..5 {
            fixture.step();
        }
        let sent = fixture.sent();
        assert!(sent
            .iter()
            .any(|msg| matches!(msg, NetworkMessage::Resync { .. })));
        assert_eq!(fixture.server.resync_count(), 1);
    }

    #[test]
    fn acked_updates_do_not_resync() {
        let config = NetConfig {
            resync_after_ticks: 5,
            ..NetConfig::default()
        };
        let mut fixture = Fixture::new(config);
        fixture.echo_handshake();
        fixture.step();
        fixture.sent();
        let snapshot_tick = fixture.world.tick();
        fixture.from_client(NetworkMessage::Ack {
            message_id: snapshot_tick,
        });

        for _ in 0..20 {
            fixture.step();
        }
        assert_eq!(fixture.server.resync_count(), 0);
    }

    #[test]
    fn unanswered_handshake_is_resent() {
        let config = NetConfig {
            handshake_resend_ticks: 3,
            ..NetConfig::default()
        };
        let mut fixture = Fixture::new(config);
        fixture.sent();

        for _ in 0..3 {
            fixture.step();
        }
        assert!(matches!(
            fixture.sent().as_slice(),
            [NetworkMessage::Handshake(_)]
        ));
    }

    #[test]
    fn disconnect_despawns_player() {
        let mut fixture = Fixture::new(NetConfig::default());
        let player = fixture.server.player().unwrap();
        fixture.server.kick(&mut fixture.world);

        assert!(!fixture.world.entities().contains_key(&player));
        assert_eq!(fixture.server.player(), None);
    }

    #[test]
    fn new_connection_replaces_session() {
        let mut fixture = Fixture::new(NetConfig::default());
        let first = fixture.server.player().unwrap();

        fixture
            .server
            .manager()
            .install_simulated_transport(fixture.wire.clone());
        fixture.pump();

        let second = fixture.server.player().unwrap();
        assert_ne!(first, second);
        assert!(!fixture.world.entities().contains_key(&first));
    }

    #[test]
    fn oversized_delta_is_split_across_frames() {
        let mut fixture = Fixture::with_world(NetConfig::default(), Stage::new());
        fixture.echo_handshake();
        fixture.tick().unwrap();
        let mut view = BTreeMap::new();
        apply_updates(&mut view, fixture.sent());
        fixture.from_client(NetworkMessage::Ack { message_id: 1 });

        fixture.world.add_heavy_machines(100);
        fixture.tick().unwrap();
        let sent = fixture.sent();

        assert!(delta_ticks(&sent).len() > 1);
        assert!(delta_ticks(&sent).iter().all(|tick| *tick == 2));
        apply_updates(&mut view, sent);
        assert_eq!(&view, fixture.world.entities());
    }

    #[test]
    fn partially_acked_tick_forces_resync() {
        let config = NetConfig {
            resync_after_ticks: 5,
            ..NetConfig::default()
        };
        let mut fixture = Fixture::with_world(config, Stage::new());
        fixture.echo_handshake();
        fixture.tick().unwrap();
        fixture.sent();
        fixture.from_client(NetworkMessage::Ack { message_id: 1 });

        fixture.world.add_heavy_machines(100);
        fixture.tick().unwrap();
        let batches = delta_ticks(&fixture.sent()).len();
        assert!(batches > 1);
        // Every batch but the last arrives.
        for _ in 1..batches {
            fixture.from_client(NetworkMessage::Ack { message_id: 2 });
        }

        for _ in 0..5 {
            fixture.tick().unwrap();
        }
        assert!(fixture
            .sent()
            .iter()
            .any(|msg| matches!(msg, NetworkMessage::Resync { .. })));
        assert_eq!(fixture.server.resync_count(), 1);
    }

    #[test]
    fn fully_acked_split_tick_does_not_resync() {
        let config = NetConfig {
            resync_after_ticks: 5,
            ..NetConfig::default()
        };
        let mut fixture = Fixture::with_world(config, Stage::new());
        fixture.echo_handshake();
        fixture.tick().unwrap();
        fixture.sent();
        fixture.from_client(NetworkMessage::Ack { message_id: 1 });

        fixture.world.add_heavy_machines(100);
        fixture.tick().unwrap();
        for _ in delta_ticks(&fixture.sent()) {
            fixture.from_client(NetworkMessage::Ack { message_id: 2 });
        }

        for _ in 0..10 {
            fixture.tick().unwrap();
        }
        assert_eq!(fixture.server.resync_count(), 0);
    }

    #[test]
    fn oversized_snapshot_defers_the_rest_to_deltas() {
        let mut stage = Stage::new();
        stage.add_heavy_machines(100);
        let mut fixture = Fixture::with_world(NetConfig::default(), stage);
        fixture.echo_handshake();

        fixture.tick().unwrap();
        let sent = fixture.sent();
        match sent.as_slice() {
            [NetworkMessage::Snapshot { world }] => {
                assert!(!world.entities.is_empty());
                assert!(world.entities.len() < fixture.world.entities().len());
            }
            other => panic!("expected one snapshot, got {} messages", other.len()),
        }
        let mut view = BTreeMap::new();
        apply_updates(&mut view, sent);
        fixture.from_client(NetworkMessage::Ack { message_id: 1 });

        fixture.tick().unwrap();
        let sent = fixture.sent();
        assert!(delta_ticks(&sent).iter().all(|tick| *tick == 2));
        apply_updates(&mut view, sent);
        assert_eq!(&view, fixture.world.entities());
        assert_eq!(fixture.server.resync_count(), 0);
    }

    #[test]
    fn failed_send_is_repaired_by_resync() {
        let config = NetConfig {
            max_frame_len: 4096,
            ..NetConfig::default()
        };
        let mut fixture = Fixture::with_world(config, Stage::new());
        fixture.echo_handshake();
        fixture.tick().unwrap();
        let mut view = BTreeMap::new();
        apply_updates(&mut view, fixture.sent());
        fixture.from_client(NetworkMessage::Ack { message_id: 1 });

        // A single entity larger than a frame cannot be sent at all.
        let machine = fixture.world.add_heavy_machines(1)[0];
        assert!(fixture.tick().is_err());
        assert!(fixture.sent().is_empty());

        if let Some(data) = fixture.world.entities.get_mut(&machine) {
            data.state = vec![1, 2, 3];
        }
        fixture.tick().unwrap();
        let sent = fixture.sent();
        assert!(matches!(sent.first(), Some(NetworkMessage::Resync { .. })));
        assert_eq!(fixture.server.resync_count(), 1);
        apply_updates(&mut view, sent);
        assert_eq!(&view, fixture.world.entities());
    }
}
