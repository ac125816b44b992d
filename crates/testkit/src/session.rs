//! A server and a client wired through two simulated links on a virtual
//! clock.
//!
//! Every step advances the sandbox world by one tick, moves the clock by
//! `tick_ms`, delivers whatever each link releases and lets the server
//! broadcast. Both links are seeded, so a given configuration always plays
//! out the same way.

use crate::report::SessionReport;
use crate::{EventRecord, JsonlSink};
use anyhow::{Context, Result};
use factoryforge_client::ReplicationClient;
use factoryforge_core::SimTick;
use factoryforge_net::{
    ConnectionEvents, EntityData, GameRules, InterestManager, NetConfig, NetworkEntityId,
    NetworkPreset, NetworkSimulator, SimulatedLink, SimulatorConfig, SimulatorStats,
};
use factoryforge_server::{AuthoritativeWorld, ReplicationServer, SandboxWorld};
use glam::Vec2;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Scenario parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Scenario name carried into reports.
    pub name: String,
    /// Settings shared by both hosts.
    pub net: NetConfig,
    /// Session rules; `rules.seed` also seeds the world.
    pub rules: GameRules,
    /// Conditions of both links. The downlink uses `seed + 1`.
    pub link: SimulatorConfig,
    /// Preset the link was built from, for reporting.
    pub preset: Option<NetworkPreset>,
    /// Virtual milliseconds per tick.
    pub tick_ms: u64,
    /// Loaded chunks around the origin.
    pub world_radius: i32,
    /// Buildings scattered at start.
    pub buildings: usize,
    /// Ticks between client pings; 0 disables pinging.
    pub ping_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".into(),
            net: NetConfig::default(),
            rules: GameRules::default(),
            link: SimulatorConfig::default(),
            preset: None,
            tick_ms: 16,
            world_radius: 2,
            buildings: 40,
            ping_interval: 30,
        }
    }
}

impl SessionConfig {
    /// Default scenario over a preset link.
    pub fn with_preset(preset: NetworkPreset, seed: u64) -> Self {
        Self {
            name: format!("{preset:?}").to_lowercase(),
            link: SimulatorConfig::preset(preset).with_seed(seed),
            preset: Some(preset),
            ..Self::default()
        }
    }
}

/// Deterministic two-host session.
pub struct SimulatedSession {
    name: String,
    preset: Option<NetworkPreset>,
    interest: InterestManager,
    server: ReplicationServer,
    server_events: ConnectionEvents,
    client: ReplicationClient,
    client_events: ConnectionEvents,
    world: SandboxWorld,
    uplink: Arc<SimulatedLink>,
    downlink: Arc<SimulatedLink>,
    tick_ms: u64,
    ping_interval: u64,
    ticks: u64,
    now_ms: u64,
    journal: Option<JsonlSink>,
}

impl SimulatedSession {
    /// Build both hosts and connect them. The server's handshake is already
    /// in flight when this returns.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let world = SandboxWorld::new(config.rules.seed, config.world_radius, config.buildings);
        let interest = InterestManager::new(config.net.interest_radius);
        let (server, server_events) = ReplicationServer::new(config.net.clone(), config.rules);
        let (client, client_events) = ReplicationClient::new(config.net);

        let downlink_config = config
            .link
            .clone()
            .with_seed(config.link.seed.wrapping_add(1));
        let uplink = Arc::new(SimulatedLink::new(NetworkSimulator::new(config.link)));
        let downlink = Arc::new(SimulatedLink::new(NetworkSimulator::new(downlink_config)));
        server
            .manager()
            .install_simulated_transport(downlink.clone());
        client.manager().install_simulated_transport(uplink.clone());

        let mut session = Self {
            name: config.name,
            preset: config.preset,
            interest,
            server,
            server_events,
            client,
            client_events,
            world,
            uplink,
            downlink,
            tick_ms: config.tick_ms,
            ping_interval: config.ping_interval,
            ticks: 0,
            now_ms: 0,
            journal: None,
        };
        session.pump_server()?;
        session.pump_client()?;
        Ok(session)
    }

    /// Record notable session events to `sink`.
    pub fn with_journal(mut self, sink: JsonlSink) -> Self {
        self.journal = Some(sink);
        self
    }

    /// Advance one tick, optionally moving the client's player.
    pub fn step(&mut self, input: Option<Vec2>) -> Result<()> {
        let was_synchronized = self.client.is_synchronized();
        let resyncs = self.server.resync_count();
        let snaps = self.client.prediction_metrics().total_snaps;

        self.ticks += 1;
        self.now_ms += self.tick_ms;
        self.world.advance();

        if let Some(direction) = input {
            if self.client.player_position().is_some() {
                self.client.send_move(direction)?;
            }
        }
        if self.ping_interval > 0
            && self.ticks % self.ping_interval == 0
            && self.client.is_synchronized()
        {
            self.client.ping(self.now_ms)?;
        }

        let dt = Duration::from_millis(self.tick_ms);
        for packet in self.uplink.advance(dt) {
            self.server.manager().receive_simulated(&packet);
        }
        self.pump_server()?;
        self.server.broadcast(&self.world)?;

        for packet in self.downlink.advance(dt) {
            self.client.manager().receive_simulated(&packet);
        }
        self.pump_client()?;

        if !was_synchronized && self.client.is_synchronized() {
            self.record("synchronized", "handshake complete")?;
        }
        if self.server.resync_count() > resyncs {
            self.record("resync", "server forced a resync")?;
        }
        let new_snaps = self.client.prediction_metrics().total_snaps - snaps;
        if new_snaps > 0 {
            self.record("correction", &format!("{new_snaps} prediction snap(s)"))?;
        }
        Ok(())
    }

    /// Run `ticks` steps, asking `input` for the movement of each tick.
    pub fn run<F>(&mut self, ticks: u64, mut input: F) -> Result<()>
    where
        F: FnMut(u64) -> Option<Vec2>,
    {
        for _ in 0..ticks {
            let direction = input(self.ticks + 1);
            self.step(direction)?;
        }
        Ok(())
    }

    /// Step without input until the client converges, at most `max_ticks`
    /// times. Returns whether it converged.
    pub fn settle(&mut self, max_ticks: u64) -> Result<bool> {
        for _ in 0..max_ticks {
            if self.is_converged() {
                return Ok(true);
            }
            self.step(None)?;
        }
        let converged = self.is_converged();
        debug!(ticks = self.ticks, converged, "settle finished");
        Ok(converged)
    }

    /// Client view and predicted player both match the server.
    pub fn is_converged(&self) -> bool {
        let tolerance = self.client.manager().config().reconcile_tolerance;
        self.views_match() && self.player_error().is_some_and(|error| error <= tolerance)
    }

    /// Whether every non-player entity the server considers relevant is
    /// replicated to the client with identical data, and nothing else is.
    pub fn views_match(&self) -> bool {
        if !self.client.is_synchronized() {
            return false;
        }
        let player = self.server.player();
        let mut expected = self.server_view();
        let mut actual: BTreeMap<NetworkEntityId, EntityData> = self
            .client
            .entities()
            .into_iter()
            .map(|(id, data)| (id, data.clone()))
            .collect();
        if let Some(player) = player {
            expected.remove(&player);
            actual.remove(&player);
        }
        expected == actual
    }

    /// Distance between the client's predicted player and the server's.
    pub fn player_error(&self) -> Option<f32> {
        let player = self.server.player()?;
        let authoritative = self.world.entities().get(&player)?.position;
        let predicted = self.client.player_position()?;
        Some(predicted.distance(authoritative))
    }

    /// Entities the server should be replicating to the client right now.
    pub fn server_view(&self) -> BTreeMap<NetworkEntityId, EntityData> {
        let Some(observer) = self
            .server
            .player()
            .and_then(|player| self.world.entities().get(&player))
        else {
            return BTreeMap::new();
        };
        let relevant = self
            .interest
            .relevant_chunk_coords(&[observer.tile()], self.world.loaded_chunks());
        self.world
            .entities()
            .iter()
            .filter(|(_, data)| relevant.contains(&data.chunk()))
            .map(|(id, data)| (*id, data.clone()))
            .collect()
    }

    /// Server host.
    pub fn server(&self) -> &ReplicationServer {
        &self.server
    }

    /// Client host.
    pub fn client(&self) -> &ReplicationClient {
        &self.client
    }

    /// Client host, for sending actions directly.
    pub fn client_mut(&mut self) -> &mut ReplicationClient {
        &mut self.client
    }

    /// Authoritative world.
    pub fn world(&self) -> &SandboxWorld {
        &self.world
    }

    /// Ticks stepped so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Virtual time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Client to server traffic.
    pub fn uplink_stats(&self) -> SimulatorStats {
        self.uplink.stats()
    }

    /// Server to client traffic.
    pub fn downlink_stats(&self) -> SimulatorStats {
        self.downlink.stats()
    }

    /// Change both links' conditions mid-session.
    pub fn set_link(&self, config: SimulatorConfig) {
        let downlink = config.clone().with_seed(config.seed.wrapping_add(1));
        self.uplink.set_config(config);
        self.downlink.set_config(downlink);
    }

    /// Summarize the session so far.
    pub fn report(&self) -> SessionReport {
        SessionReport {
            name: self.name.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            preset: self.preset,
            ticks: self.ticks,
            converged: self.is_converged(),
            resyncs: self.server.resync_count(),
            client_entities: self.client.entity_count(),
            smoothed_rtt_ms: self.client.smoothed_rtt_ms(),
            uplink: self.uplink_stats().into(),
            downlink: self.downlink_stats().into(),
            prediction: self.client.prediction_metrics().into(),
        }
    }

    fn pump_server(&mut self) -> Result<()> {
        for event in self.server_events.drain() {
            self.server
                .handle_event(event, &mut self.world)
                .context("server rejected event")?;
        }
        Ok(())
    }

    fn pump_client(&mut self) -> Result<()> {
        for event in self.client_events.drain() {
            self.client
                .handle_event(event, self.now_ms)
                .context("client rejected event")?;
        }
        Ok(())
    }

    fn record(&mut self, kind: &str, payload: &str) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.write(&EventRecord {
                tick: SimTick(self.ticks),
                kind,
                payload,
            })?;
        }
        Ok(())
    }
}
