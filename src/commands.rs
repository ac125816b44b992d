use crate::config::AppConfig;
use anyhow::{bail, Result};
use factoryforge_client::ReplicationClient;
use factoryforge_net::{ConnectionState, GameRules, NetworkPreset, SimulatorConfig};
use factoryforge_server::{ReplicationServer, SandboxWorld};
use factoryforge_testkit::{SessionConfig, SessionReport, SimulatedSession};
use glam::Vec2;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Ticks spent on each side of the demo walk.
const WALK_LEG_TICKS: u64 = 60;

/// Demo input: walk a square, one leg per `WALK_LEG_TICKS`.
pub fn square_walk(tick: u64) -> Vec2 {
    match (tick / WALK_LEG_TICKS) % 4 {
        0 => Vec2::X,
        1 => Vec2::Y,
        2 => Vec2::NEG_X,
        _ => Vec2::NEG_Y,
    }
}

fn tick_interval(rules: &GameRules) -> tokio::time::Interval {
    let period = Duration::from_secs_f32(1.0 / rules.tick_rate.max(1.0));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Host the sandbox world until Ctrl-C.
pub async fn serve(config: &AppConfig) -> Result<()> {
    let rules = config.server.rules.clone();
    let mut world = SandboxWorld::new(rules.seed, config.server.world_radius, config.server.buildings);
    let (mut server, mut events) = ReplicationServer::new(config.net.clone(), rules.clone());
    server.listen(config.server.port)?;

    let mut ticks = tick_interval(&rules);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                world.advance();
                if let Err(err) = server.broadcast(&world) {
                    warn!("Broadcast failed: {err:#}");
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                server.handle_event(event, &mut world)?;
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Join a server and walk the demo square for `ticks` ticks.
pub async fn connect(config: &AppConfig, ticks: u64) -> Result<()> {
    let (mut client, mut events) = ReplicationClient::new(config.net.clone());
    client.connect(&config.client.host, config.client.port)?;

    let started = Instant::now();
    let mut interval = tick_interval(&GameRules::default());
    let mut tick = 0;

    while tick < ticks {
        tokio::select! {
            _ = interval.tick() => {
                tick += 1;
                let now_ms = started.elapsed().as_millis() as u64;
                if client.player_position().is_some() {
                    client.send_move(square_walk(tick))?;
                }
                if tick % WALK_LEG_TICKS == 0 && client.is_synchronized() {
                    client.ping(now_ms)?;
                    info!(
                        tick,
                        entities = client.entity_count(),
                        rtt_ms = ?client.smoothed_rtt_ms(),
                        "status"
                    );
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                client.handle_event(event, started.elapsed().as_millis() as u64)?;
                if client.manager().state() == ConnectionState::Failed
                    || client.manager().current_connection().is_none()
                {
                    bail!("connection to {}:{} lost", config.client.host, config.client.port);
                }
            }
        }
    }

    let metrics = client.prediction_metrics();
    info!(
        predictions = metrics.total_predictions,
        snaps = metrics.total_snaps,
        max_error = metrics.max_error_distance,
        "session finished"
    );
    client.disconnect();
    Ok(())
}

/// Options for [`simulate`].
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub preset: Option<NetworkPreset>,
    pub ticks: u64,
    pub seed: Option<u64>,
    pub report: Option<PathBuf>,
}

/// Play a session over a simulated link and print its statistics.
pub fn simulate(config: &AppConfig, options: SimulateOptions) -> Result<SessionReport> {
    let seed = options.seed.unwrap_or(config.server.rules.seed);
    let link = match options.preset {
        Some(preset) => SimulatorConfig::preset(preset).with_seed(seed),
        None => config.simulator.clone().with_seed(seed),
    };
    let name = options
        .preset
        .map_or_else(|| "configured".to_string(), |p| format!("{p:?}").to_lowercase());

    let mut session = SimulatedSession::new(SessionConfig {
        name,
        net: config.net.clone(),
        rules: GameRules {
            seed,
            ..config.server.rules.clone()
        },
        link,
        preset: options.preset,
        world_radius: config.server.world_radius,
        buildings: config.server.buildings,
        ..SessionConfig::default()
    })?;

    session.run(options.ticks, |tick| Some(square_walk(tick)))?;
    let settled = session.settle(config.net.resync_after_ticks.saturating_mul(4))?;
    let report = session.report();
    if !settled {
        warn!("Client had not converged when the simulation ended");
    }

    println!("session      {}", report.name);
    println!("ticks        {}", report.ticks);
    println!("converged    {}", report.converged);
    println!("entities     {}", report.client_entities);
    println!("resyncs      {}", report.resyncs);
    match report.smoothed_rtt_ms {
        Some(rtt) => println!("rtt          {rtt:.1} ms"),
        None => println!("rtt          n/a"),
    }
    println!(
        "prediction   {} predicted, {} confirmed, {} corrected (max error {:.3}, accuracy {:.1}%)",
        report.prediction.predictions,
        report.prediction.matches,
        report.prediction.snaps,
        report.prediction.max_error,
        report.prediction_accuracy() * 100.0
    );
    for (label, link) in [("uplink", &report.uplink), ("downlink", &report.downlink)] {
        println!(
            "{label:<12} {} sent, {} delivered, {} dropped, {} bytes",
            link.packets_sent, link.packets_delivered, link.packets_dropped, link.bytes_sent
        );
    }

    if let Some(path) = &options.report {
        report.write_json(path)?;
        info!("Report written to {}", path.display());
    }
    Ok(report)
}
