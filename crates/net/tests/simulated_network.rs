//! Connection managers wired together through simulated links.

use factoryforge_net::{
    ConnectionEvent, ConnectionManager, EntityData, EntityDelta, NetConfig, NetworkMessage,
    NetworkPreset, NetworkSimulator, SimulatedLink, SimulatorConfig,
};
use glam::Vec2;
use std::sync::Arc;
use std::time::Duration;

fn messages(events: Vec<ConnectionEvent>) -> Vec<NetworkMessage> {
    events
        .into_iter()
        .filter_map(|event| match event {
            ConnectionEvent::Message { message, .. } => Some(message),
            _ => None,
        })
        .collect()
}

#[test]
fn frames_cross_a_lossless_link() {
    let config = SimulatorConfig {
        packet_loss_ratio: 0.0,
        ..SimulatorConfig::preset(NetworkPreset::Good)
    };
    let link = Arc::new(SimulatedLink::new(NetworkSimulator::new(config)));
    let (sender, _sender_events) = ConnectionManager::new(NetConfig::default());
    let (receiver, mut receiver_events) = ConnectionManager::new(NetConfig::default());
    sender.install_simulated_transport(link.clone());
    receiver.install_simulated_transport(Arc::new(SimulatedLink::new(NetworkSimulator::new(
        SimulatorConfig::default(),
    ))));
    receiver_events.drain();

    let delta = NetworkMessage::Delta {
        tick: 3,
        deltas: vec![EntityDelta::Upsert {
            network_entity_id: 8,
            data: EntityData::new("furnace", Vec2::new(4.0, 4.0)),
        }],
    };
    sender.send(&delta).unwrap();

    // Nothing arrives before the one-way delay.
    assert!(link.advance(Duration::from_millis(1)).is_empty());
    for packet in link.advance(Duration::from_millis(100)) {
        receiver.receive_simulated(&packet);
    }
    assert_eq!(messages(receiver_events.drain()), vec![delta]);
}

#[test]
fn jitter_can_reorder_whole_frames() {
    let config = SimulatorConfig {
        latency_ms: 20.0,
        jitter_ms: 40.0,
        packet_loss_ratio: 0.0,
        seed: 5,
    };
    let link = Arc::new(SimulatedLink::new(NetworkSimulator::new(config)));
    let (sender, _sender_events) = ConnectionManager::new(NetConfig::default());
    let (receiver, mut receiver_events) = ConnectionManager::new(NetConfig::default());
    sender.install_simulated_transport(link.clone());
    receiver.install_simulated_transport(link.clone());
    receiver_events.drain();

    let mut delivered = Vec::new();
    for timestamp in 0..100 {
        sender.send(&NetworkMessage::Ping { timestamp }).unwrap();
        delivered.extend(link.advance(Duration::from_millis(2)));
    }
    delivered.extend(link.flush());

    // Each packet is a whole frame, so reordering never corrupts the stream.
    for packet in delivered {
        receiver.receive_simulated(&packet);
    }
    let stamps: Vec<u64> = messages(receiver_events.drain())
        .into_iter()
        .map(|message| match message {
            NetworkMessage::Ping { timestamp } => timestamp,
            other => panic!("unexpected {other:?}"),
        })
        .collect();

    assert_eq!(stamps.len(), 100);
    assert!(stamps.windows(2).any(|w| w[0] > w[1]));
    let mut sorted = stamps.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..100).collect::<Vec<_>>());
}

#[test]
fn lossy_link_drops_whole_messages() {
    let link = Arc::new(SimulatedLink::new(NetworkSimulator::from_preset(
        NetworkPreset::Terrible,
        9,
    )));
    let (sender, _sender_events) = ConnectionManager::new(NetConfig::default());
    let (receiver, mut receiver_events) = ConnectionManager::new(NetConfig::default());
    sender.install_simulated_transport(link.clone());
    receiver.install_simulated_transport(link.clone());
    receiver_events.drain();

    for timestamp in 0..500 {
        sender.send(&NetworkMessage::Ping { timestamp }).unwrap();
    }
    for packet in link.flush() {
        receiver.receive_simulated(&packet);
    }

    let received = messages(receiver_events.drain()).len() as u64;
    let stats = link.stats();
    assert_eq!(received, stats.packets_delivered);
    assert_eq!(stats.packets_delivered + stats.packets_dropped, 500);
    assert!(stats.packets_dropped > 0);
    assert!(received > 0);
}
