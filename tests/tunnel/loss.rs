//! Negotiation over a link that loses, duplicates and reorders datagrams.

use std::time::Duration;

use tlsmux::{Config, Inbound, KeyStateKind};

use crate::common::*;

fn impaired_config() -> Config {
    Config::builder()
        .packet_timeout(Duration::from_millis(500))
        .handshake_window(Duration::from_secs(600))
        .build()
        .unwrap()
}

fn connect_impaired(impairment: Impairment) -> Pair {
    connect_impaired_with(impaired_config(), impairment)
}

fn connect_impaired_with(config: Config, impairment: Impairment) -> Pair {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(config);
    pair.impairment = impairment;

    let ok = pair.run_until(10_000, |p| p.client.is_connected() && p.server.is_connected());
    assert!(
        ok,
        "no connection: client {:?} server {:?}",
        pair.client_seen.errors, pair.server_seen.errors
    );
    assert!(pair.client_seen.errors.is_empty());
    assert!(pair.server_seen.errors.is_empty());
    pair
}

#[test]
fn handshake_survives_loss() {
    let mut pair = connect_impaired(Impairment {
        loss: 0.1,
        ..Default::default()
    });

    pair.impairment = Impairment::default();
    let packet = pair.client_packet(b"through");
    let (inbound, plain) = pair.to_server(&packet);
    assert_eq!(inbound, Inbound::Data);
    assert_eq!(plain, b"through");
}

#[test]
fn normal_op_reached_under_loss() {
    let config = Config::builder()
        .packet_timeout(Duration::from_millis(500))
        .handshake_window(Duration::from_secs(120))
        .build()
        .unwrap();
    let mut pair = connect_impaired_with(
        config,
        Impairment {
            loss: 0.1,
            ..Default::default()
        },
    );

    pair.advance(Duration::from_secs(121));
    assert_eq!(pair.client.primary_state(), Some(KeyStateKind::NormalOp));
    assert_eq!(pair.server.primary_state(), Some(KeyStateKind::NormalOp));
    assert!(pair.client_seen.errors.is_empty());
    assert!(pair.server_seen.errors.is_empty());

    pair.impairment = Impairment::default();
    let packet = pair.server_packet(b"steady");
    let (inbound, plain) = pair.to_client(&packet);
    assert_eq!(inbound, Inbound::Data);
    assert_eq!(plain, b"steady");
}

#[test]
fn handshake_survives_heavy_loss() {
    connect_impaired(Impairment {
        loss: 0.3,
        ..Default::default()
    });
}

#[test]
fn handshake_survives_duplicates() {
    let pair = connect_impaired(Impairment {
        duplicate: true,
        ..Default::default()
    });
    assert!(pair.server.stats().control_rx > 0);
}

#[test]
fn handshake_survives_reordering() {
    connect_impaired(Impairment {
        reorder: true,
        ..Default::default()
    });
}

#[test]
fn handshake_survives_everything() {
    connect_impaired(Impairment {
        loss: 0.15,
        duplicate: true,
        reorder: true,
    });
}

#[test]
fn retransmits_lost_reset() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(impaired_config());
    pair.client.handle_timeout(pair.now).unwrap();
    let mut seen = Seen::default();
    let first = drain(&mut pair.client, &mut seen);
    assert_eq!(first.len(), 1);

    // Nothing more until the retransmit timer fires.
    pair.now += Duration::from_millis(100);
    pair.client.handle_timeout(pair.now).unwrap();
    assert!(drain(&mut pair.client, &mut seen).is_empty());

    pair.now += Duration::from_secs(1);
    pair.client.handle_timeout(pair.now).unwrap();
    let again = drain(&mut pair.client, &mut seen);
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].1, first[0].1);
}
