//! Negotiation from first reset to an active key.

use std::sync::Arc;
use std::time::Duration;

use tlsmux::{
    AuthStatus, Buf, Config, DigestKind, DropReason, Error, Inbound, Key2, KeyDerivation,
    KeyDirection, KeyMethod, KeyStateKind, SeededRng, TlsAuthKey, TlsAuthStandalone,
    TlsMultiplexer,
};

use crate::common::*;

fn exchange_data(pair: &mut Pair) {
    let packet = pair.client_packet(b"ping");
    let (inbound, plain) = pair.to_server(&packet);
    assert_eq!(inbound, Inbound::Data);
    assert_eq!(plain, b"ping");

    let packet = pair.server_packet(b"pong");
    let (inbound, plain) = pair.to_client(&packet);
    assert_eq!(inbound, Inbound::Data);
    assert_eq!(plain, b"pong");
}

#[test]
fn client_server_connect() {
    let mut pair = Pair::new(Config::default());
    pair.connect();

    assert!(pair.client_seen.connected);
    assert!(pair.server_seen.connected);
    assert_eq!(pair.client_seen.key_active, vec![0]);
    assert_eq!(pair.server_seen.key_active, vec![0]);
    assert!(pair.client_seen.errors.is_empty());
    assert!(pair.server_seen.errors.is_empty());

    assert!(pair.client.primary_state() >= Some(KeyStateKind::Active));
    assert!(pair.server.primary_state() >= Some(KeyStateKind::Active));
    assert_eq!(pair.client.common_name(), Some("server"));
    assert_eq!(pair.server.common_name(), Some("client"));
    assert_eq!(pair.client.authentication_status(), AuthStatus::Succeeded);
    assert_eq!(pair.server.authentication_status(), AuthStatus::Succeeded);

    exchange_data(&mut pair);
}

#[test]
fn server_waits_for_client() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(Config::default());
    // Only the server runs. It has nothing to say.
    pair.server.handle_timeout(pair.now).unwrap();
    let mut seen = Seen::default();
    assert!(drain(&mut pair.server, &mut seen).is_empty());
    assert_eq!(pair.server.authentication_status(), AuthStatus::Deferred);
    assert_eq!(pair.server.primary_state(), None);
}

#[test]
fn client_sends_hard_reset_first() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(Config::default());
    pair.client.handle_timeout(pair.now).unwrap();
    let mut seen = Seen::default();
    let packets = drain(&mut pair.client, &mut seen);

    assert_eq!(packets.len(), 1);
    let (to, p) = &packets[0];
    assert_eq!(*to, server_addr());
    // P_CONTROL_HARD_RESET_CLIENT_V2, key id 0.
    assert_eq!(p[0], 7 << 3);
    assert_eq!(pair.client.authentication_status(), AuthStatus::Deferred);
}

#[test]
fn key_method_1() {
    let config = Config::builder().key_method(KeyMethod::V1).build().unwrap();
    let mut pair = Pair::new(config);
    pair.connect();
    exchange_data(&mut pair);
}

#[test]
fn tls_exporter_keys() {
    let config = Config::builder()
        .key_derivation(KeyDerivation::TlsExporter)
        .build()
        .unwrap();
    let mut pair = Pair::new(config);
    pair.connect();
    exchange_data(&mut pair);
}

#[test]
fn options_strings_exchanged() {
    let config = Config::builder()
        .options_string("V4,dev-type tun,cipher AES-128-CBC")
        .build()
        .unwrap();
    let mut pair = Pair::new(config);
    pair.connect();

    let hash = pair.server.remote_options_hash().expect("options hash");
    assert_eq!(Some(hash), pair.client.remote_options_hash());
}

#[test]
fn options_mismatch_closes() {
    let _ = env_logger::try_init();

    let client = Config::builder().options_string("V4,proto UDPv4").build().unwrap();
    let server = Config::builder().options_string("V4,proto TCPv4").build().unwrap();
    let mut pair = Pair::with_configs(Arc::new(client), Arc::new(server));

    // The server reads the client's key message first and gives up.
    let closed = pair.run_until(200, |p| p.server.is_closed());
    assert!(closed);
    drain(&mut pair.server, &mut pair.server_seen);
    assert!(pair.server_seen.closed);
    assert!(!pair.server_seen.errors.is_empty());
    assert_eq!(pair.server.authentication_status(), AuthStatus::Failed);
    assert!(!pair.client.is_connected());
}

fn tls_auth_configs(seed: u64) -> (Arc<Config>, Arc<Config>) {
    let mut rng = SeededRng::new(Some(seed));
    let key = Key2::random(&mut rng);
    let client = Config::builder()
        .tls_auth(TlsAuthKey {
            key: key.clone(),
            direction: KeyDirection::Inverse,
            digest: DigestKind::Sha256,
        })
        .build()
        .unwrap();
    let server = Config::builder()
        .tls_auth(TlsAuthKey {
            key,
            direction: KeyDirection::Normal,
            digest: DigestKind::Sha256,
        })
        .build()
        .unwrap();
    (Arc::new(client), Arc::new(server))
}

#[test]
fn tls_auth_connect() {
    let (client, server) = tls_auth_configs(5);

    // A server can vet the first datagram before committing to a session.
    let standalone = TlsAuthStandalone::new(&server);

    let mut pair = Pair::with_configs(client, server);
    pair.client.handle_timeout(pair.now).unwrap();
    let mut seen = Seen::default();
    let first = drain(&mut pair.client, &mut seen);
    assert!(standalone.check_initial_packet(&first[0].1));

    let mut tampered = first[0].1.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 1;
    assert!(!standalone.check_initial_packet(&tampered));

    let (inbound, _) = pair.to_server(&first[0].1);
    assert_eq!(inbound, Inbound::Control);

    pair.connect();
    exchange_data(&mut pair);
}

#[test]
fn tls_auth_rejects_wrong_key() {
    let _ = env_logger::try_init();

    let (client, _) = tls_auth_configs(6);
    let (_, server) = tls_auth_configs(7);
    let mut pair = Pair::with_configs(client, server);

    for _ in 0..100 {
        pair.round();
    }
    assert!(!pair.client.is_connected());
    assert_eq!(pair.server.primary_state(), None);
    assert!(pair.server.stats().dropped(DropReason::TlsAuthFailed) > 0);
}

#[test]
fn single_session_refuses_second_client() {
    let _ = env_logger::try_init();

    let config = Arc::new(Config::builder().single_session(true).build().unwrap());
    let mut pair = Pair::with_configs(config.clone(), config.clone());
    pair.connect();

    let mut intruder =
        TlsMultiplexer::new_client(config, server_addr(), LoopbackFactory::new("intruder", 3));
    intruder.handle_timeout(pair.now).unwrap();
    let mut seen = Seen::default();
    let packets = drain(&mut intruder, &mut seen);

    let other: std::net::SocketAddr = "10.0.0.3:40001".parse().unwrap();
    let mut out = Buf::new();
    let inbound = pair
        .server
        .handle_packet(pair.now, other, &packets[0].1, &mut out)
        .unwrap();
    assert_eq!(inbound, Inbound::Dropped(DropReason::Unroutable));

    // The existing tunnel is unaffected.
    exchange_data(&mut pair);
}

#[test]
fn restarted_client_takes_over() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(Config::default());
    pair.connect();

    // Data from the old client still in flight after the takeover.
    let in_flight = pair.client_packet(b"old");
    let old_addr = pair.client_addr;

    // Same client, restarted on a new port with a new session id.
    pair.client = TlsMultiplexer::new_client(
        Arc::new(Config::default()),
        server_addr(),
        LoopbackFactory::new("client", 4),
    );
    pair.client_addr = "10.0.0.2:40002".parse().unwrap();
    pair.client_seen = Seen::default();

    // The server promotes the new session once its key is active.
    let ok = pair.run_until(200, |p| {
        p.client.is_connected() && p.server_seen.key_active.len() == 2
    });
    assert!(ok, "restarted client did not take over");
    exchange_data(&mut pair);

    // The old session lives on as a lame duck until it expires.
    let mut out = Buf::new();
    let inbound = pair
        .server
        .handle_packet(pair.now, old_addr, &in_flight, &mut out)
        .unwrap();
    assert_eq!(inbound, Inbound::Data);
    assert_eq!(&out[..], b"old");
}

#[test]
fn peer_identity_change_disables_tunnel() {
    let _ = env_logger::try_init();

    let config = Arc::new(Config::default());
    let client = TlsMultiplexer::new_client(
        config.clone(),
        server_addr(),
        LoopbackFactory::new("client", 8),
    );
    // The server presents a different name on the second key.
    let server =
        TlsMultiplexer::new_server(config, LoopbackFactory::with_names(&["server", "impostor"], 9));
    let mut pair = Pair::with_endpoints(client, server);
    pair.connect();
    assert_eq!(pair.client.authentication_status(), AuthStatus::Succeeded);
    let in_flight = pair.server_packet(b"old key");

    pair.client.renegotiate(pair.now).unwrap();
    let ok = pair.run_until(200, |p| p.client.authentication_status() == AuthStatus::Failed);
    assert!(ok, "identity change went unnoticed");

    // Every key is out, the one that was fine before included.
    assert_eq!(pair.client.common_name(), Some("server"));
    assert!(!pair.client.is_connected());
    let mut out = Buf::new();
    assert!(matches!(
        pair.client.encrypt(pair.now, b"x", &mut out),
        Err(Error::NotConnected)
    ));
    let (inbound, _) = pair.to_client(&in_flight);
    assert_eq!(inbound, Inbound::Dropped(DropReason::UnknownKeyId));

    // The server sees nothing wrong and moves to the new key, which the
    // client does not accept either.
    let ok = pair.run_until(200, |p| p.server.primary_state() >= Some(KeyStateKind::Active));
    assert!(ok);
    let packet = pair.server_packet(b"new key");
    assert_eq!(packet[0] & 0x07, 1);
    let (inbound, _) = pair.to_client(&packet);
    assert_eq!(inbound, Inbound::Dropped(DropReason::UnknownKeyId));
    assert_eq!(pair.client.authentication_status(), AuthStatus::Failed);
}

#[test]
fn deauthenticate_stops_data() {
    let mut pair = Pair::new(Config::default());
    pair.connect();

    pair.server.deauthenticate();
    assert_eq!(pair.server.authentication_status(), AuthStatus::Failed);
    let mut out = Buf::new();
    assert!(pair.server.encrypt(pair.now, b"x", &mut out).is_err());

    let packet = pair.client_packet(b"refused");
    let (inbound, _) = pair.to_server(&packet);
    assert_eq!(inbound, Inbound::Dropped(DropReason::UnknownKeyId));
}

#[test]
fn handshake_window_expires() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .handshake_window(Duration::from_secs(5))
        .build()
        .unwrap();
    let mut pair = Pair::new(config);
    // Nothing reaches the server.
    pair.impairment.loss = 1.0;

    let closed = pair.run_until(400, |p| p.client.is_closed());
    assert!(closed);
    assert_eq!(pair.client.authentication_status(), AuthStatus::Failed);
}

#[test]
fn keys_reach_normal_op() {
    let config = Config::builder()
        .handshake_window(Duration::from_secs(10))
        .build()
        .unwrap();
    let mut pair = Pair::new(config);
    pair.connect();
    assert_eq!(pair.client.primary_state(), Some(KeyStateKind::Active));

    pair.advance(Duration::from_secs(11));
    assert_eq!(pair.client.primary_state(), Some(KeyStateKind::NormalOp));
    assert_eq!(pair.server.primary_state(), Some(KeyStateKind::NormalOp));
    assert!(pair.client_seen.errors.is_empty());
    assert!(pair.server_seen.errors.is_empty());
    exchange_data(&mut pair);
}

#[test]
fn failed_session_setup_is_dropped() {
    let _ = env_logger::try_init();

    let config = Arc::new(Config::default());
    let client = TlsMultiplexer::new_client(
        config.clone(),
        server_addr(),
        LoopbackFactory::new("client", 10),
    );
    // Enough engines for the first client only.
    let server = TlsMultiplexer::new_server(config.clone(), ExhaustedFactory::new("server", 11, 1));
    let mut pair = Pair::with_endpoints(client, server);
    pair.connect();

    let mut other =
        TlsMultiplexer::new_client(config, server_addr(), LoopbackFactory::new("other", 12));
    other.handle_timeout(pair.now).unwrap();
    let mut seen = Seen::default();
    let packets = drain(&mut other, &mut seen);

    let from: std::net::SocketAddr = "10.0.0.4:40004".parse().unwrap();
    let mut out = Buf::new();
    let inbound = pair
        .server
        .handle_packet(pair.now, from, &packets[0].1, &mut out)
        .unwrap();
    assert_eq!(inbound, Inbound::Dropped(DropReason::SessionSetupFailed));
    assert_eq!(pair.server.stats().dropped(DropReason::SessionSetupFailed), 1);

    assert!(!pair.server.is_closed());
    assert_eq!(pair.server.authentication_status(), AuthStatus::Succeeded);
    exchange_data(&mut pair);
}
