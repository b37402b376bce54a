//! Data channel: protection, drops and counters.

use std::net::SocketAddr;
use std::sync::Arc;

use tlsmux::{Buf, CipherKind, Config, DigestKind, DropReason, Error, Inbound, KeyMethod};

use crate::common::*;

fn connected(config: Config) -> Pair {
    let mut pair = Pair::new(config);
    pair.connect();
    pair
}

#[test]
fn encrypt_before_connected() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(Config::default());
    let mut out = Buf::new();
    assert!(matches!(
        pair.client.encrypt(pair.now, b"too soon", &mut out),
        Err(Error::NotConnected)
    ));
    assert!(out.is_empty());
}

#[test]
fn replayed_packet_dropped() {
    let mut pair = connected(Config::default());

    let packet = pair.client_packet(b"once");
    assert_eq!(pair.to_server(&packet).0, Inbound::Data);
    assert_eq!(
        pair.to_server(&packet).0,
        Inbound::Dropped(DropReason::Replay)
    );
    assert_eq!(pair.server.stats().dropped(DropReason::Replay), 1);
}

#[test]
fn reordered_packets_within_window() {
    let mut pair = connected(Config::default());

    let packets: Vec<_> = (0..10u8).map(|i| pair.client_packet(&[i])).collect();
    for p in packets.iter().rev() {
        assert_eq!(pair.to_server(p).0, Inbound::Data);
    }
}

#[test]
fn tampered_packet_dropped() {
    let mut pair = connected(Config::default());

    let mut packet = pair.client_packet(b"do not touch");
    let last = packet.len() - 1;
    packet[last] ^= 0x80;
    let (inbound, plain) = pair.to_server(&packet);
    assert_eq!(inbound, Inbound::Dropped(DropReason::HmacFailed));
    assert!(plain.is_empty());
}

#[test]
fn wrong_address_dropped() {
    let mut pair = connected(Config::default());

    let packet = pair.client_packet(b"spoofed");
    let spoofer: SocketAddr = "192.0.2.9:5000".parse().unwrap();
    let mut out = Buf::new();
    let inbound = pair
        .server
        .handle_packet(pair.now, spoofer, &packet, &mut out)
        .unwrap();
    assert_eq!(inbound, Inbound::Dropped(DropReason::AddressMismatch));

    // The real one still gets through, it was not marked as seen.
    assert_eq!(pair.to_server(&packet).0, Inbound::Data);
}

#[test]
fn unknown_key_id_dropped() {
    let mut pair = connected(Config::default());

    let mut packet = pair.client_packet(b"key five");
    packet[0] = (packet[0] & !0x07) | 5;
    assert_eq!(
        pair.to_server(&packet).0,
        Inbound::Dropped(DropReason::UnknownKeyId)
    );
}

#[test]
fn bad_opcodes_dropped() {
    let mut pair = connected(Config::default());

    assert_eq!(pair.to_server(&[]).0, Inbound::Dropped(DropReason::BadOpcode));
    assert_eq!(
        pair.to_server(&[0xf8, 1, 2, 3]).0,
        Inbound::Dropped(DropReason::BadOpcode)
    );
    // A control packet too short to carry a session id.
    assert_eq!(
        pair.to_server(&[4 << 3, 1, 2]).0,
        Inbound::Dropped(DropReason::Malformed)
    );
    assert_eq!(pair.server.stats().total_dropped(), 3);
}

#[test]
fn reset_for_other_key_method_dropped() {
    let _ = env_logger::try_init();

    let client = Config::builder().key_method(KeyMethod::V1).build().unwrap();
    let mut pair = Pair::with_configs(Arc::new(client), Arc::new(Config::default()));
    pair.client.handle_timeout(pair.now).unwrap();
    let mut seen = Seen::default();
    let packets = drain(&mut pair.client, &mut seen);

    // P_CONTROL_HARD_RESET_CLIENT_V1 to a key method 2 server.
    assert_eq!(packets[0].1[0], 1 << 3);
    assert_eq!(
        pair.to_server(&packets[0].1).0,
        Inbound::Dropped(DropReason::BadOpcode)
    );
    assert_eq!(pair.server.primary_state(), None);
}

#[test]
fn stray_control_packet_unroutable() {
    let mut pair = connected(Config::default());

    // P_ACK_V1 from a session nobody knows.
    let mut packet = vec![5 << 3];
    packet.extend_from_slice(&[0x42; 8]);
    packet.push(0);
    assert_eq!(
        pair.to_server(&packet).0,
        Inbound::Dropped(DropReason::Unroutable)
    );
}

#[test]
fn counters() {
    let mut pair = connected(Config::default());

    for _ in 0..3 {
        let packet = pair.client_packet(b"12345");
        assert_eq!(pair.to_server(&packet).0, Inbound::Data);
    }

    let client = pair.client.stats();
    assert_eq!(client.tx_packets, 3);
    assert_eq!(client.tx_bytes, 15);

    let server = pair.server.stats();
    assert_eq!(server.rx_packets, 3);
    assert_eq!(server.rx_bytes, 15);
    assert!(server.control_rx > 0);
    assert_eq!(server.total_dropped(), 0);
}

#[test]
fn cipher_and_digest_choices() {
    let choices = [
        (CipherKind::Aes256Cbc, DigestKind::Sha256, false),
        (CipherKind::Aes128Cfb, DigestKind::Sha1, false),
        (CipherKind::Aes256Ofb, DigestKind::Sha512, true),
        (CipherKind::None, DigestKind::Sha1, false),
    ];
    for (cipher, digest, long_form) in choices {
        let config = Config::builder()
            .cipher(cipher)
            .digest(digest)
            .long_form_packet_id(long_form)
            .build()
            .unwrap();
        let mut pair = connected(config);

        let packet = pair.client_packet(b"payload");
        let (inbound, plain) = pair.to_server(&packet);
        assert_eq!(inbound, Inbound::Data, "{:?}/{:?}", cipher, digest);
        assert_eq!(plain, b"payload");

        let packet = pair.server_packet(b"reply");
        let (inbound, plain) = pair.to_client(&packet);
        assert_eq!(inbound, Inbound::Data, "{:?}/{:?}", cipher, digest);
        assert_eq!(plain, b"reply");
    }
}

#[test]
fn control_messages() {
    let mut pair = connected(Config::default());

    pair.client.send_control_message("PUSH_REQUEST").unwrap();
    let ok = pair.run_until(50, |p| !p.server_seen.messages.is_empty());
    assert!(ok, "control message never arrived");
    assert_eq!(pair.server_seen.messages, vec![b"PUSH_REQUEST".to_vec()]);

    pair.server
        .send_control_message("PUSH_REPLY,route 10.8.0.0 255.255.255.0")
        .unwrap();
    let ok = pair.run_until(50, |p| !p.client_seen.messages.is_empty());
    assert!(ok, "reply never arrived");
    assert_eq!(
        pair.client_seen.messages,
        vec![b"PUSH_REPLY,route 10.8.0.0 255.255.255.0".to_vec()]
    );
}

#[test]
fn control_message_needs_active_key() {
    let _ = env_logger::try_init();

    let mut pair = Pair::new(Config::default());
    pair.round();
    assert!(pair.client.send_control_message("PUSH_REQUEST").is_err());
}
