#![no_main]

//! Fuzz target for incoming datagrams.
//!
//! Feeds arbitrary bytes to a server, a client, the packet dump and a
//! static key tunnel. Errors are fine, panics are not.

use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tlsmux::{
    Buf, Config, DigestKind, Key2, KeyDirection, Output, PacketDump, Role, SeededRng,
    StaticKeyTunnel, TlsEngine, TlsEngineFactory, TlsError, TlsMultiplexer,
};

/// Refuses every session, so a datagram can only get as far as the
/// codecs and the tls-auth check.
struct NoTls;

impl TlsEngineFactory for NoTls {
    fn create_session(&mut self, _role: Role) -> Result<Box<dyn TlsEngine>, TlsError> {
        Err(TlsError::new("fuzzing"))
    }
}

fuzz_target!(|data: &[u8]| {
    let now = Instant::now();
    let peer: SocketAddr = "127.0.0.1:1194".parse().unwrap();
    let config = Arc::new(Config::default());
    let mut out = Buf::new();

    let _ = PacketDump::new(data, None).to_string();
    let _ = PacketDump::new(data, Some(DigestKind::Sha1)).to_string();

    {
        let mut server = TlsMultiplexer::new_server(config.clone(), Box::new(NoTls));
        let _ = server.handle_packet(now, peer, data, &mut out);
    }

    {
        let mut client = TlsMultiplexer::new_client(config.clone(), peer, Box::new(NoTls));
        let _ = client.handle_timeout(now);
        let mut buf = vec![0u8; 2048];
        for _ in 0..10 {
            if let Output::Timeout(_) = client.poll_output(&mut buf) {
                break;
            }
        }
        let _ = client.handle_packet(now, peer, data, &mut out);
    }

    {
        let key = Key2::random(&mut SeededRng::new(Some(1)));
        if let Ok(mut tunnel) =
            StaticKeyTunnel::new(&config, &key, KeyDirection::Normal, KeyDirection::Inverse)
        {
            let _ = tunnel.decrypt(data, &mut out);
        }
    }
});
