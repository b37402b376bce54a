//! Shared helpers for tunnel integration tests.

#![allow(unused)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use tlsmux::{
    Buf, Config, Inbound, Output, PeerIdentity, Role, SeededRng, TlsEngine, TlsEngineFactory,
    TlsError, TlsMultiplexer,
};

const RECORD_HELLO: u8 = 1;
const RECORD_DATA: u8 = 2;
const RECORD_HEADER: usize = 1 + 4 + 2;

/// Filler in each hello so it spans several control packets.
const HELLO_FILLER: usize = 3000;

/// A pretend TLS engine. Each side sends one large hello record, after
/// which the handshake is complete. Records carry a sequence number and any
/// gap, duplicate or reordering is a fatal error, so the reliable layer
/// underneath must deliver exactly in order.
pub struct LoopbackTls {
    role: Role,
    own_hello: Vec<u8>,
    peer_hello: Option<Vec<u8>>,
    hello_sent: bool,
    out: Vec<u8>,
    in_buf: Vec<u8>,
    send_seq: u32,
    recv_seq: u32,
    plain_in: Vec<u8>,
}

impl LoopbackTls {
    fn new(role: Role, cn: &str, nonce: u64) -> Self {
        let mut hello = Vec::new();
        hello.extend_from_slice(&nonce.to_be_bytes());
        hello.push(cn.len() as u8);
        hello.extend_from_slice(cn.as_bytes());
        hello.extend((0..HELLO_FILLER).map(|i| i as u8));

        let mut tls = LoopbackTls {
            role,
            own_hello: hello,
            peer_hello: None,
            hello_sent: false,
            out: Vec::new(),
            in_buf: Vec::new(),
            send_seq: 0,
            recv_seq: 0,
            plain_in: Vec::new(),
        };
        if role == Role::Client {
            tls.send_hello();
        }
        tls
    }

    fn send_hello(&mut self) {
        let hello = self.own_hello.clone();
        self.record(RECORD_HELLO, &hello);
        self.hello_sent = true;
    }

    fn record(&mut self, kind: u8, data: &[u8]) {
        self.out.push(kind);
        self.out.extend_from_slice(&self.send_seq.to_be_bytes());
        self.out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.out.extend_from_slice(data);
        self.send_seq += 1;
    }

    fn peer_cn(&self) -> Option<String> {
        let hello = self.peer_hello.as_ref()?;
        let len = hello[8] as usize;
        Some(String::from_utf8_lossy(&hello[9..9 + len]).into_owned())
    }
}

impl TlsEngine for LoopbackTls {
    fn feed_ciphertext(&mut self, data: &[u8]) -> Result<(), TlsError> {
        self.in_buf.extend_from_slice(data);
        while self.in_buf.len() >= RECORD_HEADER {
            let kind = self.in_buf[0];
            let seq = u32::from_be_bytes([
                self.in_buf[1],
                self.in_buf[2],
                self.in_buf[3],
                self.in_buf[4],
            ]);
            let len = u16::from_be_bytes([self.in_buf[5], self.in_buf[6]]) as usize;
            if self.in_buf.len() < RECORD_HEADER + len {
                break;
            }
            if seq != self.recv_seq {
                return Err(TlsError::new(format!(
                    "record {} out of sequence, expected {}",
                    seq, self.recv_seq
                )));
            }
            self.recv_seq += 1;
            let body: Vec<u8> = self.in_buf[RECORD_HEADER..RECORD_HEADER + len].to_vec();
            self.in_buf.drain(..RECORD_HEADER + len);

            match kind {
                RECORD_HELLO => {
                    if self.peer_hello.is_some() {
                        return Err(TlsError::new("second hello"));
                    }
                    self.peer_hello = Some(body);
                    if !self.hello_sent {
                        self.send_hello();
                    }
                }
                RECORD_DATA => {
                    if self.peer_hello.is_none() {
                        return Err(TlsError::new("data before hello"));
                    }
                    self.plain_in.extend_from_slice(&body);
                }
                _ => return Err(TlsError::new("unknown record")),
            }
        }
        Ok(())
    }

    fn drain_ciphertext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let n = self.out.len();
        out.append(&mut self.out);
        Ok(n)
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<(), TlsError> {
        if !self.is_handshake_complete() {
            return Err(TlsError::new("write before handshake"));
        }
        for chunk in data.chunks(u16::MAX as usize) {
            self.record(RECORD_DATA, chunk);
        }
        Ok(())
    }

    fn read_plaintext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let n = self.plain_in.len();
        out.append(&mut self.plain_in);
        Ok(n)
    }

    fn is_handshake_complete(&self) -> bool {
        self.hello_sent && self.peer_hello.is_some()
    }

    fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TlsError> {
        let peer = self
            .peer_hello
            .as_ref()
            .ok_or_else(|| TlsError::new("no handshake"))?;
        let (client, server) = match self.role {
            Role::Client => (&self.own_hello, peer),
            Role::Server => (peer, &self.own_hello),
        };
        let mut out = Vec::with_capacity(len);
        let mut counter = 0u32;
        while out.len() < len {
            let block = Sha256::new()
                .chain_update(label.as_bytes())
                .chain_update(counter.to_be_bytes())
                .chain_update(&client[..8])
                .chain_update(&server[..8])
                .finalize();
            out.extend_from_slice(&block);
            counter += 1;
        }
        out.truncate(len);
        Ok(out)
    }

    fn peer_identity(&self) -> Option<PeerIdentity> {
        let cn = self.peer_cn()?;
        let digest = Sha256::digest(cn.as_bytes());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest[..20]);
        Some(PeerIdentity {
            common_name: Some(cn),
            cert_hash: Some(hash),
        })
    }
}

/// Hands out [`LoopbackTls`] engines presenting `names` in turn, repeating
/// the last one.
pub struct LoopbackFactory {
    names: Vec<String>,
    created: usize,
    nonce: u64,
}

impl LoopbackFactory {
    pub fn new(cn: &str, seed: u64) -> Box<Self> {
        Self::with_names(&[cn], seed)
    }

    pub fn with_names(names: &[&str], seed: u64) -> Box<Self> {
        Box::new(LoopbackFactory {
            names: names.iter().map(|n| n.to_string()).collect(),
            created: 0,
            nonce: seed << 32,
        })
    }
}

impl TlsEngineFactory for LoopbackFactory {
    fn create_session(&mut self, role: Role) -> Result<Box<dyn TlsEngine>, TlsError> {
        let idx = self.created.min(self.names.len() - 1);
        self.created += 1;
        self.nonce += 1;
        Ok(Box::new(LoopbackTls::new(role, &self.names[idx], self.nonce)))
    }
}

/// Like [`LoopbackFactory`], but refuses every engine after the first
/// `working` ones.
pub struct ExhaustedFactory {
    inner: Box<LoopbackFactory>,
    working: usize,
}

impl ExhaustedFactory {
    pub fn new(cn: &str, seed: u64, working: usize) -> Box<Self> {
        Box::new(ExhaustedFactory {
            inner: LoopbackFactory::new(cn, seed),
            working,
        })
    }
}

impl TlsEngineFactory for ExhaustedFactory {
    fn create_session(&mut self, role: Role) -> Result<Box<dyn TlsEngine>, TlsError> {
        if self.working == 0 {
            return Err(TlsError::new("out of engines"));
        }
        self.working -= 1;
        self.inner.create_session(role)
    }
}

/// What an endpoint reported through `poll_output`.
#[derive(Default, Debug)]
pub struct Seen {
    pub connected: bool,
    pub key_active: Vec<u8>,
    pub messages: Vec<Vec<u8>>,
    pub closed: bool,
    pub errors: Vec<String>,
    pub inbound: Vec<Inbound>,
}

/// Poll until `Timeout`, collecting packets and recording events.
pub fn drain(endpoint: &mut TlsMultiplexer, seen: &mut Seen) -> Vec<(SocketAddr, Vec<u8>)> {
    let mut packets = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        match endpoint.poll_output(&mut buf) {
            Output::Packet(to, p) => packets.push((to, p.to_vec())),
            Output::Connected => seen.connected = true,
            Output::KeyActive(id) => seen.key_active.push(id),
            Output::ControlMessage(m) => seen.messages.push(m.to_vec()),
            Output::Closed => seen.closed = true,
            Output::Timeout(_) => break,
        }
    }
    packets
}

/// How the simulated network mistreats datagrams.
#[derive(Debug, Clone, Copy, Default)]
pub struct Impairment {
    /// Probability of losing a datagram.
    pub loss: f64,
    /// Deliver every datagram twice.
    pub duplicate: bool,
    /// Deliver each batch back to front.
    pub reorder: bool,
}

pub fn client_addr() -> SocketAddr {
    "10.0.0.2:40000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "10.0.0.1:1194".parse().unwrap()
}

/// A client and a server joined by a simulated link.
pub struct Pair {
    pub client: TlsMultiplexer,
    pub server: TlsMultiplexer,
    pub client_addr: SocketAddr,
    pub now: Instant,
    pub step: Duration,
    pub impairment: Impairment,
    pub client_seen: Seen,
    pub server_seen: Seen,
    rng: SeededRng,
}

impl Pair {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        Self::with_configs(config.clone(), config)
    }

    pub fn with_configs(client_config: Arc<Config>, server_config: Arc<Config>) -> Self {
        Self::with_endpoints(
            TlsMultiplexer::new_client(
                client_config,
                server_addr(),
                LoopbackFactory::new("client", 1),
            ),
            TlsMultiplexer::new_server(server_config, LoopbackFactory::new("server", 2)),
        )
    }

    pub fn with_endpoints(client: TlsMultiplexer, server: TlsMultiplexer) -> Self {
        Pair {
            client,
            server,
            client_addr: client_addr(),
            now: Instant::now(),
            step: Duration::from_millis(50),
            impairment: Impairment::default(),
            client_seen: Seen::default(),
            server_seen: Seen::default(),
            rng: SeededRng::new(Some(99)),
        }
    }

    /// One exchange in each direction, then advance the clock.
    pub fn round(&mut self) {
        if let Err(e) = self.client.handle_timeout(self.now) {
            self.client_seen.errors.push(e.to_string());
        }
        if let Err(e) = self.server.handle_timeout(self.now) {
            self.server_seen.errors.push(e.to_string());
        }

        let to_server = drain(&mut self.client, &mut self.client_seen);
        let from = self.client_addr;
        self.deliver(to_server, from, true);

        let to_client = drain(&mut self.server, &mut self.server_seen);
        self.deliver(to_client, server_addr(), false);

        self.now += self.step;
    }

    fn deliver(&mut self, mut packets: Vec<(SocketAddr, Vec<u8>)>, from: SocketAddr, to_server: bool) {
        if self.impairment.reorder {
            packets.reverse();
        }
        let copies = if self.impairment.duplicate { 2 } else { 1 };
        let mut out = Buf::new();
        for (_, p) in packets {
            for _ in 0..copies {
                if self.impairment.loss > 0.0 && self.rng.random::<f64>() < self.impairment.loss {
                    continue;
                }
                let (ep, seen) = if to_server {
                    (&mut self.server, &mut self.server_seen)
                } else {
                    (&mut self.client, &mut self.client_seen)
                };
                match ep.handle_packet(self.now, from, &p, &mut out) {
                    Ok(inbound) => seen.inbound.push(inbound),
                    Err(e) => seen.errors.push(e.to_string()),
                }
            }
        }
    }

    /// Run rounds until `done` holds. False if it never did.
    pub fn run_until(&mut self, max_rounds: usize, mut done: impl FnMut(&Pair) -> bool) -> bool {
        for _ in 0..max_rounds {
            if done(self) {
                return true;
            }
            self.round();
        }
        done(self)
    }

    pub fn connect(&mut self) {
        let _ = env_logger::try_init();
        let ok = self.run_until(200, |p| p.client.is_connected() && p.server.is_connected());
        // Collect the events from the last exchange.
        self.round();
        assert!(
            ok,
            "no connection: client {:?} server {:?}",
            self.client_seen.errors, self.server_seen.errors
        );
    }

    /// Run for `duration` of simulated time.
    pub fn advance(&mut self, duration: Duration) {
        let until = self.now + duration;
        while self.now < until {
            self.round();
        }
    }

    /// Encrypt on the client and hand the packet back without sending it.
    pub fn client_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut out = Buf::new();
        self.client
            .encrypt(self.now, payload, &mut out)
            .expect("client encrypt");
        out.into_vec()
    }

    pub fn server_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut out = Buf::new();
        self.server
            .encrypt(self.now, payload, &mut out)
            .expect("server encrypt");
        out.into_vec()
    }

    /// Feed a datagram to the server as if from the client.
    pub fn to_server(&mut self, packet: &[u8]) -> (Inbound, Vec<u8>) {
        let mut out = Buf::new();
        let inbound = self
            .server
            .handle_packet(self.now, self.client_addr, packet, &mut out)
            .expect("server handle_packet");
        (inbound, out.into_vec())
    }

    pub fn to_client(&mut self, packet: &[u8]) -> (Inbound, Vec<u8>) {
        let mut out = Buf::new();
        let inbound = self
            .client
            .handle_packet(self.now, server_addr(), packet, &mut out)
            .expect("client handle_packet");
        (inbound, out.into_vec())
    }
}
